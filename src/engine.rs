//! # Analysis Engine
//!
//! Stateful registry of routes and their analysis results.
//!
//! ## Architecture
//!
//! The engine owns:
//! - Registered routes (id, optional municipality code, raw track points)
//! - The current reference layers, shared with in-flight analyses via `Arc`
//! - The analysis configuration, captured when each analysis starts
//! - Per-route analysis state and the latest result
//!
//! Each analysis is a pure pipeline over (route, layers, config); the engine
//! only records state transitions and stores the outcome. Batch analysis runs
//! routes concurrently on the rayon pool (feature `parallel`) and can be
//! cancelled between routes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use geo::Coord;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::composition::{self, AdminBreakdown, SegmentClassification, SurfaceBreakdown};
use crate::error::{AnalysisError, OptionExt, Result};
use crate::layers::{ReferenceLayers, CENSUS_BLOCKS, MUNICIPAL_BOUNDARIES};
use crate::matcher::match_track;
use crate::overlay::{codes_match, overlay, LocalityRef};
use crate::result::{matched_feature, AnalysisResult, MunicipalityRollup};
use crate::service_area;
use crate::track::{Track, TrackPoint};
use crate::AnalysisConfig;

// ============================================================================
// Core Types
// ============================================================================

/// A registered route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub id: String,
    /// Municipality the route is registered to (boundary code or name)
    pub municipio: Option<String>,
    /// Raw points; validated when the route is analyzed
    pub points: Vec<TrackPoint>,
}

impl RouteRecord {
    pub fn new(id: impl Into<String>, municipio: Option<String>, points: Vec<TrackPoint>) -> Self {
        Self {
            id: id.into(),
            municipio,
            points,
        }
    }

    fn belongs_to(&self, municipality: &str) -> bool {
        self.municipio.as_deref().map_or(false, |m| {
            m.trim().eq_ignore_ascii_case(municipality.trim()) || codes_match(m, municipality)
        })
    }
}

/// Per-route analysis state.
///
/// `Pending → Matching → Overlaying → Aggregating → Complete`, or `Failed`
/// from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisState {
    Pending,
    Matching,
    Overlaying,
    Aggregating,
    Complete,
    Failed,
}

/// Cooperative cancellation for batch runs.
///
/// Checked before each route starts; routes already running finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub route_id: String,
    /// Stable reason code, see [`AnalysisError::reason_code`]
    pub reason: String,
    pub message: String,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Routes analyzed successfully
    pub analyzed: usize,
    /// Routes requested
    pub total: usize,
    /// Failed routes, sorted by id
    pub failures: Vec<BatchFailure>,
    /// Routes skipped because the batch was cancelled
    pub cancelled: usize,
}

/// A finished analysis plus the lines its service area was computed from.
#[derive(Debug, Clone)]
pub struct RouteAnalysis {
    pub result: AnalysisResult,
    /// Snapped runs, or the raw track when nothing matched
    pub service_lines: Vec<Vec<Coord>>,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Analyze one route against the given layers and config.
///
/// Pure with respect to its inputs; `on_stage` is told about each stage as it
/// begins.
pub fn analyze_route(
    route: &RouteRecord,
    layers: &ReferenceLayers,
    config: &AnalysisConfig,
    on_stage: impl Fn(AnalysisState),
) -> Result<RouteAnalysis> {
    let (Some(roads), Some(municipalities), Some(blocks)) =
        (layers.roads(), layers.municipalities(), layers.census_blocks())
    else {
        let layer = layers.missing_required().unwrap_or(CENSUS_BLOCKS);
        return Err(AnalysisError::MissingReferenceLayer {
            route_id: Some(route.id.clone()),
            layer: layer.to_string(),
        });
    };

    let track = Track::new(route.points.clone()).map_err(|e| e.for_route(&route.id))?;
    let metrics = track.metrics();
    let coords = track.coords();
    let buffer_m = config.buffer_distance_m;

    on_stage(AnalysisState::Matching);
    let track_match = match_track(&track, roads, buffer_m);
    let composition = composition::compose(&track_match.segments);

    on_stage(AnalysisState::Overlaying);
    let territory = overlay(&coords, municipalities, layers.localities(), buffer_m);

    on_stage(AnalysisState::Aggregating);
    let service_lines = if config.prefer_matched_geometry && !track_match.snapped.is_empty() {
        track_match.snapped.clone()
    } else {
        vec![coords.clone()]
    };
    let municipality = route.municipio.as_deref().and_then(|key| {
        let found = municipalities.find_municipality(key);
        if found.is_none() {
            warn!(
                "[Engine] Route '{}': municipality '{}' not in {}; service area unrestricted",
                route.id, key, MUNICIPAL_BOUNDARIES
            );
        }
        found
    });
    let lines: Vec<&[Coord]> = service_lines.iter().map(Vec::as_slice).collect();
    let area = service_area::analyze(&lines, blocks, municipality.as_ref());

    let result = AnalysisResult {
        distancia_km: metrics.distance_km,
        duracion_min: metrics.duration_min,
        velocidad_promedio_kmh: metrics.avg_speed_kmh,
        velocidad_maxima_kmh: metrics.max_speed_kmh,
        elevacion_min_m: metrics.elevation_min_m,
        elevacion_max_m: metrics.elevation_max_m,
        ganancia_elevacion_m: metrics.elevation_gain_m,
        perdida_elevacion_m: metrics.elevation_loss_m,
        pendiente_promedio_subida: metrics.avg_uphill_slope_pct,
        pendiente_promedio_bajada: metrics.avg_downhill_slope_pct,
        pendiente_maxima: metrics.max_slope_pct,
        puntos_totales: metrics.total_points,

        confianza_matching: track_match.confidence(),
        match_rate_pct: track_match.match_rate_pct(),
        distancia_promedio_match_m: track_match.mean_offset_m,
        tramos_sin_match: track_match.unmatched_edges(),
        distancia_red_km: track_match.matched_length_km,

        superficie: composition.superficie,
        administracion: composition.administracion,
        tipo_vialidad: composition.tipo_vialidad,

        num_municipios: territory.municipios.len(),
        municipios_atravesados: territory.municipios,
        localidades_urbanas: territory.total_urbanas,
        localidades_rurales: territory.total_rurales,
        localidades_sin_municipio: territory.localidades_sin_municipio,

        matched_geojson: matched_feature(&track_match, &coords),
        segmentos_superficie: composition::classified_segments(
            &track_match.segments,
            roads,
            SegmentClassification::Surface,
        ),
        segmentos_administracion: composition::classified_segments(
            &track_match.segments,
            roads,
            SegmentClassification::Administration,
        ),

        area_servicio: area,
        buffer_distance_m: buffer_m,
    };

    Ok(RouteAnalysis {
        result,
        service_lines,
    })
}

// ============================================================================
// Analysis Engine
// ============================================================================

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reference layers tagged with the generation they were installed in.
struct LayerGeneration {
    generation: u64,
    layers: Arc<ReferenceLayers>,
}

/// Inputs captured when an analysis starts.
struct AnalysisTicket {
    generation: u64,
    route: Arc<RouteRecord>,
    layers: Arc<ReferenceLayers>,
    config: AnalysisConfig,
}

/// Route registry, result store and batch runner.
///
/// Lock order: results, states, layers, routes.
pub struct AnalysisEngine {
    layers: RwLock<LayerGeneration>,
    config: RwLock<AnalysisConfig>,
    routes: RwLock<BTreeMap<String, Arc<RouteRecord>>>,
    results: Mutex<BTreeMap<String, Arc<RouteAnalysis>>>,
    states: Mutex<BTreeMap<String, AnalysisState>>,
}

impl Default for AnalysisEngine {
    fn default() -> Self {
        Self::new(ReferenceLayers::new())
    }
}

impl AnalysisEngine {
    /// Create an engine over the given layers with the default config.
    pub fn new(layers: ReferenceLayers) -> Self {
        Self {
            layers: RwLock::new(LayerGeneration {
                generation: 0,
                layers: Arc::new(layers),
            }),
            config: RwLock::new(AnalysisConfig::default()),
            routes: RwLock::new(BTreeMap::new()),
            results: Mutex::new(BTreeMap::new()),
            states: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_config(layers: ReferenceLayers, config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        let engine = Self::new(layers);
        *engine.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(engine)
    }

    // ------------------------------------------------------------------------
    // Configuration and layers
    // ------------------------------------------------------------------------

    /// Current configuration.
    pub fn config(&self) -> AnalysisConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration. Running analyses keep the config they
    /// started with.
    pub fn set_config(&self, config: AnalysisConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    /// Set the matching/overlay buffer, in meters.
    pub fn set_buffer_distance(&self, meters: f64) -> Result<()> {
        let mut config = self.config();
        config.buffer_distance_m = meters;
        self.set_config(config)?;
        info!("[Engine] Buffer distance set to {}m", meters);
        Ok(())
    }

    /// Swap in a new generation of reference layers.
    ///
    /// Existing results were computed against the old layers; they are
    /// dropped and every route goes back to `Pending`. Analyses still running
    /// against the old layers do not store their results.
    pub fn replace_layers(&self, layers: ReferenceLayers) {
        let mut results = lock(&self.results);
        let mut states = lock(&self.states);
        let generation = {
            let mut current = self.layers.write().unwrap_or_else(PoisonError::into_inner);
            current.generation += 1;
            current.layers = Arc::new(layers);
            current.generation
        };
        results.clear();
        states.clear();
        for id in self.route_ids() {
            states.insert(id, AnalysisState::Pending);
        }
        info!(
            "[Engine] Reference layers replaced (generation {}); {} routes pending",
            generation,
            states.len()
        );
    }

    fn layers(&self) -> Arc<ReferenceLayers> {
        Arc::clone(&self.layers.read().unwrap_or_else(PoisonError::into_inner).layers)
    }

    fn generation(&self) -> u64 {
        self.layers.read().unwrap_or_else(PoisonError::into_inner).generation
    }

    // ------------------------------------------------------------------------
    // Route registry
    // ------------------------------------------------------------------------

    /// Register or replace a route. A replaced route loses its result, and
    /// an analysis still running on the old record does not store one.
    pub fn register_route(&self, route: RouteRecord) {
        let id = route.id.clone();
        let mut results = lock(&self.results);
        let mut states = lock(&self.states);
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(route));
        results.remove(&id);
        states.insert(id.clone(), AnalysisState::Pending);
        debug!("[Engine] Registered route '{}'", id);
    }

    /// Remove a route and its result.
    pub fn remove_route(&self, id: &str) -> Result<()> {
        let mut results = lock(&self.results);
        let mut states = lock(&self.states);
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_route_not_found(id)?;
        results.remove(id);
        states.remove(id);
        debug!("[Engine] Removed route '{}'", id);
        Ok(())
    }

    /// Registered route ids, sorted.
    pub fn route_ids(&self) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn route(&self, id: &str) -> Result<Arc<RouteRecord>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_route_not_found(id)
    }

    /// Latest result of a route, if its last analysis completed. A previous
    /// result stays visible while a re-analysis runs.
    pub fn get_result(&self, id: &str) -> Option<AnalysisResult> {
        lock(&self.results).get(id).map(|a| a.result.clone())
    }

    pub fn state_of(&self, id: &str) -> Option<AnalysisState> {
        lock(&self.states).get(id).copied()
    }

    /// Whether the layers and route record an analysis started from are
    /// still the current ones. Callers hold the results or states lock.
    fn is_current(&self, ticket: &AnalysisTicket) -> bool {
        ticket.generation == self.generation()
            && self
                .routes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&ticket.route.id)
                .map_or(false, |r| Arc::ptr_eq(r, &ticket.route))
    }

    fn set_stage(&self, ticket: &AnalysisTicket, state: AnalysisState) {
        let mut states = lock(&self.states);
        if self.is_current(ticket) {
            debug!("[Engine] Route '{}' -> {:?}", ticket.route.id, state);
            states.insert(ticket.route.id.clone(), state);
        }
    }

    // ------------------------------------------------------------------------
    // Analysis
    // ------------------------------------------------------------------------

    /// Analyze one route from scratch, replacing any previous result.
    ///
    /// The previous result stays in place until the new one completes. On
    /// failure it is dropped and the route is `Failed`. If the layers are
    /// replaced or the route re-registered while this runs, the result is
    /// returned but not stored.
    pub fn analyze(&self, id: &str) -> Result<AnalysisResult> {
        let ticket = self.begin(id)?;
        let start = Instant::now();
        let outcome = analyze_route(&ticket.route, &ticket.layers, &ticket.config, |stage| {
            self.set_stage(&ticket, stage)
        });
        self.commit(ticket, outcome, start)
    }

    fn begin(&self, id: &str) -> Result<AnalysisTicket> {
        let route = self.route(id)?;
        let (generation, layers) = {
            let current = self.layers.read().unwrap_or_else(PoisonError::into_inner);
            (current.generation, Arc::clone(&current.layers))
        };
        let ticket = AnalysisTicket {
            generation,
            route,
            layers,
            config: self.config(),
        };
        self.set_stage(&ticket, AnalysisState::Pending);
        Ok(ticket)
    }

    fn commit(
        &self,
        ticket: AnalysisTicket,
        outcome: Result<RouteAnalysis>,
        start: Instant,
    ) -> Result<AnalysisResult> {
        let id = ticket.route.id.as_str();
        let mut results = lock(&self.results);
        let mut states = lock(&self.states);
        let current = self.is_current(&ticket);

        match outcome {
            Ok(analysis) => {
                let result = analysis.result.clone();
                if current {
                    results.insert(id.to_string(), Arc::new(analysis));
                    states.insert(id.to_string(), AnalysisState::Complete);
                    info!(
                        "[Engine] Route '{}' analyzed in {}ms: {:.3} km, confidence {:?}",
                        id,
                        start.elapsed().as_millis(),
                        result.distancia_km,
                        result.confianza_matching.percent()
                    );
                } else {
                    debug!("[Engine] Route '{}' changed during analysis; result not stored", id);
                }
                Ok(result)
            }
            Err(e) => {
                if current {
                    results.remove(id);
                    states.insert(id.to_string(), AnalysisState::Failed);
                }
                warn!("[Engine] Route '{}' failed: {}", id, e);
                Err(e)
            }
        }
    }

    /// Analyze several routes concurrently.
    ///
    /// `None` analyzes every registered route without a completed result.
    /// A failing route does not affect the others.
    pub fn analyze_batch(
        &self,
        route_ids: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let ids: Vec<String> = match route_ids {
            Some(ids) => ids
                .iter()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            None => {
                let registered = self.route_ids();
                let states = lock(&self.states);
                registered
                    .into_iter()
                    .filter(|id| states.get(id) != Some(&AnalysisState::Complete))
                    .collect()
            }
        };

        let start = Instant::now();
        info!("[Engine] Batch analysis of {} routes", ids.len());

        let run = |id: &String| -> Option<Result<()>> {
            if cancel.is_cancelled() {
                return None;
            }
            Some(self.analyze(id).map(|_| ()))
        };

        #[cfg(feature = "parallel")]
        let outcomes: Vec<Option<Result<()>>> = ids.par_iter().map(run).collect();

        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<Option<Result<()>>> = ids.iter().map(run).collect();

        let mut report = BatchReport {
            total: ids.len(),
            ..Default::default()
        };
        for (id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                None => report.cancelled += 1,
                Some(Ok(())) => report.analyzed += 1,
                Some(Err(e)) => report.failures.push(BatchFailure {
                    route_id: id.clone(),
                    reason: e.reason_code().to_string(),
                    message: e.to_string(),
                }),
            }
        }

        info!(
            "[Engine] Batch done in {}ms: {} analyzed, {} failed, {} cancelled",
            start.elapsed().as_millis(),
            report.analyzed,
            report.failures.len(),
            report.cancelled
        );
        report
    }

    // ------------------------------------------------------------------------
    // Municipality rollup
    // ------------------------------------------------------------------------

    /// Aggregate every analyzed route registered to a municipality.
    ///
    /// The service area is the union of the routes' walking buffers, so a
    /// census block near several routes is counted once.
    pub fn municipality_rollup(&self, municipality: &str) -> Result<MunicipalityRollup> {
        let layers = self.layers();
        let municipalities = layers.municipalities().ok_or_missing_layer(MUNICIPAL_BOUNDARIES)?;
        let blocks = layers.census_blocks().ok_or_missing_layer(CENSUS_BLOCKS)?;
        let boundary = municipalities.find_municipality(municipality);

        let registered: Vec<Arc<RouteRecord>> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.belongs_to(municipality))
            .cloned()
            .collect();
        let analyses: Vec<Arc<RouteAnalysis>> = {
            let results = lock(&self.results);
            registered
                .iter()
                .filter_map(|r| results.get(&r.id).cloned())
                .collect()
        };

        let mut superficie = SurfaceBreakdown::default();
        let mut administracion = AdminBreakdown::default();
        let mut distance_km = 0.0;
        let mut durations = Vec::new();
        let mut speeds = Vec::new();
        let mut urban: BTreeSet<String> = BTreeSet::new();
        let mut rural: BTreeSet<String> = BTreeSet::new();

        let code = boundary.as_ref().map_or(municipality, |b| b.code.as_str());
        for a in &analyses {
            let r = &a.result;
            superficie.merge(&r.superficie);
            administracion.merge(&r.administracion);
            distance_km += r.distancia_red_km;
            durations.extend(r.duracion_min.map(|d| d as f64));
            speeds.extend(r.velocidad_promedio_kmh);
            for m in r.municipios_atravesados.iter().filter(|m| codes_match(&m.clave, code)) {
                urban.extend(m.localidades_urbanas.iter().map(LocalityRef::key));
                rural.extend(m.localidades_rurales.iter().map(LocalityRef::key));
            }
        }

        let lines: Vec<&[Coord]> = analyses
            .iter()
            .flat_map(|a| a.service_lines.iter().map(Vec::as_slice))
            .collect();
        let area_servicio = service_area::analyze(&lines, blocks, boundary.as_ref());

        let average = |values: &[f64]| {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };

        info!(
            "[Engine] Rollup '{}': {}/{} routes analyzed, {} served",
            municipality,
            analyses.len(),
            registered.len(),
            area_servicio.served.poblacion_total
        );

        Ok(MunicipalityRollup {
            municipio: municipality.to_string(),
            nombre: boundary.map(|b| b.name),
            rutas_registradas: registered.len(),
            rutas_analizadas: analyses.len(),
            distancia_total_km: distance_km,
            distancia_promedio_km: if analyses.is_empty() {
                0.0
            } else {
                distance_km / analyses.len() as f64
            },
            duracion_promedio_min: average(durations.as_slice()),
            velocidad_promedio_kmh: average(speeds.as_slice()),
            superficie,
            administracion,
            localidades_urbanas: urban.len(),
            localidades_rurales: rural.len(),
            area_servicio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::METERS_PER_DEGREE;
    use crate::layers::LayerFeature;
    use geo::{polygon, Geometry, LineString};
    use serde_json::json;

    const M: f64 = 1.0 / METERS_PER_DEGREE;

    fn layers() -> ReferenceLayers {
        let road: LineString<f64> = vec![(0.0, 0.0), (2000.0 * M, 0.0)].into();
        let muni = polygon![
            (x: -1000.0 * M, y: -1000.0 * M),
            (x: 3000.0 * M, y: -1000.0 * M),
            (x: 3000.0 * M, y: 1000.0 * M),
            (x: -1000.0 * M, y: 1000.0 * M),
        ];
        let block = polygon![
            (x: 500.0 * M, y: 100.0 * M),
            (x: 550.0 * M, y: 100.0 * M),
            (x: 550.0 * M, y: 150.0 * M),
            (x: 500.0 * M, y: 150.0 * M),
        ];
        let props = |v: serde_json::Value| v.as_object().cloned().unwrap_or_default();
        ReferenceLayers::new()
            .with_roads(vec![LayerFeature::new(
                "r1",
                Geometry::LineString(road),
                props(json!({"CONDICION": "Pavimentada"})),
            )])
            .with_municipalities(vec![LayerFeature::new(
                "m1",
                Geometry::Polygon(muni),
                props(json!({"NOMGEO": "Zapopan", "CVEGEO": "14120"})),
            )])
            .with_census_blocks(vec![LayerFeature::new(
                "b1",
                Geometry::Polygon(block),
                props(json!({"POBTOT": 80, "POBFEM": 40, "POBMAS": 40})),
            )])
    }

    fn points(xs: &[f64]) -> Vec<TrackPoint> {
        xs.iter().map(|x| TrackPoint::new(x * M, 5.0 * M)).collect()
    }

    #[test]
    fn test_analyze_and_state() {
        let engine = AnalysisEngine::new(layers());
        engine.register_route(RouteRecord::new(
            "a",
            Some("14120".into()),
            points(&[0.0, 500.0, 1000.0]),
        ));
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Pending));

        let result = engine.analyze("a").unwrap();
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Complete));
        assert_eq!(result.confianza_matching.percent(), Some(100.0));
        assert_eq!(result.area_servicio.served.poblacion_total, 80);
        assert_eq!(result.num_municipios, 1);
        assert_eq!(engine.get_result("a"), Some(result));
    }

    #[test]
    fn test_unknown_route() {
        let engine = AnalysisEngine::new(layers());
        let err = engine.analyze("nope").unwrap_err();
        assert_eq!(err.reason_code(), "route_not_found");
        assert!(engine.remove_route("nope").is_err());
    }

    #[test]
    fn test_failure_drops_previous_result() {
        let engine = AnalysisEngine::new(layers());
        engine.register_route(RouteRecord::new("a", None, points(&[0.0, 500.0])));
        engine.analyze("a").unwrap();

        engine.replace_layers(ReferenceLayers::new());
        let err = engine.analyze("a").unwrap_err();
        assert_eq!(err.reason_code(), "missing_reference_layer");
        assert_eq!(err.route_id(), Some("a"));
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Failed));
        assert!(engine.get_result("a").is_none());
    }

    #[test]
    fn test_buffer_distance_validation() {
        let engine = AnalysisEngine::default();
        assert!(engine.set_buffer_distance(5.0).is_err());
        assert!(engine.set_buffer_distance(501.0).is_err());
        assert!(engine.set_buffer_distance(120.0).is_ok());
        assert_eq!(engine.config().buffer_distance_m, 120.0);
    }

    #[test]
    fn test_batch_defaults_to_unanalyzed() {
        let engine = AnalysisEngine::new(layers());
        engine.register_route(RouteRecord::new("a", None, points(&[0.0, 500.0])));
        engine.register_route(RouteRecord::new("b", None, points(&[0.0, 800.0])));
        engine.analyze("a").unwrap();

        let report = engine.analyze_batch(None, &CancellationToken::new());
        assert_eq!(report.total, 1);
        assert_eq!(report.analyzed, 1);
    }

    #[test]
    fn test_remove_route_drops_result() {
        let engine = AnalysisEngine::new(layers());
        engine.register_route(RouteRecord::new("a", None, points(&[0.0, 500.0])));
        engine.analyze("a").unwrap();
        engine.remove_route("a").unwrap();
        assert!(engine.get_result("a").is_none());
        assert!(engine.state_of("a").is_none());
        assert!(engine.route_ids().is_empty());
    }

    #[test]
    fn test_rollup_requires_layers() {
        let engine = AnalysisEngine::default();
        let err = engine.municipality_rollup("14120").unwrap_err();
        assert_eq!(err.reason_code(), "missing_reference_layer");
        assert_eq!(err.route_id(), None);
    }

    fn run(ticket: &AnalysisTicket) -> Result<RouteAnalysis> {
        analyze_route(&ticket.route, &ticket.layers, &ticket.config, |_| {})
    }

    #[test]
    fn test_prior_result_visible_until_complete() {
        let engine = AnalysisEngine::new(layers());
        engine.register_route(RouteRecord::new("a", None, points(&[0.0, 500.0])));
        let first = engine.analyze("a").unwrap();

        let ticket = engine.begin("a").unwrap();
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Pending));
        assert_eq!(engine.get_result("a"), Some(first.clone()));

        engine.set_stage(&ticket, AnalysisState::Matching);
        assert_eq!(engine.get_result("a"), Some(first.clone()));

        let outcome = run(&ticket);
        engine.commit(ticket, outcome, Instant::now()).unwrap();
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Complete));
        assert_eq!(engine.get_result("a"), Some(first));
    }

    #[test]
    fn test_failed_reanalysis_drops_result_at_commit() {
        let engine = AnalysisEngine::new(layers());
        engine.register_route(RouteRecord::new("a", None, points(&[0.0, 500.0])));
        engine.analyze("a").unwrap();

        let ticket = engine.begin("a").unwrap();
        assert!(engine.get_result("a").is_some());
        let failure = Err(AnalysisError::MalformedTrack {
            route_id: "a".into(),
            message: "bad".into(),
        });
        assert!(engine.commit(ticket, failure, Instant::now()).is_err());
        assert!(engine.get_result("a").is_none());
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Failed));
    }

    #[test]
    fn test_layer_replacement_discards_in_flight_result() {
        let engine = AnalysisEngine::new(layers());
        engine.register_route(RouteRecord::new("a", None, points(&[0.0, 500.0])));

        let ticket = engine.begin("a").unwrap();
        let outcome = run(&ticket);
        engine.replace_layers(ReferenceLayers::new());

        // Late stage updates from the old generation are ignored too
        engine.set_stage(&ticket, AnalysisState::Aggregating);
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Pending));

        assert!(engine.commit(ticket, outcome, Instant::now()).is_ok());
        assert!(engine.get_result("a").is_none());
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Pending));

        let report = engine.analyze_batch(None, &CancellationToken::new());
        assert_eq!(report.total, 1);
    }

    #[test]
    fn test_reregistered_route_discards_in_flight_result() {
        let engine = AnalysisEngine::new(layers());
        engine.register_route(RouteRecord::new("a", None, points(&[0.0, 500.0])));

        let ticket = engine.begin("a").unwrap();
        let outcome = run(&ticket);
        engine.register_route(RouteRecord::new("a", None, points(&[0.0, 1500.0])));

        assert!(engine.commit(ticket, outcome, Instant::now()).is_ok());
        assert!(engine.get_result("a").is_none());
        assert_eq!(engine.state_of("a"), Some(AnalysisState::Pending));

        let r = engine.analyze("a").unwrap();
        assert!((r.distancia_km - 1.5).abs() < 1e-6);
    }
}

