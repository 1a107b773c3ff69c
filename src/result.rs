//! Public result shapes: per-route analysis and per-municipality rollup.
//!
//! Keys are Spanish and stable; consumers (dashboards, exports) read them by
//! name. All maps are ordered so serialization is byte-for-byte repeatable.

use std::collections::BTreeMap;

use geo::{Coord, LineString, MultiLineString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::composition::{AdminBreakdown, SurfaceBreakdown};
use crate::matcher::{MatchConfidence, TrackMatch};
use crate::overlay::TraversedMunicipality;
use crate::service_area::ServiceArea;

/// Analysis of one route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Haversine length of the recorded track
    pub distancia_km: f64,
    pub duracion_min: Option<u64>,
    pub velocidad_promedio_kmh: Option<f64>,
    pub velocidad_maxima_kmh: Option<f64>,
    pub elevacion_min_m: Option<f64>,
    pub elevacion_max_m: Option<f64>,
    pub ganancia_elevacion_m: Option<f64>,
    pub perdida_elevacion_m: Option<f64>,
    pub pendiente_promedio_subida: Option<f64>,
    pub pendiente_promedio_bajada: Option<f64>,
    pub pendiente_maxima: Option<f64>,
    pub puntos_totales: usize,

    /// Matched length over total length, percent; `null` for a zero-length track
    pub confianza_matching: MatchConfidence,
    /// Matched edges over total edges, percent
    pub match_rate_pct: f64,
    pub distancia_promedio_match_m: Option<f64>,
    pub tramos_sin_match: usize,
    /// Matched length
    pub distancia_red_km: f64,

    pub superficie: SurfaceBreakdown,
    pub administracion: AdminBreakdown,
    pub tipo_vialidad: BTreeMap<String, f64>,

    pub municipios_atravesados: Vec<TraversedMunicipality>,
    pub num_municipios: usize,
    pub localidades_urbanas: usize,
    pub localidades_rurales: usize,
    pub localidades_sin_municipio: bool,

    pub matched_geojson: geojson::Feature,
    pub segmentos_superficie: geojson::FeatureCollection,
    pub segmentos_administracion: geojson::FeatureCollection,

    pub area_servicio: ServiceArea,

    /// Buffer the route was matched with
    pub buffer_distance_m: f64,
}

impl AnalysisResult {
    /// Compact JSON serialization.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn line_of(coords: &[Coord]) -> LineString<f64> {
    match coords {
        [only] => LineString::new(vec![*only, *only]),
        _ => LineString::new(coords.to_vec()),
    }
}

/// GeoJSON feature of the snapped track with match quality properties.
///
/// Separate matched runs become a MultiLineString; with nothing matched the
/// geometry is the raw track.
pub fn matched_feature(track_match: &TrackMatch, raw: &[Coord]) -> geojson::Feature {
    let value = match track_match.snapped.as_slice() {
        [] => geojson::Value::from(&line_of(raw)),
        [run] => geojson::Value::from(&line_of(run)),
        runs => geojson::Value::from(&MultiLineString::new(
            runs.iter().map(|r| line_of(r)).collect(),
        )),
    };
    let mut properties = serde_json::Map::new();
    properties.insert(
        "confidence".to_string(),
        track_match
            .confidence()
            .percent()
            .map_or(Value::Null, Value::from),
    );
    properties.insert(
        "match_rate_pct".to_string(),
        Value::from(track_match.match_rate_pct()),
    );

    geojson::Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Aggregate over every analyzed route registered to one municipality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MunicipalityRollup {
    pub municipio: String,
    /// Boundary name, when the municipality is found in the boundary layer
    pub nombre: Option<String>,
    pub rutas_registradas: usize,
    pub rutas_analizadas: usize,
    /// Sum of matched km
    pub distancia_total_km: f64,
    pub distancia_promedio_km: f64,
    pub duracion_promedio_min: Option<f64>,
    pub velocidad_promedio_kmh: Option<f64>,
    pub superficie: SurfaceBreakdown,
    pub administracion: AdminBreakdown,
    /// Distinct localities, by code then name
    pub localidades_urbanas: usize,
    pub localidades_rurales: usize,
    /// Union of all route service areas, restricted to the municipality
    pub area_servicio: ServiceArea,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_match(snapped: Vec<Vec<Coord>>, matched: f64, total: f64) -> TrackMatch {
        TrackMatch {
            segments: vec![],
            matched_length_km: matched,
            total_length_km: total,
            matched_edges: 1,
            total_edges: 2,
            mean_offset_m: Some(3.0),
            snapped,
        }
    }

    #[test]
    fn test_matched_feature_properties() {
        let m = sample_match(
            vec![vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 0.001, y: 0.0 }]],
            0.5,
            1.0,
        );
        let f = matched_feature(&m, &[]);
        let props = f.properties.clone().unwrap_or_default();
        assert_eq!(props["confidence"], Value::from(50.0));
        assert_eq!(props["match_rate_pct"], Value::from(50.0));
        assert!(f.geometry.is_some());
    }

    #[test]
    fn test_no_data_confidence_is_null() {
        let p = Coord { x: 0.0, y: 0.0 };
        let f = matched_feature(&sample_match(vec![], 0.0, 0.0), &[p, p]);
        let props = f.properties.unwrap_or_default();
        assert_eq!(props["confidence"], Value::Null);
    }

    #[test]
    fn test_separate_runs_are_multilinestring() {
        let run = |x: f64| vec![Coord { x, y: 0.0 }, Coord { x: x + 0.001, y: 0.0 }];
        let f = matched_feature(&sample_match(vec![run(0.0), run(0.03)], 0.5, 1.0), &[]);
        match f.geometry.map(|g| g.value) {
            Some(geojson::Value::MultiLineString(lines)) => assert_eq!(lines.len(), 2),
            other => panic!("expected MultiLineString, got {:?}", other),
        }
    }

    #[test]
    fn test_nothing_matched_falls_back_to_raw_track() {
        let raw = vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 0.002, y: 0.0 }];
        let f = matched_feature(&sample_match(vec![], 0.0, 1.0), &raw);
        match f.geometry.map(|g| g.value) {
            Some(geojson::Value::LineString(points)) => assert_eq!(points.len(), 2),
            other => panic!("expected LineString, got {:?}", other),
        }
    }
}
