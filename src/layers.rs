//! Reference layer index.
//!
//! Each base layer (road network, municipal boundaries, localities, census
//! blocks) is wrapped in an R-tree over the bounding boxes of its geometry
//! *parts*: a multi-part feature contributes one tree entry per part, and
//! query results are deduplicated back to features. Attributes are resolved
//! once, while the index is built, and cached on the typed features.
//!
//! Indexes are immutable after construction and shared between analyses.

use std::collections::BTreeSet;
use std::time::Instant;

use geo::{Coord, Geometry};
use log::{info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde_json::Value;

use crate::attributes::{self, AdminClass, Ambito, Properties, SemanticField, SurfaceClass};
use crate::error::{AnalysisError, Result};
use crate::geo_utils::{expand_envelope, LocalProjection};
use crate::geometry::{Corridor, FeaturePart};
use crate::service_area::Population;

/// A raw reference feature as handed over by the layer loader.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerFeature {
    pub id: String,
    pub geometry: Geometry<f64>,
    pub properties: Properties,
}

impl LayerFeature {
    pub fn new(id: impl Into<String>, geometry: Geometry<f64>, properties: Properties) -> Self {
        Self {
            id: id.into(),
            geometry,
            properties,
        }
    }

    /// Parse a GeoJSON FeatureCollection (or a single Feature) into layer
    /// features.
    ///
    /// Features without a geometry are skipped. Features without an id get
    /// their position in the collection as id.
    pub fn from_geojson(layer: &str, value: &Value) -> Result<Vec<LayerFeature>> {
        let invalid = |message: String| AnalysisError::InvalidLayer {
            layer: layer.to_string(),
            message,
        };

        let parsed = geojson::GeoJson::from_json_value(value.clone())
            .map_err(|e| invalid(e.to_string()))?;
        let features = match parsed {
            geojson::GeoJson::FeatureCollection(fc) => fc.features,
            geojson::GeoJson::Feature(f) => vec![f],
            geojson::GeoJson::Geometry(_) => {
                return Err(invalid("expected a Feature or FeatureCollection".to_string()))
            }
        };

        let mut out = Vec::with_capacity(features.len());
        let mut skipped = 0usize;
        for (i, feature) in features.into_iter().enumerate() {
            let Some(geometry) = feature.geometry else {
                skipped += 1;
                continue;
            };
            let geometry = Geometry::<f64>::try_from(geometry.value)
                .map_err(|e| invalid(format!("feature {}: {}", i, e)))?;
            let id = match feature.id {
                Some(geojson::feature::Id::String(s)) => s,
                Some(geojson::feature::Id::Number(n)) => n.to_string(),
                None => i.to_string(),
            };
            out.push(LayerFeature {
                id,
                geometry,
                properties: feature.properties.unwrap_or_default(),
            });
        }

        if skipped > 0 {
            warn!(
                "[Layers] {}: skipped {} features without geometry",
                layer, skipped
            );
        }
        Ok(out)
    }
}

/// A typed, indexable reference feature.
pub trait IndexedFeature {
    fn id(&self) -> &str;
    fn parts(&self) -> &[FeaturePart];
}

/// Road network segment with its resolved classes.
#[derive(Debug, Clone, PartialEq)]
pub struct RoadSegment {
    pub id: String,
    pub parts: Vec<FeaturePart>,
    pub surface: SurfaceClass,
    pub admin: AdminClass,
    /// Raw road-type label (`TIPO_VIAL` and aliases), if present
    pub road_type: Option<String>,
}

impl From<LayerFeature> for RoadSegment {
    fn from(f: LayerFeature) -> Self {
        Self {
            surface: attributes::surface_class(&f.properties),
            admin: attributes::admin_class(&f.properties),
            road_type: attributes::text(&f.properties, SemanticField::RoadType),
            parts: FeaturePart::explode(f.geometry),
            id: f.id,
        }
    }
}

/// Municipal boundary. Name and code fall back to the feature id.
#[derive(Debug, Clone, PartialEq)]
pub struct MunicipalBoundary {
    pub id: String,
    pub name: String,
    pub code: String,
    pub parts: Vec<FeaturePart>,
}

impl From<LayerFeature> for MunicipalBoundary {
    fn from(f: LayerFeature) -> Self {
        Self {
            name: attributes::text(&f.properties, SemanticField::Name)
                .unwrap_or_else(|| f.id.clone()),
            code: attributes::text(&f.properties, SemanticField::Code)
                .unwrap_or_else(|| f.id.clone()),
            parts: FeaturePart::explode(f.geometry),
            id: f.id,
        }
    }
}

/// Locality (point or polygon).
#[derive(Debug, Clone, PartialEq)]
pub struct Locality {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub ambito: Ambito,
    /// Code of the owning municipality, when the layer carries one
    pub municipality_code: Option<String>,
    pub parts: Vec<FeaturePart>,
}

impl From<LayerFeature> for Locality {
    fn from(f: LayerFeature) -> Self {
        Self {
            name: attributes::text(&f.properties, SemanticField::Name)
                .unwrap_or_else(|| f.id.clone()),
            code: attributes::text(&f.properties, SemanticField::LocalityCode),
            ambito: attributes::ambito(&f.properties),
            municipality_code: attributes::text(&f.properties, SemanticField::OwnerMunicipality),
            parts: FeaturePart::explode(f.geometry),
            id: f.id,
        }
    }
}

/// Census block ("manzana") with its population counts.
#[derive(Debug, Clone, PartialEq)]
pub struct CensusBlock {
    pub id: String,
    pub population: Population,
    pub parts: Vec<FeaturePart>,
}

impl From<LayerFeature> for CensusBlock {
    fn from(f: LayerFeature) -> Self {
        Self {
            population: Population::from_properties(&f.properties),
            parts: FeaturePart::explode(f.geometry),
            id: f.id,
        }
    }
}

macro_rules! impl_indexed_feature {
    ($($ty:ty),*) => {
        $(impl IndexedFeature for $ty {
            fn id(&self) -> &str {
                &self.id
            }
            fn parts(&self) -> &[FeaturePart] {
                &self.parts
            }
        })*
    };
}

impl_indexed_feature!(RoadSegment, MunicipalBoundary, Locality, CensusBlock);

/// R-tree entry: the envelope of one part of one feature.
#[derive(Debug, Clone, Copy)]
struct PartEnvelope {
    feature: usize,
    part: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for PartEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Spatial index over one reference layer.
pub struct LayerIndex<T> {
    features: Vec<T>,
    tree: RTree<PartEnvelope>,
}

impl<T: IndexedFeature> LayerIndex<T> {
    /// Build an index from already typed features.
    pub fn build(features: Vec<T>) -> Self {
        let entries: Vec<PartEnvelope> = features
            .iter()
            .enumerate()
            .flat_map(|(fi, f)| {
                f.parts().iter().enumerate().filter_map(move |(pi, p)| {
                    p.envelope().map(|envelope| PartEnvelope {
                        feature: fi,
                        part: pi,
                        envelope,
                    })
                })
            })
            .collect();

        Self {
            features,
            tree: RTree::bulk_load(entries),
        }
    }

    /// Build an index from raw features, resolving attributes once.
    pub fn from_features(name: &str, raw: Vec<LayerFeature>) -> Self
    where
        T: From<LayerFeature>,
    {
        let start = Instant::now();
        let typed: Vec<T> = raw.into_iter().map(T::from).collect();
        let index = Self::build(typed);
        info!(
            "[Layers] Indexed {} {} features ({} parts) in {}ms",
            index.len(),
            name,
            index.tree.size(),
            start.elapsed().as_millis()
        );
        index
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.features.get(idx)
    }

    pub fn features(&self) -> &[T] {
        &self.features
    }

    fn parts_in(&self, envelope: &AABB<[f64; 2]>) -> Vec<PartEnvelope> {
        self.tree
            .locate_in_envelope_intersecting(envelope)
            .copied()
            .collect()
    }

    /// Features whose part bounding box lies within `radius_m` of segment `a`-`b`.
    pub fn candidates_near_segment(&self, a: Coord, b: Coord, radius_m: f64) -> Vec<usize> {
        let segment = AABB::from_corners([a.x, a.y], [b.x, b.y]);
        let search = expand_envelope(&segment, radius_m);
        let set: BTreeSet<usize> = self.parts_in(&search).iter().map(|e| e.feature).collect();
        set.into_iter().collect()
    }

    /// Features within `radius_m` of `point`, ordered by true distance in meters.
    pub fn nearest_within(&self, point: Coord, radius_m: f64) -> Vec<(usize, f64)> {
        let search = expand_envelope(&AABB::from_point([point.x, point.y]), radius_m);
        let proj = LocalProjection::new(point);
        let origin = Coord { x: 0.0, y: 0.0 };

        let mut best: Vec<(usize, f64)> = Vec::new();
        for entry in self.parts_in(&search) {
            let d = self.features[entry.feature].parts()[entry.part]
                .distance_to_point(origin, &proj);
            if d > radius_m {
                continue;
            }
            match best.iter_mut().find(|(f, _)| *f == entry.feature) {
                Some(slot) => slot.1 = slot.1.min(d),
                None => best.push((entry.feature, d)),
            }
        }
        best.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        best
    }

    /// Features with any part overlapping the corridor, in index order.
    pub fn intersecting(&self, corridor: &Corridor) -> Vec<usize> {
        let mut candidates: BTreeSet<(usize, usize)> = BTreeSet::new();
        for line in corridor.lines() {
            for w in line.0.windows(2) {
                let segment = AABB::from_corners([w[0].x, w[0].y], [w[1].x, w[1].y]);
                let search = expand_envelope(&segment, corridor.radius_m());
                candidates.extend(self.parts_in(&search).iter().map(|e| (e.feature, e.part)));
            }
        }

        let mut hits: BTreeSet<usize> = BTreeSet::new();
        for (feature, part) in candidates {
            if hits.contains(&feature) {
                continue;
            }
            if corridor.intersects(&self.features[feature].parts()[part]) {
                hits.insert(feature);
            }
        }
        hits.into_iter().collect()
    }

    /// Features with any part intersecting any of `parts`, in index order.
    pub fn intersecting_parts(&self, parts: &[FeaturePart]) -> Vec<usize> {
        let mut hits: BTreeSet<usize> = BTreeSet::new();
        for query in parts {
            let Some(envelope) = query.envelope() else {
                continue;
            };
            for entry in self.parts_in(&envelope) {
                if hits.contains(&entry.feature) {
                    continue;
                }
                if self.features[entry.feature].parts()[entry.part].intersects(query) {
                    hits.insert(entry.feature);
                }
            }
        }
        hits.into_iter().collect()
    }

    /// Polygon features containing `point` (holes respected), in index order.
    pub fn containing(&self, point: Coord) -> Vec<usize> {
        let at = AABB::from_point([point.x, point.y]);
        let set: BTreeSet<usize> = self
            .parts_in(&at)
            .into_iter()
            .filter(|e| self.features[e.feature].parts()[e.part].contains_point(point))
            .map(|e| e.feature)
            .collect();
        set.into_iter().collect()
    }
}

impl LayerIndex<MunicipalBoundary> {
    /// Look up a municipality by code, falling back to a case-insensitive
    /// name match. Features sharing the code are merged into one boundary.
    pub fn find_municipality(&self, key: &str) -> Option<MunicipalBoundary> {
        let key = key.trim();
        let mut matches: Vec<&MunicipalBoundary> =
            self.features.iter().filter(|m| m.code == key).collect();
        if matches.is_empty() {
            let lower = key.to_lowercase();
            matches = self
                .features
                .iter()
                .filter(|m| m.name.to_lowercase() == lower)
                .collect();
        }
        let first = matches.first()?;
        Some(MunicipalBoundary {
            id: first.id.clone(),
            name: first.name.clone(),
            code: first.code.clone(),
            parts: matches.iter().flat_map(|m| m.parts.iter().cloned()).collect(),
        })
    }
}

/// Layer names as reported in errors and logs.
pub const ROAD_NETWORK: &str = "road_network";
pub const MUNICIPAL_BOUNDARIES: &str = "municipal_boundaries";
pub const LOCALITIES: &str = "localities";
pub const CENSUS_BLOCKS: &str = "census_blocks";

/// The full set of reference layers used by an analysis.
///
/// Road network, municipal boundaries and census blocks are required for an
/// analysis; localities are optional.
#[derive(Default)]
pub struct ReferenceLayers {
    roads: Option<LayerIndex<RoadSegment>>,
    municipalities: Option<LayerIndex<MunicipalBoundary>>,
    localities: Option<LayerIndex<Locality>>,
    census_blocks: Option<LayerIndex<CensusBlock>>,
    localities_have_owner: bool,
}

impl ReferenceLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roads(mut self, features: Vec<LayerFeature>) -> Self {
        self.roads = Some(LayerIndex::from_features(ROAD_NETWORK, features));
        self
    }

    pub fn with_municipalities(mut self, features: Vec<LayerFeature>) -> Self {
        self.municipalities = Some(LayerIndex::from_features(MUNICIPAL_BOUNDARIES, features));
        self
    }

    pub fn with_localities(mut self, features: Vec<LayerFeature>) -> Self {
        self.localities_have_owner = features
            .iter()
            .any(|f| attributes::has_field(&f.properties, SemanticField::OwnerMunicipality));
        if !features.is_empty() && !self.localities_have_owner {
            warn!(
                "[Layers] Locality layer has no owner-municipality field; \
                 localities are attributed by buffer only"
            );
        }
        self.localities = Some(LayerIndex::from_features(LOCALITIES, features));
        self
    }

    pub fn with_census_blocks(mut self, features: Vec<LayerFeature>) -> Self {
        self.census_blocks = Some(LayerIndex::from_features(CENSUS_BLOCKS, features));
        self
    }

    pub fn roads(&self) -> Option<&LayerIndex<RoadSegment>> {
        self.roads.as_ref()
    }

    pub fn municipalities(&self) -> Option<&LayerIndex<MunicipalBoundary>> {
        self.municipalities.as_ref()
    }

    pub fn localities(&self) -> Option<&LayerIndex<Locality>> {
        self.localities.as_ref()
    }

    pub fn census_blocks(&self) -> Option<&LayerIndex<CensusBlock>> {
        self.census_blocks.as_ref()
    }

    /// Whether the locality layer carries an owner-municipality field.
    pub fn localities_have_owner(&self) -> bool {
        self.localities_have_owner
    }

    /// Name of the first required layer that is not loaded.
    pub fn missing_required(&self) -> Option<&'static str> {
        if self.roads.is_none() {
            Some(ROAD_NETWORK)
        } else if self.municipalities.is_none() {
            Some(MUNICIPAL_BOUNDARIES)
        } else if self.census_blocks.is_none() {
            Some(CENSUS_BLOCKS)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::METERS_PER_DEGREE;
    use geo::{line_string, point, polygon, MultiLineString};
    use serde_json::json;

    fn props(v: Value) -> Properties {
        v.as_object().cloned().unwrap_or_default()
    }

    fn road(id: &str, coords: Vec<(f64, f64)>, surface: &str) -> LayerFeature {
        let ls: geo::LineString<f64> = coords.into();
        LayerFeature::new(id, Geometry::LineString(ls), props(json!({ "CONDICION": surface })))
    }

    #[test]
    fn test_empty_layer_queries() {
        let index: LayerIndex<RoadSegment> = LayerIndex::from_features(ROAD_NETWORK, vec![]);
        assert!(index.is_empty());
        let p = Coord { x: 0.0, y: 0.0 };
        assert!(index.candidates_near_segment(p, p, 100.0).is_empty());
        assert!(index.nearest_within(p, 100.0).is_empty());
        assert!(index.containing(p).is_empty());
        assert!(index.intersecting(&Corridor::around(&[p], 100.0)).is_empty());
    }

    #[test]
    fn test_resolves_attributes_at_build() {
        let index: LayerIndex<RoadSegment> = LayerIndex::from_features(
            ROAD_NETWORK,
            vec![road("r1", vec![(0.0, 0.0), (0.01, 0.0)], "Pavimentada")],
        );
        assert_eq!(index.get(0).map(|r| r.surface), Some(SurfaceClass::Paved));
    }

    #[test]
    fn test_multi_part_deduplicated() {
        let mls = MultiLineString::new(vec![
            line_string![(x: 0.0, y: 0.0), (x: 0.001, y: 0.0)],
            line_string![(x: 0.001, y: 0.0), (x: 0.002, y: 0.0)],
        ]);
        let f = LayerFeature::new("m", Geometry::MultiLineString(mls), Properties::new());
        let index: LayerIndex<RoadSegment> = LayerIndex::from_features(ROAD_NETWORK, vec![f]);

        let near = index.nearest_within(Coord { x: 0.001, y: 0.0 }, 10.0);
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].0, 0);
    }

    #[test]
    fn test_nearest_within_orders_by_distance() {
        let off = 20.0 / METERS_PER_DEGREE;
        let index: LayerIndex<RoadSegment> = LayerIndex::from_features(
            ROAD_NETWORK,
            vec![
                road("far", vec![(0.0, 2.0 * off), (0.01, 2.0 * off)], "x"),
                road("near", vec![(0.0, off), (0.01, off)], "x"),
                road("out", vec![(0.0, 10.0 * off), (0.01, 10.0 * off)], "x"),
            ],
        );
        let hits = index.nearest_within(Coord { x: 0.005, y: 0.0 }, 50.0);
        let ids: Vec<&str> = hits.iter().map(|(i, _)| index.features()[*i].id()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert!((hits[0].1 - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_containing_polygon() {
        let poly = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
        let f = LayerFeature::new(
            "14120",
            Geometry::Polygon(poly),
            props(json!({"NOMGEO": "Zapopan", "CVEGEO": "14120"})),
        );
        let index: LayerIndex<MunicipalBoundary> =
            LayerIndex::from_features(MUNICIPAL_BOUNDARIES, vec![f]);
        assert_eq!(index.containing(Coord { x: 0.5, y: 0.5 }), vec![0]);
        assert!(index.containing(Coord { x: 1.5, y: 0.5 }).is_empty());
        assert_eq!(index.features()[0].name, "Zapopan");

        let found = index.find_municipality("zapopan").map(|m| m.code);
        assert_eq!(found.as_deref(), Some("14120"));
        assert!(index.find_municipality("14039").is_none());
    }

    #[test]
    fn test_point_localities() {
        let f = LayerFeature::new(
            "l1",
            Geometry::Point(point!(x: 0.0, y: 0.0)),
            props(json!({"NOMGEO": "San Juan", "AMBITO": "Rural", "CVE_MUN": "120"})),
        );
        let layers = ReferenceLayers::new().with_localities(vec![f]);
        assert!(layers.localities_have_owner());
        let index = layers.localities().map(|l| l.len());
        assert_eq!(index, Some(1));
        assert_eq!(layers.missing_required(), Some(ROAD_NETWORK));
    }

    #[test]
    fn test_from_geojson() {
        let fc = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "id": "r1",
                    "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [0.01, 0.0]]},
                    "properties": {"CONDICION": "Pavimentada"}
                },
                {
                    "type": "Feature",
                    "geometry": null,
                    "properties": {}
                },
                {
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [1.0, 1.0]},
                    "properties": null
                }
            ]
        });
        let features = LayerFeature::from_geojson(ROAD_NETWORK, &fc).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].id, "r1");
        assert_eq!(features[1].id, "2");
        assert!(features[1].properties.is_empty());

        let err = LayerFeature::from_geojson(ROAD_NETWORK, &json!({"type": "Nope"})).unwrap_err();
        assert_eq!(err.reason_code(), "invalid_layer");
    }
}
