//! Surface, administration and road-type composition of the matched portion
//! of a route.
//!
//! Every bucket sum equals the matched length. Roads whose class could not be
//! resolved go to the `na` bucket.

use std::collections::BTreeMap;

use geo::{LineString, MultiLineString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attributes::{AdminClass, SurfaceClass};
use crate::geometry::FeaturePart;
use crate::layers::{LayerIndex, RoadSegment};
use crate::matcher::MatchedSegment;

/// Label used for roads without a road-type value.
pub const UNKNOWN_ROAD_TYPE: &str = "N/A";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurfaceBreakdown {
    pub pavimentado_km: f64,
    pub terraceria_km: f64,
    pub na_km: f64,
}

impl SurfaceBreakdown {
    pub fn add(&mut self, class: SurfaceClass, km: f64) {
        match class {
            SurfaceClass::Paved => self.pavimentado_km += km,
            SurfaceClass::Unpaved => self.terraceria_km += km,
            SurfaceClass::Unknown => self.na_km += km,
        }
    }

    pub fn merge(&mut self, other: &SurfaceBreakdown) {
        self.pavimentado_km += other.pavimentado_km;
        self.terraceria_km += other.terraceria_km;
        self.na_km += other.na_km;
    }

    pub fn total_km(&self) -> f64 {
        self.pavimentado_km + self.terraceria_km + self.na_km
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdminBreakdown {
    pub federal_km: f64,
    pub estatal_km: f64,
    pub municipal_km: f64,
    pub na_km: f64,
}

impl AdminBreakdown {
    pub fn add(&mut self, class: AdminClass, km: f64) {
        match class {
            AdminClass::Federal => self.federal_km += km,
            AdminClass::State => self.estatal_km += km,
            AdminClass::Municipal => self.municipal_km += km,
            AdminClass::Unknown => self.na_km += km,
        }
    }

    pub fn merge(&mut self, other: &AdminBreakdown) {
        self.federal_km += other.federal_km;
        self.estatal_km += other.estatal_km;
        self.municipal_km += other.municipal_km;
        self.na_km += other.na_km;
    }

    pub fn total_km(&self) -> f64 {
        self.federal_km + self.estatal_km + self.municipal_km + self.na_km
    }
}

/// Km per class over the matched segments of one route.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoadComposition {
    pub superficie: SurfaceBreakdown,
    pub administracion: AdminBreakdown,
    /// Km per raw road-type label
    pub tipo_vialidad: BTreeMap<String, f64>,
}

pub fn compose(segments: &[MatchedSegment]) -> RoadComposition {
    let mut composition = RoadComposition::default();
    for seg in segments {
        composition.superficie.add(seg.surface, seg.length_km);
        composition.administracion.add(seg.admin, seg.length_km);
        let label = seg
            .road_type
            .clone()
            .unwrap_or_else(|| UNKNOWN_ROAD_TYPE.to_string());
        *composition.tipo_vialidad.entry(label).or_insert(0.0) += seg.length_km;
    }
    composition
}

pub fn surface_label(class: SurfaceClass) -> &'static str {
    match class {
        SurfaceClass::Paved => "Con pavimento",
        SurfaceClass::Unpaved => "Sin pavimento",
        SurfaceClass::Unknown => "N/A",
    }
}

pub fn admin_label(class: AdminClass) -> &'static str {
    match class {
        AdminClass::Federal => "Federal",
        AdminClass::State => "Estatal",
        AdminClass::Municipal => "Municipal",
        AdminClass::Unknown => "N/A",
    }
}

/// Which class a segment collection is labelled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClassification {
    Surface,
    Administration,
}

fn road_geometry(road: &RoadSegment) -> Option<geojson::Geometry> {
    let lines: Vec<LineString<f64>> = road
        .parts
        .iter()
        .filter_map(|p| match p {
            FeaturePart::Line(l) => Some(l.clone()),
            _ => None,
        })
        .collect();
    let value = match lines.len() {
        0 => return None,
        1 => geojson::Value::from(&lines[0]),
        _ => geojson::Value::from(&MultiLineString::new(lines)),
    };
    Some(geojson::Geometry::new(value))
}

/// GeoJSON of the roads used by the match, one feature per road in order of
/// first use, labelled with the road's canonical class and matched km.
pub fn classified_segments(
    segments: &[MatchedSegment],
    roads: &LayerIndex<RoadSegment>,
    by: SegmentClassification,
) -> geojson::FeatureCollection {
    let mut order: Vec<usize> = Vec::new();
    let mut km: BTreeMap<usize, f64> = BTreeMap::new();
    for seg in segments {
        if !km.contains_key(&seg.road_index) {
            order.push(seg.road_index);
        }
        *km.entry(seg.road_index).or_insert(0.0) += seg.length_km;
    }

    let features = order
        .into_iter()
        .filter_map(|idx| {
            let road = roads.get(idx)?;
            let mut properties = serde_json::Map::new();
            let (key, label) = match by {
                SegmentClassification::Surface => ("superficie", surface_label(road.surface)),
                SegmentClassification::Administration => {
                    ("administracion", admin_label(road.admin))
                }
            };
            properties.insert(key.to_string(), Value::from(label));
            properties.insert(
                "longitud_km".to_string(),
                Value::from(km.get(&idx).copied().unwrap_or(0.0)),
            );
            Some(geojson::Feature {
                bbox: None,
                geometry: road_geometry(road),
                id: Some(geojson::feature::Id::String(road.id.clone())),
                properties: Some(properties),
                foreign_members: None,
            })
        })
        .collect();

    geojson::FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}
