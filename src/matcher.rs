//! Geometric map matching of a GPS track against the road network.
//!
//! Matching works per track edge (pair of consecutive points):
//!
//! 1. Candidate roads are those whose part bounding box lies within the
//!    buffer of the edge.
//! 2. Each candidate is scored by the perpendicular distance from the edge
//!    midpoint to the road; candidates farther than the buffer are dropped.
//! 3. If the road matched by the previous edge is still a candidate it wins
//!    (continuity). Otherwise the closest road wins, ties broken by the
//!    axial bearing difference between edge and road, then by feature id.
//!
//! Consecutive edges on the same road are merged into one [`MatchedSegment`].
//! There is no routing between candidates; this is proximity matching only.

use std::cmp::Ordering;

use geo::Coord;
use log::debug;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::attributes::{AdminClass, SurfaceClass};
use crate::geo_utils::{
    axial_bearing_difference, bearing, closest_point_on_segment, haversine_distance,
    LocalProjection,
};
use crate::geometry::FeaturePart;
use crate::layers::{IndexedFeature, LayerIndex, RoadSegment};
use crate::track::Track;

/// Distances closer than this are considered tied (meters).
const DISTANCE_TIE_M: f64 = 1e-9;

/// Bearing difference used for roads without a line part (degrees).
const NO_BEARING_PENALTY: f64 = 90.0;

/// Portion of a track attributed to one road.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedSegment {
    pub road_id: String,
    pub road_index: usize,
    /// First and last track edge covered (inclusive)
    pub start_edge: usize,
    pub end_edge: usize,
    pub length_km: f64,
    pub surface: SurfaceClass,
    pub admin: AdminClass,
    pub road_type: Option<String>,
    /// Mean midpoint distance to the road over the covered edges
    pub mean_distance_m: f64,
}

/// Share of the track length that matched the road network.
///
/// A track of zero length has no meaningful confidence and reports
/// [`MatchConfidence::NoData`], serialized as `null`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchConfidence {
    Percent(f64),
    NoData,
}

impl MatchConfidence {
    pub fn percent(&self) -> Option<f64> {
        match self {
            MatchConfidence::Percent(p) => Some(*p),
            MatchConfidence::NoData => None,
        }
    }
}

impl Serialize for MatchConfidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MatchConfidence::Percent(p) => serializer.serialize_f64(*p),
            MatchConfidence::NoData => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for MatchConfidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<f64>::deserialize(deserializer)? {
            Some(p) => MatchConfidence::Percent(p),
            None => MatchConfidence::NoData,
        })
    }
}

/// Outcome of matching one track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMatch {
    pub segments: Vec<MatchedSegment>,
    pub matched_length_km: f64,
    pub total_length_km: f64,
    pub matched_edges: usize,
    pub total_edges: usize,
    /// Mean midpoint distance over matched edges, `None` if nothing matched
    pub mean_offset_m: Option<f64>,
    /// Track snapped onto the matched roads, one run per stretch of
    /// consecutive matched edges. Empty when nothing matched.
    pub snapped: Vec<Vec<Coord>>,
}

impl TrackMatch {
    pub fn confidence(&self) -> MatchConfidence {
        if self.total_length_km > 0.0 {
            MatchConfidence::Percent(
                (100.0 * self.matched_length_km / self.total_length_km).clamp(0.0, 100.0),
            )
        } else {
            MatchConfidence::NoData
        }
    }

    /// Share of edges that matched, percent.
    pub fn match_rate_pct(&self) -> f64 {
        if self.total_edges == 0 {
            0.0
        } else {
            100.0 * self.matched_edges as f64 / self.total_edges as f64
        }
    }

    pub fn unmatched_edges(&self) -> usize {
        self.total_edges - self.matched_edges
    }

    pub fn unmatched_length_km(&self) -> f64 {
        (self.total_length_km - self.matched_length_km).max(0.0)
    }
}

/// A road that passed the buffer test for one edge.
struct Candidate {
    road: usize,
    distance_m: f64,
    bearing_diff: f64,
}

/// Distance from the projection origin to a road, and the bearing of the
/// closest road segment.
fn score_road(road: &RoadSegment, proj: &LocalProjection) -> (f64, Option<f64>) {
    let origin = Coord { x: 0.0, y: 0.0 };
    let mut best_dist = f64::INFINITY;
    let mut best_bearing = None;

    for part in road.parts() {
        match part {
            FeaturePart::Line(line) => {
                for w in line.0.windows(2) {
                    let a = proj.project(w[0]);
                    let b = proj.project(w[1]);
                    let c = closest_point_on_segment(origin, a, b);
                    let d = (c.x * c.x + c.y * c.y).sqrt();
                    if d < best_dist {
                        best_dist = d;
                        best_bearing = Some(bearing(a, b));
                    }
                }
            }
            other => {
                let d = other.distance_to_point(origin, proj);
                if d < best_dist {
                    best_dist = d;
                    best_bearing = None;
                }
            }
        }
    }
    (best_dist, best_bearing)
}

/// Closest point on the road's line parts to `p`, or `p` itself when the road
/// has no line part.
fn snap_to_road(road: &RoadSegment, p: Coord) -> Coord {
    let proj = LocalProjection::new(p);
    let origin = Coord { x: 0.0, y: 0.0 };
    let mut best: Option<(f64, Coord)> = None;

    for part in road.parts() {
        if let FeaturePart::Line(line) = part {
            for w in line.0.windows(2) {
                let c = closest_point_on_segment(origin, proj.project(w[0]), proj.project(w[1]));
                let d = c.x * c.x + c.y * c.y;
                if best.map_or(true, |(bd, _)| d < bd) {
                    best = Some((d, c));
                }
            }
        }
    }
    best.map_or(p, |(_, c)| proj.unproject(c))
}

fn compare_candidates(a: &Candidate, b: &Candidate, roads: &LayerIndex<RoadSegment>) -> Ordering {
    a.bearing_diff
        .total_cmp(&b.bearing_diff)
        .then_with(|| {
            let id_a = roads.get(a.road).map(|r| r.id.as_str()).unwrap_or("");
            let id_b = roads.get(b.road).map(|r| r.id.as_str()).unwrap_or("");
            id_a.cmp(id_b)
        })
        .then(a.road.cmp(&b.road))
}

/// Pick the road for one edge, or `None` if no road lies within the buffer.
fn choose_road(
    a: Coord,
    b: Coord,
    previous: Option<usize>,
    roads: &LayerIndex<RoadSegment>,
    buffer_m: f64,
) -> Option<Candidate> {
    let mid = Coord {
        x: (a.x + b.x) / 2.0,
        y: (a.y + b.y) / 2.0,
    };
    let proj = LocalProjection::new(mid);
    let edge_bearing = bearing(proj.project(a), proj.project(b));

    let candidates: Vec<Candidate> = roads
        .candidates_near_segment(a, b, buffer_m)
        .into_iter()
        .filter_map(|idx| {
            let road = roads.get(idx)?;
            let (distance_m, road_bearing) = score_road(road, &proj);
            if distance_m > buffer_m {
                return None;
            }
            Some(Candidate {
                road: idx,
                distance_m,
                bearing_diff: road_bearing
                    .map_or(NO_BEARING_PENALTY, |rb| axial_bearing_difference(edge_bearing, rb)),
            })
        })
        .collect();

    if let Some(prev) = previous {
        if let Some(pos) = candidates.iter().position(|c| c.road == prev) {
            return candidates.into_iter().nth(pos);
        }
    }

    let min_dist = candidates
        .iter()
        .map(|c| c.distance_m)
        .fold(f64::INFINITY, f64::min);
    candidates
        .into_iter()
        .filter(|c| c.distance_m - min_dist <= DISTANCE_TIE_M)
        .min_by(|x, y| compare_candidates(x, y, roads))
}

/// Match a track against the road index with the given buffer (meters).
pub fn match_track(track: &Track, roads: &LayerIndex<RoadSegment>, buffer_m: f64) -> TrackMatch {
    let coords = track.coords();
    let total_edges = track.edge_count();

    let mut segments: Vec<MatchedSegment> = Vec::new();
    let mut segment_distance_sum = 0.0;
    let mut segment_edges = 0usize;
    let mut total_length_m = 0.0;
    let mut matched_length_m = 0.0;
    let mut matched_edges = 0usize;
    let mut offset_sum = 0.0;
    let mut snapped: Vec<Vec<Coord>> = Vec::new();
    let mut in_run = false;
    let mut previous: Option<usize> = None;

    for i in 0..total_edges {
        let (a, b) = (coords[i], coords[i + 1]);
        let edge_m = haversine_distance(a, b);
        total_length_m += edge_m;

        let Some(chosen) = choose_road(a, b, previous, roads, buffer_m) else {
            previous = None;
            in_run = false;
            continue;
        };
        let Some(road) = roads.get(chosen.road) else {
            previous = None;
            in_run = false;
            continue;
        };

        matched_length_m += edge_m;
        matched_edges += 1;
        offset_sum += chosen.distance_m;

        // An unmatched gap starts a new run; never bridge it with a chord
        if !in_run {
            snapped.push(Vec::new());
            in_run = true;
        }
        if let Some(run) = snapped.last_mut() {
            for p in [a, b] {
                let s = snap_to_road(road, p);
                if run.last() != Some(&s) {
                    run.push(s);
                }
            }
        }

        let extends_last = previous == Some(chosen.road)
            && segments.last().map_or(false, |s| s.end_edge + 1 == i);
        if extends_last {
            if let Some(seg) = segments.last_mut() {
                seg.end_edge = i;
                seg.length_km += edge_m / 1000.0;
                segment_distance_sum += chosen.distance_m;
                segment_edges += 1;
                seg.mean_distance_m = segment_distance_sum / segment_edges as f64;
            }
        } else {
            segment_distance_sum = chosen.distance_m;
            segment_edges = 1;
            segments.push(MatchedSegment {
                road_id: road.id.clone(),
                road_index: chosen.road,
                start_edge: i,
                end_edge: i,
                length_km: edge_m / 1000.0,
                surface: road.surface,
                admin: road.admin,
                road_type: road.road_type.clone(),
                mean_distance_m: chosen.distance_m,
            });
        }
        previous = Some(chosen.road);
    }

    let result = TrackMatch {
        segments,
        matched_length_km: matched_length_m / 1000.0,
        total_length_km: total_length_m / 1000.0,
        matched_edges,
        total_edges,
        mean_offset_m: (matched_edges > 0).then(|| offset_sum / matched_edges as f64),
        snapped,
    };

    debug!(
        "[Matcher] {}/{} edges matched, {:.3}/{:.3} km, {} segments",
        result.matched_edges,
        result.total_edges,
        result.matched_length_km,
        result.total_length_km,
        result.segments.len()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::METERS_PER_DEGREE;
    use crate::layers::{LayerFeature, ROAD_NETWORK};
    use crate::track::TrackPoint;
    use geo::{Geometry, LineString};
    use serde_json::json;

    const M: f64 = 1.0 / METERS_PER_DEGREE;

    fn road(id: &str, coords: Vec<(f64, f64)>, surface: &str) -> LayerFeature {
        let ls: LineString<f64> = coords.into();
        let props = json!({ "CONDICION": surface, "ADMINISTRA": "Estatal" });
        LayerFeature::new(
            id,
            Geometry::LineString(ls),
            props.as_object().cloned().unwrap_or_default(),
        )
    }

    fn roads(features: Vec<LayerFeature>) -> LayerIndex<RoadSegment> {
        LayerIndex::from_features(ROAD_NETWORK, features)
    }

    fn track(points: &[(f64, f64)]) -> Track {
        Track::new(points.iter().map(|(x, y)| TrackPoint::new(*x, *y)).collect()).unwrap()
    }

    #[test]
    fn test_full_match_on_single_road() {
        let index = roads(vec![road("r1", vec![(0.0, 0.0), (1000.0 * M, 0.0)], "Pavimentada")]);
        let t = track(&[(0.0, 10.0 * M), (400.0 * M, 10.0 * M), (800.0 * M, 5.0 * M)]);
        let m = match_track(&t, &index, 50.0);

        assert_eq!(m.confidence(), MatchConfidence::Percent(100.0));
        assert_eq!(m.segments.len(), 1);
        assert_eq!(m.segments[0].start_edge, 0);
        assert_eq!(m.segments[0].end_edge, 1);
        assert_eq!(m.segments[0].surface, SurfaceClass::Paved);
        assert_eq!(m.segments[0].admin, AdminClass::State);
        assert!((m.segments[0].length_km - m.total_length_km).abs() < 1e-12);
        assert_eq!(m.unmatched_edges(), 0);
        // Snapped onto the road centerline
        assert_eq!(m.snapped.len(), 1);
        assert!(m.snapped[0].iter().all(|c| c.y.abs() < 1e-12));
    }

    #[test]
    fn test_far_point_leaves_unmatched_remainder() {
        let index = roads(vec![road("r1", vec![(0.0, 0.0), (1000.0 * M, 0.0)], "Pavimentada")]);
        let t = track(&[(0.0, 0.0), (300.0 * M, 0.0), (300.0 * M, 1000.0 * M)]);
        let m = match_track(&t, &index, 50.0);

        let pct = m.confidence().percent().unwrap_or(100.0);
        assert!(pct < 100.0);
        assert!(pct > 0.0);
        assert!(m.unmatched_length_km() > 0.9);
        assert_eq!(m.unmatched_edges(), 1);
        assert_eq!(m.match_rate_pct(), 50.0);
    }

    #[test]
    fn test_no_roads_is_zero_confidence() {
        let index = roads(vec![]);
        let t = track(&[(0.0, 0.0), (0.001, 0.0)]);
        let m = match_track(&t, &index, 50.0);
        assert_eq!(m.confidence(), MatchConfidence::Percent(0.0));
        assert!(m.segments.is_empty());
        assert_eq!(m.mean_offset_m, None);
        assert!(m.snapped.is_empty());
    }

    #[test]
    fn test_zero_length_track_has_no_data() {
        let index = roads(vec![]);
        let t = track(&[(0.0, 0.0), (0.0, 0.0)]);
        let m = match_track(&t, &index, 50.0);
        assert_eq!(m.confidence(), MatchConfidence::NoData);
        assert_eq!(serde_json::to_string(&m.confidence()).unwrap(), "null");
    }

    #[test]
    fn test_continuity_beats_closer_road() {
        // r1 along the equator; r2 parallel 20 m north starting at x=500 m.
        // Track runs 15 m north: r2 is closer from x=500 m on, but r1 stays
        // within the buffer, so continuity keeps the match on r1.
        let index = roads(vec![
            road("r1", vec![(0.0, 0.0), (1000.0 * M, 0.0)], "Pavimentada"),
            road("r2", vec![(500.0 * M, 20.0 * M), (1000.0 * M, 20.0 * M)], "Terraceria"),
        ]);
        let t = track(&[
            (0.0, 15.0 * M),
            (400.0 * M, 15.0 * M),
            (600.0 * M, 15.0 * M),
            (900.0 * M, 15.0 * M),
        ]);
        let m = match_track(&t, &index, 50.0);
        assert_eq!(m.segments.len(), 1);
        assert_eq!(m.segments[0].road_id, "r1");
    }

    #[test]
    fn test_closest_road_without_history() {
        let index = roads(vec![
            road("far", vec![(0.0, 0.0), (1000.0 * M, 0.0)], "x"),
            road("near", vec![(0.0, 20.0 * M), (1000.0 * M, 20.0 * M)], "x"),
        ]);
        let t = track(&[(100.0 * M, 15.0 * M), (200.0 * M, 15.0 * M)]);
        let m = match_track(&t, &index, 50.0);
        assert_eq!(m.segments[0].road_id, "near");
        assert!((m.mean_offset_m.unwrap_or(0.0) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_bearing_breaks_distance_tie() {
        // Both roads pass through the edge midpoint; only "along" is aligned
        let index = roads(vec![
            road("across", vec![(50.0 * M, -100.0 * M), (50.0 * M, 100.0 * M)], "x"),
            road("along", vec![(-100.0 * M, 0.0), (200.0 * M, 0.0)], "x"),
        ]);
        let t = track(&[(0.0, 0.0), (100.0 * M, 0.0)]);
        let m = match_track(&t, &index, 50.0);
        assert_eq!(m.segments[0].road_id, "along");
    }

    #[test]
    fn test_full_tie_uses_feature_id() {
        let line = vec![(0.0, 0.0), (1000.0 * M, 0.0)];
        let index = roads(vec![road("b", line.clone(), "x"), road("a", line, "x")]);
        let t = track(&[(0.0, 0.0), (100.0 * M, 0.0)]);
        let m = match_track(&t, &index, 50.0);
        assert_eq!(m.segments[0].road_id, "a");
    }

    #[test]
    fn test_segments_split_on_road_change() {
        let index = roads(vec![
            road("west", vec![(0.0, 0.0), (500.0 * M, 0.0)], "Pavimentada"),
            road("east", vec![(500.0 * M, 0.0), (1000.0 * M, 0.0)], "Brecha"),
        ]);
        // Edges are 200 m long; the middle one straddles the junction
        let t = track(&[
            (0.0, 0.0),
            (200.0 * M, 0.0),
            (400.0 * M, 0.0),
            (700.0 * M, 0.0),
            (900.0 * M, 0.0),
        ]);
        let m = match_track(&t, &index, 50.0);
        let ids: Vec<&str> = m.segments.iter().map(|s| s.road_id.as_str()).collect();
        assert_eq!(ids, vec!["west", "east"]);
        assert_eq!(m.segments[1].surface, SurfaceClass::Unpaved);
        let sum: f64 = m.segments.iter().map(|s| s.length_km).sum();
        assert!((sum - m.matched_length_km).abs() < 1e-9);
    }

    #[test]
    fn test_unmatched_gap_splits_snapped_runs() {
        let index = roads(vec![
            road("west", vec![(0.0, 0.0), (1000.0 * M, 0.0)], "Pavimentada"),
            road("east", vec![(3000.0 * M, 0.0), (4000.0 * M, 0.0)], "Pavimentada"),
        ]);
        // Detour 3 km north between the two roads
        let t = track(&[
            (0.0, 0.0),
            (1000.0 * M, 0.0),
            (1000.0 * M, 3000.0 * M),
            (3000.0 * M, 3000.0 * M),
            (3000.0 * M, 0.0),
            (4000.0 * M, 0.0),
        ]);
        let m = match_track(&t, &index, 50.0);
        assert_eq!(m.matched_edges, 2);
        assert_eq!(m.snapped.len(), 2);
        assert!(m.snapped[0].iter().all(|c| c.x <= 1000.0 * M + 1e-12));
        assert!(m.snapped[1].iter().all(|c| c.x >= 3000.0 * M - 1e-12));
    }
}
