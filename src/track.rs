//! GPS tracks: validation and recorded-trip metrics.

use geo::Coord;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::geo_utils::haversine_distance;

/// Minimum number of points for a usable track.
pub const MIN_TRACK_POINTS: usize = 2;

/// Elevation steps at or below this are treated as GPS noise (meters).
const ELEVATION_NOISE_M: f64 = 1.0;
/// Edges shorter than this are skipped for slope (meters).
const MIN_SLOPE_EDGE_M: f64 = 5.0;
/// Slopes steeper than this are treated as elevation errors (percent).
const MAX_PLAUSIBLE_SLOPE_PCT: f64 = 25.0;
/// Slopes within this band count as flat (percent).
const FLAT_SLOPE_PCT: f64 = 0.5;
/// Edges with a shorter time step are skipped for speed (seconds).
const MIN_SPEED_DT_S: f64 = 0.36;
/// Speeds outside this band are stops or GPS jumps (km/h).
const MIN_MOVING_SPEED_KMH: f64 = 0.5;
const MAX_PLAUSIBLE_SPEED_KMH: f64 = 150.0;

/// A recorded GPS point. Timestamps are Unix epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub longitude: f64,
    pub latitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl TrackPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
            elevation: None,
            timestamp: None,
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn coord(&self) -> Coord {
        Coord {
            x: self.longitude,
            y: self.latitude,
        }
    }

    fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.elevation.map_or(true, f64::is_finite)
            && self.timestamp.map_or(true, f64::is_finite)
    }
}

/// A validated, immutable GPS track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    points: Vec<TrackPoint>,
}

impl Track {
    /// Validate points into a track.
    ///
    /// Rejects fewer than two points, non-finite or out-of-range values, and
    /// timestamps that go backwards. Errors carry an empty route id; the
    /// engine attaches the real one.
    pub fn new(points: Vec<TrackPoint>) -> Result<Self> {
        let malformed = |message: String| AnalysisError::MalformedTrack {
            route_id: String::new(),
            message,
        };

        if points.len() < MIN_TRACK_POINTS {
            return Err(malformed(format!(
                "{} points, minimum {} required",
                points.len(),
                MIN_TRACK_POINTS
            )));
        }
        if let Some(i) = points.iter().position(|p| !p.is_valid()) {
            return Err(malformed(format!("invalid coordinate at point {}", i)));
        }

        let mut last_time: Option<f64> = None;
        for (i, t) in points.iter().enumerate().filter_map(|(i, p)| p.timestamp.map(|t| (i, t))) {
            if let Some(prev) = last_time {
                if t < prev {
                    return Err(malformed(format!("timestamp decreases at point {}", i)));
                }
            }
            last_time = Some(t);
        }

        Ok(Self { points })
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn coords(&self) -> Vec<Coord> {
        self.points.iter().map(TrackPoint::coord).collect()
    }

    /// Number of edges (consecutive point pairs).
    pub fn edge_count(&self) -> usize {
        self.points.len().saturating_sub(1)
    }

    /// Haversine length of edge `i`, in meters.
    pub fn edge_length_m(&self, i: usize) -> f64 {
        haversine_distance(self.points[i].coord(), self.points[i + 1].coord())
    }

    /// Total haversine length, in meters.
    pub fn length_m(&self) -> f64 {
        (0..self.edge_count()).map(|i| self.edge_length_m(i)).sum()
    }

    pub fn metrics(&self) -> TrackMetrics {
        TrackMetrics::compute(self)
    }
}

/// Trip metrics derived from the recorded track alone.
///
/// Fields are `None` when the track carries no timestamps or elevations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetrics {
    pub distance_km: f64,
    pub duration_min: Option<u64>,
    pub avg_speed_kmh: Option<f64>,
    pub max_speed_kmh: Option<f64>,
    pub elevation_min_m: Option<f64>,
    pub elevation_max_m: Option<f64>,
    pub elevation_gain_m: Option<f64>,
    pub elevation_loss_m: Option<f64>,
    pub avg_uphill_slope_pct: Option<f64>,
    pub avg_downhill_slope_pct: Option<f64>,
    pub max_slope_pct: Option<f64>,
    pub total_points: usize,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

impl TrackMetrics {
    pub fn compute(track: &Track) -> Self {
        let points = track.points();
        let mut metrics = TrackMetrics {
            distance_km: track.length_m() / 1000.0,
            total_points: points.len(),
            ..Default::default()
        };

        // Duration: first to last timestamped point, whole minutes
        let times: Vec<f64> = points.iter().filter_map(|p| p.timestamp).collect();
        if let (Some(first), Some(last)) = (times.first(), times.last()) {
            if times.len() >= 2 {
                metrics.duration_min = Some(((last - first) / 60.0).floor() as u64);
            }
        }

        // Speed over moving edges only
        let speeds: Vec<f64> = points
            .windows(2)
            .filter_map(|w| {
                let dt = w[1].timestamp? - w[0].timestamp?;
                if dt < MIN_SPEED_DT_S {
                    return None;
                }
                let kmh = haversine_distance(w[0].coord(), w[1].coord()) / 1000.0 / (dt / 3600.0);
                (kmh > MIN_MOVING_SPEED_KMH && kmh < MAX_PLAUSIBLE_SPEED_KMH).then_some(kmh)
            })
            .collect();
        metrics.avg_speed_kmh = mean(&speeds).map(|v| round_to(v, 1));
        metrics.max_speed_kmh = speeds
            .iter()
            .copied()
            .reduce(f64::max)
            .map(|v| round_to(v, 1));

        // Elevation over the points that carry one
        let elevations: Vec<f64> = points.iter().filter_map(|p| p.elevation).collect();
        if !elevations.is_empty() {
            let mut gain = 0.0;
            let mut loss = 0.0;
            for w in elevations.windows(2) {
                let diff = w[1] - w[0];
                if diff > ELEVATION_NOISE_M {
                    gain += diff;
                } else if diff < -ELEVATION_NOISE_M {
                    loss += -diff;
                }
            }
            let extreme = |pick: fn(f64, f64) -> f64| {
                elevations.iter().copied().reduce(pick).map(|v| round_to(v, 1))
            };
            metrics.elevation_min_m = extreme(f64::min);
            metrics.elevation_max_m = extreme(f64::max);
            metrics.elevation_gain_m = Some(round_to(gain, 1));
            metrics.elevation_loss_m = Some(round_to(loss, 1));

            let mut uphill = Vec::new();
            let mut downhill = Vec::new();
            for w in points.windows(2) {
                let (Some(h0), Some(h1)) = (w[0].elevation, w[1].elevation) else {
                    continue;
                };
                let dist = haversine_distance(w[0].coord(), w[1].coord());
                if dist < MIN_SLOPE_EDGE_M {
                    continue;
                }
                let slope = (h1 - h0) / dist * 100.0;
                if slope.abs() > MAX_PLAUSIBLE_SLOPE_PCT {
                    continue;
                }
                if slope > FLAT_SLOPE_PCT {
                    uphill.push(slope);
                } else if slope < -FLAT_SLOPE_PCT {
                    downhill.push(slope);
                }
            }
            metrics.avg_uphill_slope_pct = mean(&uphill).map(|v| round_to(v, 2));
            metrics.avg_downhill_slope_pct = mean(&downhill).map(|v| round_to(v, 2));
            let max_slope = uphill
                .iter()
                .chain(downhill.iter())
                .map(|s| s.abs())
                .fold(0.0, f64::max);
            metrics.max_slope_pct = Some(round_to(max_slope, 2));
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::METERS_PER_DEGREE;

    /// Points heading north, `step_m` apart, one every `dt` seconds.
    fn northbound(n: usize, step_m: f64, dt: f64) -> Vec<TrackPoint> {
        (0..n)
            .map(|i| {
                TrackPoint::new(-103.35, 20.0 + i as f64 * step_m / METERS_PER_DEGREE)
                    .with_timestamp(1_700_000_000.0 + i as f64 * dt)
            })
            .collect()
    }

    #[test]
    fn test_rejects_short_track() {
        let err = Track::new(vec![TrackPoint::new(0.0, 0.0)]).unwrap_err();
        assert_eq!(err.reason_code(), "malformed_track");
        assert!(Track::new(vec![]).is_err());
    }

    #[test]
    fn test_rejects_bad_coordinates() {
        let pts = vec![TrackPoint::new(0.0, 0.0), TrackPoint::new(f64::NAN, 0.0)];
        assert!(Track::new(pts).is_err());
        let pts = vec![TrackPoint::new(0.0, 0.0), TrackPoint::new(0.0, 91.0)];
        assert!(Track::new(pts).is_err());
    }

    #[test]
    fn test_rejects_decreasing_timestamps() {
        let mut pts = northbound(3, 100.0, 10.0);
        pts[2].timestamp = Some(1_600_000_000.0);
        assert!(Track::new(pts).is_err());

        // Missing timestamps in between are fine
        let mut pts = northbound(3, 100.0, 10.0);
        pts[1].timestamp = None;
        assert!(Track::new(pts).is_ok());
    }

    #[test]
    fn test_length() {
        let track = Track::new(northbound(3, 100.0, 10.0)).unwrap();
        assert!((track.length_m() - 200.0).abs() < 1e-6);
        assert_eq!(track.edge_count(), 2);
    }

    #[test]
    fn test_duration_and_speed() {
        // 100 m every 10 s = 36 km/h, 61 points = 10 minutes
        let track = Track::new(northbound(61, 100.0, 10.0)).unwrap();
        let m = track.metrics();
        assert_eq!(m.duration_min, Some(10));
        assert_eq!(m.avg_speed_kmh, Some(36.0));
        assert_eq!(m.max_speed_kmh, Some(36.0));
        assert_eq!(m.total_points, 61);
    }

    #[test]
    fn test_speed_filters_stops_and_jumps() {
        let mut pts = northbound(3, 100.0, 10.0);
        // Second edge is a stop
        pts[2].latitude = pts[1].latitude;
        let m = Track::new(pts).unwrap().metrics();
        assert_eq!(m.avg_speed_kmh, Some(36.0));
    }

    #[test]
    fn test_no_timestamps() {
        let pts = vec![TrackPoint::new(0.0, 0.0), TrackPoint::new(0.0, 0.001)];
        let m = Track::new(pts).unwrap().metrics();
        assert_eq!(m.duration_min, None);
        assert_eq!(m.avg_speed_kmh, None);
        assert_eq!(m.elevation_gain_m, None);
    }

    #[test]
    fn test_elevation_and_slopes() {
        let elevations = [1500.0, 1502.0, 1502.3, 1498.0, 1520.0];
        let pts: Vec<TrackPoint> = northbound(5, 100.0, 10.0)
            .into_iter()
            .zip(elevations)
            .map(|(p, h)| p.with_elevation(h))
            .collect();
        let m = Track::new(pts).unwrap().metrics();

        assert_eq!(m.elevation_min_m, Some(1498.0));
        assert_eq!(m.elevation_max_m, Some(1520.0));
        // +2 and +22 count, +0.3 is noise
        assert_eq!(m.elevation_gain_m, Some(24.0));
        assert_eq!(m.elevation_loss_m, Some(4.3));
        // Slopes: 2 %, 0.3 % (flat), -4.3 %, 22 %
        assert_eq!(m.avg_uphill_slope_pct, Some(12.0));
        assert_eq!(m.avg_downhill_slope_pct, Some(-4.3));
        assert_eq!(m.max_slope_pct, Some(22.0));
    }
}
