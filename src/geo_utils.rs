//! Geographic utilities: great-circle distance, polyline length, a local
//! metric projection and planar segment distances.
//!
//! Reference data is WGS84 lon/lat. Anything measured against a tolerance in
//! meters is first projected with [`LocalProjection`], an equirectangular
//! projection anchored at a reference latitude. At the scale of a buffer
//! (tens to hundreds of meters) the error is negligible.

use geo::Coord;
use rstar::{Envelope, AABB};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude on the sphere of radius [`EARTH_RADIUS_M`].
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Great-circle distance between two lon/lat coordinates, in meters.
pub fn haversine_distance(a: Coord, b: Coord) -> f64 {
    let lat1 = a.y.to_radians();
    let lat2 = b.y.to_radians();
    let dlat = (b.y - a.y).to_radians();
    let dlng = (b.x - a.x).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Total haversine length of a polyline, in meters.
pub fn polyline_length(coords: &[Coord]) -> f64 {
    coords
        .windows(2)
        .map(|w| haversine_distance(w[0], w[1]))
        .sum()
}

/// Convert a distance in meters to (latitude, longitude) degree offsets at `ref_lat`.
pub fn meters_to_degrees(meters: f64, ref_lat: f64) -> (f64, f64) {
    let dlat = meters / METERS_PER_DEGREE;
    let cos_lat = ref_lat.to_radians().cos().abs().max(1e-6);
    (dlat, dlat / cos_lat)
}

/// Expand a lon/lat envelope by `meters` on every side.
pub fn expand_envelope(envelope: &AABB<[f64; 2]>, meters: f64) -> AABB<[f64; 2]> {
    let lower = envelope.lower();
    let upper = envelope.upper();
    // Widest longitude span happens at the latitude closest to a pole
    let ref_lat = if lower[1].abs() > upper[1].abs() {
        lower[1]
    } else {
        upper[1]
    };
    let (dlat, dlng) = meters_to_degrees(meters, ref_lat);
    AABB::from_corners(
        [lower[0] - dlng, lower[1] - dlat],
        [upper[0] + dlng, upper[1] + dlat],
    )
}

/// Envelope of a set of coordinates, or `None` if empty.
pub fn envelope_of(coords: &[Coord]) -> Option<AABB<[f64; 2]>> {
    if coords.is_empty() {
        return None;
    }
    let points: Vec<[f64; 2]> = coords.iter().map(|c| [c.x, c.y]).collect();
    Some(AABB::from_points(points.iter()))
}

/// Equirectangular projection to meters around a reference coordinate.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: Coord,
    kx: f64,
    ky: f64,
}

impl LocalProjection {
    pub fn new(origin: Coord) -> Self {
        Self {
            origin,
            kx: METERS_PER_DEGREE * origin.y.to_radians().cos(),
            ky: METERS_PER_DEGREE,
        }
    }

    /// Projection anchored at the center of an envelope.
    pub fn for_envelope(envelope: &AABB<[f64; 2]>) -> Self {
        let c = envelope.center();
        Self::new(Coord { x: c[0], y: c[1] })
    }

    pub fn project(&self, c: Coord) -> Coord {
        Coord {
            x: (c.x - self.origin.x) * self.kx,
            y: (c.y - self.origin.y) * self.ky,
        }
    }

    pub fn unproject(&self, c: Coord) -> Coord {
        let kx = if self.kx.abs() < 1e-9 { 1e-9 } else { self.kx };
        Coord {
            x: c.x / kx + self.origin.x,
            y: c.y / self.ky + self.origin.y,
        }
    }
}

/// Closest point to `p` on segment `a`-`b` (planar).
pub fn closest_point_on_segment(p: Coord, a: Coord, b: Coord) -> Coord {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return a;
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    Coord {
        x: a.x + t * dx,
        y: a.y + t * dy,
    }
}

/// Distance from `p` to segment `a`-`b` (planar).
pub fn point_segment_distance(p: Coord, a: Coord, b: Coord) -> f64 {
    let c = closest_point_on_segment(p, a, b);
    ((p.x - c.x).powi(2) + (p.y - c.y).powi(2)).sqrt()
}

fn orientation(a: Coord, b: Coord, c: Coord) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: Coord, b: Coord, p: Coord) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Whether segments `a1`-`a2` and `b1`-`b2` intersect (planar, touching counts).
pub fn segments_intersect(a1: Coord, a2: Coord, b1: Coord, b2: Coord) -> bool {
    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(b1, b2, a1))
        || (d2 == 0.0 && on_segment(b1, b2, a2))
        || (d3 == 0.0 && on_segment(a1, a2, b1))
        || (d4 == 0.0 && on_segment(a1, a2, b2))
}

/// Minimum distance between two segments (planar).
pub fn segment_segment_distance(a1: Coord, a2: Coord, b1: Coord, b2: Coord) -> f64 {
    if segments_intersect(a1, a2, b1, b2) {
        return 0.0;
    }
    point_segment_distance(a1, b1, b2)
        .min(point_segment_distance(a2, b1, b2))
        .min(point_segment_distance(b1, a1, a2))
        .min(point_segment_distance(b2, a1, a2))
}

/// Compass bearing of the planar vector `a`→`b`, in degrees [0, 360).
pub fn bearing(a: Coord, b: Coord) -> f64 {
    let deg = (b.x - a.x).atan2(b.y - a.y).to_degrees();
    (deg + 360.0) % 360.0
}

/// Direction-agnostic difference between two bearings, in degrees [0, 90].
///
/// Road geometry is digitized in arbitrary direction, so a road running
/// exactly opposite to the track counts as perfectly aligned.
pub fn axial_bearing_difference(b1: f64, b2: f64) -> f64 {
    let diff = (b1 - b2).abs() % 180.0;
    diff.min(180.0 - diff)
}
