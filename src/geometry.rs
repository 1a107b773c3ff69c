//! Feature parts and buffered corridors.
//!
//! Reference features are exploded into single-part geometries
//! ([`FeaturePart`]) so multi-part inputs can be indexed and queried part by
//! part. A [`Corridor`] is a set of polylines buffered by a radius in meters.
//! It answers "does this geometry overlap the buffer" as a distance test
//! (`distance <= radius`), which is exactly the intersection test against the
//! buffer polygon without ever building that polygon. Unioning corridors is a
//! concatenation of their polylines.

use geo::{
    BoundingRect, Contains, Coord, Geometry, Intersects, LineString, Point, Polygon,
};
use rstar::AABB;

use crate::geo_utils::{
    envelope_of, expand_envelope, point_segment_distance, segment_segment_distance,
    LocalProjection,
};

/// A single-part geometry of a reference feature.
#[derive(Debug, Clone, PartialEq)]
pub enum FeaturePart {
    Point(Coord),
    Line(LineString<f64>),
    Area(Polygon<f64>),
}

impl FeaturePart {
    /// Explode an arbitrary geometry into single parts.
    ///
    /// Empty parts are dropped; collections are flattened.
    pub fn explode(geometry: Geometry<f64>) -> Vec<FeaturePart> {
        let mut parts = Vec::new();
        push_parts(geometry, &mut parts);
        parts
    }

    /// Lon/lat envelope of this part.
    pub fn envelope(&self) -> Option<AABB<[f64; 2]>> {
        match self {
            FeaturePart::Point(c) => Some(AABB::from_point([c.x, c.y])),
            FeaturePart::Line(line) => envelope_of(&line.0),
            FeaturePart::Area(poly) => poly
                .bounding_rect()
                .map(|r| AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y])),
        }
    }

    /// Whether this part contains the point (areas only; holes respected).
    pub fn contains_point(&self, p: Coord) -> bool {
        match self {
            FeaturePart::Area(poly) => poly.contains(&Point::from(p)),
            _ => false,
        }
    }

    /// Whether two parts intersect (touching counts).
    pub fn intersects(&self, other: &FeaturePart) -> bool {
        match (self, other) {
            (FeaturePart::Point(a), FeaturePart::Point(b)) => a == b,
            (FeaturePart::Point(a), FeaturePart::Line(l))
            | (FeaturePart::Line(l), FeaturePart::Point(a)) => l.intersects(a),
            (FeaturePart::Point(a), FeaturePart::Area(p))
            | (FeaturePart::Area(p), FeaturePart::Point(a)) => p.intersects(a),
            (FeaturePart::Line(a), FeaturePart::Line(b)) => a.intersects(b),
            (FeaturePart::Line(l), FeaturePart::Area(p))
            | (FeaturePart::Area(p), FeaturePart::Line(l)) => l.intersects(p),
            (FeaturePart::Area(a), FeaturePart::Area(b)) => a.intersects(b),
        }
    }

    /// Distance in meters from a projected point to this part.
    ///
    /// Returns 0 for points inside an area.
    pub fn distance_to_point(&self, p: Coord, proj: &LocalProjection) -> f64 {
        match self {
            FeaturePart::Point(c) => {
                let q = proj.project(*c);
                ((p.x - q.x).powi(2) + (p.y - q.y).powi(2)).sqrt()
            }
            FeaturePart::Line(line) => projected_segments(line, proj)
                .map(|(a, b)| point_segment_distance(p, a, b))
                .fold(f64::INFINITY, f64::min),
            FeaturePart::Area(poly) => {
                if poly.contains(&Point::from(proj.unproject(p))) {
                    return 0.0;
                }
                polygon_rings(poly)
                    .flat_map(|ring| projected_segments(ring, proj))
                    .map(|(a, b)| point_segment_distance(p, a, b))
                    .fold(f64::INFINITY, f64::min)
            }
        }
    }

    /// Distance in meters from a projected segment to this part's boundary or
    /// body. Used when the caller already knows the segment does not cross
    /// the part.
    fn distance_to_segment(&self, a: Coord, b: Coord, proj: &LocalProjection) -> f64 {
        match self {
            FeaturePart::Point(c) => point_segment_distance(proj.project(*c), a, b),
            FeaturePart::Line(line) => projected_segments(line, proj)
                .map(|(c, d)| segment_segment_distance(a, b, c, d))
                .fold(f64::INFINITY, f64::min),
            FeaturePart::Area(poly) => polygon_rings(poly)
                .flat_map(|ring| projected_segments(ring, proj))
                .map(|(c, d)| segment_segment_distance(a, b, c, d))
                .fold(f64::INFINITY, f64::min),
        }
    }
}

fn push_parts(geometry: Geometry<f64>, parts: &mut Vec<FeaturePart>) {
    match geometry {
        Geometry::Point(p) => parts.push(FeaturePart::Point(p.0)),
        Geometry::MultiPoint(mp) => parts.extend(mp.0.into_iter().map(|p| FeaturePart::Point(p.0))),
        Geometry::Line(l) => parts.push(FeaturePart::Line(LineString::new(vec![l.start, l.end]))),
        Geometry::LineString(ls) => {
            if ls.0.len() >= 2 {
                parts.push(FeaturePart::Line(ls));
            }
        }
        Geometry::MultiLineString(mls) => parts.extend(
            mls.0
                .into_iter()
                .filter(|ls| ls.0.len() >= 2)
                .map(FeaturePart::Line),
        ),
        Geometry::Polygon(p) => {
            if !p.exterior().0.is_empty() {
                parts.push(FeaturePart::Area(p));
            }
        }
        Geometry::MultiPolygon(mp) => parts.extend(
            mp.0
                .into_iter()
                .filter(|p| !p.exterior().0.is_empty())
                .map(FeaturePart::Area),
        ),
        Geometry::Rect(r) => parts.push(FeaturePart::Area(r.to_polygon())),
        Geometry::Triangle(t) => parts.push(FeaturePart::Area(t.to_polygon())),
        Geometry::GeometryCollection(gc) => {
            for g in gc.0 {
                push_parts(g, parts);
            }
        }
    }
}

fn polygon_rings(poly: &Polygon<f64>) -> impl Iterator<Item = &LineString<f64>> {
    std::iter::once(poly.exterior()).chain(poly.interiors().iter())
}

fn projected_segments<'a>(
    line: &'a LineString<f64>,
    proj: &'a LocalProjection,
) -> impl Iterator<Item = (Coord, Coord)> + 'a {
    line.0
        .windows(2)
        .map(move |w| (proj.project(w[0]), proj.project(w[1])))
}

/// One or more polylines buffered by a fixed radius in meters.
#[derive(Debug, Clone, PartialEq)]
pub struct Corridor {
    lines: Vec<LineString<f64>>,
    radius_m: f64,
}

impl Corridor {
    /// Corridor around a single polyline.
    pub fn around(coords: &[Coord], radius_m: f64) -> Self {
        let mut corridor = Self {
            lines: Vec::new(),
            radius_m,
        };
        corridor.push_line(coords);
        corridor
    }

    /// Union of several polylines buffered by the same radius.
    pub fn around_all<'a, I>(lines: I, radius_m: f64) -> Self
    where
        I: IntoIterator<Item = &'a [Coord]>,
    {
        let mut corridor = Self {
            lines: Vec::new(),
            radius_m,
        };
        for coords in lines {
            corridor.push_line(coords);
        }
        corridor
    }

    fn push_line(&mut self, coords: &[Coord]) {
        match coords.len() {
            0 => {}
            // A lone point buffers to a disc; a degenerate segment is equivalent
            1 => self.lines.push(LineString::new(vec![coords[0], coords[0]])),
            _ => self.lines.push(LineString::new(coords.to_vec())),
        }
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[LineString<f64>] {
        &self.lines
    }

    /// Lon/lat envelope of the buffered area.
    pub fn envelope(&self) -> Option<AABB<[f64; 2]>> {
        let coords: Vec<Coord> = self.lines.iter().flat_map(|l| l.0.iter().copied()).collect();
        envelope_of(&coords).map(|env| expand_envelope(&env, self.radius_m))
    }

    /// Whether the part overlaps the buffered area.
    pub fn intersects(&self, part: &FeaturePart) -> bool {
        let Some(part_env) = part.envelope() else {
            return false;
        };
        let search_env = expand_envelope(&part_env, self.radius_m);
        let proj = LocalProjection::for_envelope(&part_env);

        for line in &self.lines {
            // Direct crossing or containment
            let crosses = match part {
                FeaturePart::Area(poly) => line.intersects(poly),
                FeaturePart::Line(other) => line.intersects(other),
                FeaturePart::Point(c) => line.intersects(c),
            };
            if crosses {
                return true;
            }

            for w in line.0.windows(2) {
                let seg_env = AABB::from_corners([w[0].x, w[0].y], [w[1].x, w[1].y]);
                if !rstar::Envelope::intersects(&seg_env, &search_env) {
                    continue;
                }
                let a = proj.project(w[0]);
                let b = proj.project(w[1]);
                if part.distance_to_segment(a, b, &proj) <= self.radius_m {
                    return true;
                }
            }
        }
        false
    }

    /// Whether any of the parts overlaps the buffered area.
    pub fn intersects_any(&self, parts: &[FeaturePart]) -> bool {
        parts.iter().any(|p| self.intersects(p))
    }
}
