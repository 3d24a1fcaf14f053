//! Canonical geometry types and the planar predicates used by overlay joins.
//!
//! Coordinates are WGS84 longitude/latitude (SRID 4326). Polygons are stored
//! with counter-clockwise exterior rings and clockwise holes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};

use crate::normalize::{normalize, CoordinateFields, GeometryError, RawGeometry, WindingConvention};

const EPSILON: f64 = 1e-10;
const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn approx_eq(&self, other: &Coord) -> bool {
        (self.x - other.x).abs() <= EPSILON && (self.y - other.y).abs() <= EPSILON
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Inside,
    Boundary,
    Outside,
}

/// A closed linear ring; the last coordinate repeats the first.
#[derive(Debug, Clone, PartialEq)]
pub struct Ring(Vec<Coord>);

impl Ring {
    /// Builds a ring from distinct vertices, appending the closing vertex when missing.
    pub fn closed(mut coords: Vec<Coord>) -> Self {
        if let (Some(first), Some(last)) = (coords.first().copied(), coords.last().copied()) {
            if !first.approx_eq(&last) {
                coords.push(first);
            }
        }
        Self(coords)
    }

    pub fn coords(&self) -> &[Coord] {
        &self.0
    }

    /// Shoelace signed area; positive for counter-clockwise winding.
    pub fn signed_area(&self) -> f64 {
        let Some(origin) = self.0.first().copied() else {
            return 0.0;
        };
        self.edges()
            .map(|(a, b)| cross(origin, a, b))
            .sum::<f64>()
            / 2.0
    }

    pub fn orientation(&self) -> Orientation {
        if self.signed_area() > 0.0 {
            Orientation::CounterClockwise
        } else {
            Orientation::Clockwise
        }
    }

    pub fn oriented(mut self, orientation: Orientation) -> Self {
        if self.orientation() != orientation {
            self.0.reverse();
        }
        self
    }

    pub fn edges(&self) -> impl Iterator<Item = (Coord, Coord)> + '_ {
        self.0.windows(2).map(|w| (w[0], w[1]))
    }

    pub fn locate(&self, p: Coord) -> Location {
        let mut inside = false;
        for (a, b) in self.edges() {
            if on_segment(p, a, b) {
                return Location::Boundary;
            }
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        if inside {
            Location::Inside
        } else {
            Location::Outside
        }
    }

    fn to_positions(&self) -> JsonValue {
        JsonValue::Array(self.0.iter().map(|c| json!([c.x, c.y])).collect())
    }

    fn to_wkt(&self) -> String {
        let body = self
            .0
            .iter()
            .map(|c| format!("{} {}", c.x, c.y))
            .collect::<Vec<_>>()
            .join(", ");
        format!("({body})")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Ring,
    pub holes: Vec<Ring>,
}

impl Polygon {
    pub fn new(exterior: Ring, holes: Vec<Ring>) -> Self {
        Self { exterior, holes }
    }

    pub fn rings(&self) -> impl Iterator<Item = &Ring> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }

    pub fn area(&self) -> f64 {
        self.exterior.signed_area().abs()
            - self.holes.iter().map(|h| h.signed_area().abs()).sum::<f64>()
    }

    pub fn locate(&self, p: Coord) -> Location {
        match self.exterior.locate(p) {
            Location::Outside => Location::Outside,
            Location::Boundary => Location::Boundary,
            Location::Inside => {
                for hole in &self.holes {
                    match hole.locate(p) {
                        Location::Inside => return Location::Outside,
                        Location::Boundary => return Location::Boundary,
                        Location::Outside => {}
                    }
                }
                Location::Inside
            }
        }
    }
}

/// Canonical geometry: a single point or one-or-more polygon parts.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    MultiPolygon(Vec<Polygon>),
}

impl Geometry {
    pub fn polygons(&self) -> &[Polygon] {
        match self {
            Geometry::Point(_) => &[],
            Geometry::MultiPolygon(parts) => parts,
        }
    }

    pub fn as_point(&self) -> Option<Coord> {
        match self {
            Geometry::Point(c) => Some(*c),
            Geometry::MultiPolygon(_) => None,
        }
    }

    pub fn area(&self) -> f64 {
        self.polygons().iter().map(Polygon::area).sum()
    }

    pub fn covers_point(&self, p: Coord) -> bool {
        match self {
            Geometry::Point(c) => c.approx_eq(&p),
            Geometry::MultiPolygon(parts) => parts.iter().any(|part| part.locate(p) != Location::Outside),
        }
    }

    /// Boundary-inclusive containment of `other` within `self`.
    pub fn covers(&self, other: &Geometry) -> bool {
        match other {
            Geometry::Point(p) => self.covers_point(*p),
            Geometry::MultiPolygon(other_parts) => {
                if matches!(self, Geometry::Point(_)) {
                    return false;
                }
                other_parts.iter().all(|part| self.covers_polygon(part))
            }
        }
    }

    /// Boundary-inclusive overlap: shared points, contained vertices or crossing edges.
    pub fn intersects(&self, other: &Geometry) -> bool {
        match (self, other) {
            (_, Geometry::Point(p)) => self.covers_point(*p),
            (Geometry::Point(p), _) => other.covers_point(*p),
            (Geometry::MultiPolygon(ours), Geometry::MultiPolygon(theirs)) => {
                let vertex_inside = |parts: &[Polygon], container: &Geometry| {
                    parts
                        .iter()
                        .flat_map(|part| part.exterior.coords())
                        .any(|c| container.covers_point(*c))
                };
                if vertex_inside(theirs, self) || vertex_inside(ours, other) {
                    return true;
                }
                ours.iter().flat_map(Polygon::rings).flat_map(Ring::edges).any(|(a, b)| {
                    theirs
                        .iter()
                        .flat_map(Polygon::rings)
                        .flat_map(Ring::edges)
                        .any(|(c, d)| segments_cross(a, b, c, d))
                })
            }
        }
    }

    fn covers_polygon(&self, part: &Polygon) -> bool {
        let vertices_covered = part
            .exterior
            .coords()
            .iter()
            .all(|c| self.covers_point(*c));
        if !vertices_covered {
            return false;
        }

        let crosses = part.exterior.edges().any(|(a, b)| {
            self.polygons()
                .iter()
                .flat_map(Polygon::rings)
                .flat_map(Ring::edges)
                .any(|(c, d)| segments_cross(a, b, c, d))
        });
        if crosses {
            return false;
        }

        // A hole of the container sitting entirely inside the part leaves no crossing edge.
        !self.polygons().iter().flat_map(|p| p.holes.iter()).any(|hole| {
            hole.coords()
                .iter()
                .any(|c| part.locate(*c) == Location::Inside)
        })
    }

    /// Great-circle distance in meters from `p` to the nearest point of this geometry.
    pub fn distance_m(&self, p: Coord) -> f64 {
        if self.covers_point(p) {
            return 0.0;
        }
        match self {
            Geometry::Point(c) => haversine_m(p, *c),
            Geometry::MultiPolygon(parts) => parts
                .iter()
                .flat_map(Polygon::rings)
                .flat_map(Ring::edges)
                .map(|(a, b)| point_segment_distance_m(p, a, b))
                .fold(f64::INFINITY, f64::min),
        }
    }

    pub fn to_wkt(&self) -> String {
        match self {
            Geometry::Point(c) => format!("POINT({} {})", c.x, c.y),
            Geometry::MultiPolygon(parts) => {
                let body = parts
                    .iter()
                    .map(|part| {
                        let rings = part.rings().map(Ring::to_wkt).collect::<Vec<_>>().join(", ");
                        format!("({rings})")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("MULTIPOLYGON({body})")
            }
        }
    }

    pub fn to_geojson(&self) -> JsonValue {
        match self {
            Geometry::Point(c) => json!({ "type": "Point", "coordinates": [c.x, c.y] }),
            Geometry::MultiPolygon(parts) => {
                let coordinates = parts
                    .iter()
                    .map(|part| JsonValue::Array(part.rings().map(Ring::to_positions).collect()))
                    .collect::<Vec<_>>();
                json!({ "type": "MultiPolygon", "coordinates": coordinates })
            }
        }
    }

    pub fn from_geojson(value: &JsonValue) -> Result<Self, GeometryError> {
        let raw = RawGeometry::from_geojson(value).ok_or(GeometryError::Missing)?;
        normalize(
            &raw,
            WindingConvention::CounterClockwiseExterior,
            &CoordinateFields::default(),
        )
    }
}

impl Serialize for Geometry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_geojson().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Geometry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        Geometry::from_geojson(&value).map_err(serde::de::Error::custom)
    }
}

fn cross(o: Coord, a: Coord, b: Coord) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn on_segment(p: Coord, a: Coord, b: Coord) -> bool {
    if cross(a, b, p).abs() > EPSILON {
        return false;
    }
    p.x >= a.x.min(b.x) - EPSILON
        && p.x <= a.x.max(b.x) + EPSILON
        && p.y >= a.y.min(b.y) - EPSILON
        && p.y <= a.y.max(b.y) + EPSILON
}

/// True only for a proper crossing; touching or collinear overlap does not count.
fn segments_cross(p1: Coord, p2: Coord, q1: Coord, q2: Coord) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);
    ((d1 > EPSILON && d2 < -EPSILON) || (d1 < -EPSILON && d2 > EPSILON))
        && ((d3 > EPSILON && d4 < -EPSILON) || (d3 < -EPSILON && d4 > EPSILON))
}

pub fn haversine_m(a: Coord, b: Coord) -> f64 {
    let (lat1, lat2) = (a.y.to_radians(), b.y.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.x - a.x).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Equirectangular projection around `p`; accurate at neighbourhood scale.
fn point_segment_distance_m(p: Coord, a: Coord, b: Coord) -> f64 {
    let meters_per_degree = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
    let kx = meters_per_degree * p.y.to_radians().cos();
    let ky = meters_per_degree;
    let (ax, ay) = ((a.x - p.x) * kx, (a.y - p.y) * ky);
    let (bx, by) = ((b.x - p.x) * kx, (b.y - p.y) * ky);
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    (cx * cx + cy * cy).sqrt()
}
