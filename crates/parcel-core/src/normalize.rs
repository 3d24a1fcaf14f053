//! Geometry normalization for heterogeneous upstream payloads.
//!
//! Upstream layers deliver geometry as Esri ring arrays, Esri `{x, y}` points,
//! GeoJSON objects, or not at all (coordinates live in record attributes).
//! Everything resolves to a [`RawGeometry`] first and then to a canonical
//! [`Geometry`].

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::geometry::{Coord, Geometry, Orientation, Polygon, Ring};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("no geometry and no coordinate attributes")]
    Missing,
    #[error("geometry has an empty coordinate array")]
    Empty,
    #[error("malformed geometry: {0}")]
    Malformed(String),
    #[error("coordinate ({x}, {y}) is outside WGS84 bounds")]
    InvalidCoordinate { x: f64, y: f64 },
}

/// Which winding marks an exterior ring in the incoming ring list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindingConvention {
    #[default]
    CounterClockwiseExterior,
    ClockwiseExterior,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawGeometry {
    Rings(Vec<Vec<Vec<f64>>>),
    Point { x: f64, y: f64 },
    Attributes(JsonMap<String, JsonValue>),
}

/// Attribute names consulted, in order, when a record carries bare coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinateFields {
    pub longitude: Vec<String>,
    pub latitude: Vec<String>,
}

impl Default for CoordinateFields {
    fn default() -> Self {
        Self {
            longitude: ["LONGITUDE", "longitude", "X", "x", "lon"]
                .into_iter()
                .map(String::from)
                .collect(),
            latitude: ["LATITUDE", "latitude", "Y", "y", "lat"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl RawGeometry {
    /// Picks the geometry representation of one upstream feature.
    ///
    /// A geometry value that carries no coordinates (null, `{}`, `rings: []`)
    /// falls back to the feature's attributes.
    pub fn resolve(geometry: Option<&JsonValue>, attributes: &JsonMap<String, JsonValue>) -> Self {
        if let Some(JsonValue::Object(obj)) = geometry {
            if let Some(rings) = obj.get("rings").filter(|v| !v.is_null()) {
                let parsed = parse_ring_list(rings);
                if parsed.has_coordinates() {
                    return parsed;
                }
            } else if let (Some(x), Some(y)) = (
                obj.get("x").and_then(number_like),
                obj.get("y").and_then(number_like),
            ) {
                return RawGeometry::Point { x, y };
            } else if let Some(raw) = geometry.and_then(Self::from_geojson) {
                if raw.has_coordinates() {
                    return raw;
                }
            }
        }
        RawGeometry::Attributes(attributes.clone())
    }

    /// False for ring lists without a single position.
    fn has_coordinates(&self) -> bool {
        match self {
            RawGeometry::Rings(rings) => rings.iter().any(|r| !r.is_empty()),
            RawGeometry::Point { .. } => true,
            RawGeometry::Attributes(_) => false,
        }
    }

    pub fn from_geojson(value: &JsonValue) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        let coordinates = value.get("coordinates")?;
        match kind {
            "Point" => {
                let pair = coordinates.as_array()?;
                Some(RawGeometry::Point {
                    x: pair.first().and_then(number_like)?,
                    y: pair.get(1).and_then(number_like)?,
                })
            }
            "Polygon" => Some(parse_ring_list(coordinates)),
            "MultiPolygon" => {
                let rings = coordinates
                    .as_array()?
                    .iter()
                    .flat_map(|polygon| match parse_ring_list(polygon) {
                        RawGeometry::Rings(rings) => rings,
                        _ => Vec::new(),
                    })
                    .collect();
                Some(RawGeometry::Rings(rings))
            }
            _ => None,
        }
    }
}

fn parse_ring_list(value: &JsonValue) -> RawGeometry {
    let Some(items) = value.as_array() else {
        return RawGeometry::Rings(Vec::new());
    };
    // A bare `[x, y]` where rings were expected.
    if let (Some(x), Some(y), 2) = (
        items.first().and_then(JsonValue::as_f64),
        items.get(1).and_then(JsonValue::as_f64),
        items.len(),
    ) {
        return RawGeometry::Point { x, y };
    }
    let rings = items
        .iter()
        .map(|ring| {
            ring.as_array()
                .map(|points| {
                    points
                        .iter()
                        .filter_map(|p| p.as_array())
                        .map(|p| p.iter().filter_map(number_like).collect())
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect();
    RawGeometry::Rings(rings)
}

pub(crate) fn number_like(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Converts a resolved payload into canonical geometry.
pub fn normalize(
    raw: &RawGeometry,
    convention: WindingConvention,
    fields: &CoordinateFields,
) -> Result<Geometry, GeometryError> {
    match raw {
        RawGeometry::Rings(rings) => normalize_rings(rings, convention),
        RawGeometry::Point { x, y } => point(*x, *y),
        RawGeometry::Attributes(attrs) => {
            let lookup = |names: &[String]| names.iter().find_map(|n| attrs.get(n).and_then(number_like));
            match (lookup(&fields.longitude), lookup(&fields.latitude)) {
                (Some(x), Some(y)) => point(x, y),
                _ => Err(GeometryError::Missing),
            }
        }
    }
}

fn point(x: f64, y: f64) -> Result<Geometry, GeometryError> {
    check_coordinate(x, y)?;
    Ok(Geometry::Point(Coord::new(x, y)))
}

fn check_coordinate(x: f64, y: f64) -> Result<(), GeometryError> {
    if x.is_finite() && y.is_finite() && (-180.0..=180.0).contains(&x) && (-90.0..=90.0).contains(&y) {
        Ok(())
    } else {
        Err(GeometryError::InvalidCoordinate { x, y })
    }
}

fn normalize_rings(rings: &[Vec<Vec<f64>>], convention: WindingConvention) -> Result<Geometry, GeometryError> {
    if rings.iter().all(|r| r.is_empty()) {
        return Err(GeometryError::Empty);
    }

    let mut parts: Vec<Polygon> = Vec::new();
    for raw_ring in rings {
        let coords = distinct_vertices(raw_ring)?;
        if coords.len() < 3 {
            continue;
        }
        let ring = Ring::closed(coords);
        let area = ring.signed_area();
        if area.abs() <= f64::EPSILON {
            continue;
        }
        let is_exterior = match convention {
            WindingConvention::CounterClockwiseExterior => area > 0.0,
            WindingConvention::ClockwiseExterior => area < 0.0,
        };
        match parts.last_mut() {
            Some(current) if !is_exterior => {
                current.holes.push(ring.oriented(Orientation::Clockwise));
            }
            // Exterior, or a hole with no exterior before it.
            _ => parts.push(Polygon::new(ring.oriented(Orientation::CounterClockwise), Vec::new())),
        }
    }

    if parts.is_empty() {
        return Err(GeometryError::Malformed(format!(
            "none of {} ring(s) has three distinct vertices and non-zero area",
            rings.len()
        )));
    }
    Ok(Geometry::MultiPolygon(parts))
}

/// Drops short positions, consecutive duplicates and the closing vertex.
fn distinct_vertices(raw: &[Vec<f64>]) -> Result<Vec<Coord>, GeometryError> {
    let mut coords: Vec<Coord> = Vec::with_capacity(raw.len());
    for position in raw {
        let (Some(&x), Some(&y)) = (position.first(), position.get(1)) else {
            continue;
        };
        check_coordinate(x, y)?;
        let c = Coord::new(x, y);
        if coords.last() != Some(&c) {
            coords.push(c);
        }
    }
    while coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    Ok(coords)
}
