//! Spatial filters: great-circle distance and GeoJSON polygon containment.

use std::path::Path;

use serde_json::Value;

use crate::error::{HarvestError, HarvestResult};

// ---

/// Mean Earth radius, km.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in km between two `(latitude, longitude)` points in degrees.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    // ---
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// True when `point` lies within `radius_km` of `centre`.
pub fn within_radius(centre: (f64, f64), point: (f64, f64), radius_km: f64) -> bool {
    haversine_km(centre, point) <= radius_km
}

/// Polygon rings in GeoJSON order: `[longitude, latitude]`, first ring outer.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingPolygon {
    polygons: Vec<Vec<Vec<(f64, f64)>>>,
}

impl BoundingPolygon {
    /// Load a GeoJSON file holding a Polygon or MultiPolygon, bare or wrapped in
    /// a Feature or FeatureCollection.
    pub fn from_file(path: &Path) -> HarvestResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_geojson(&text)
    }

    pub fn from_geojson(text: &str) -> HarvestResult<Self> {
        // ---
        let doc: Value = serde_json::from_str(text)?;
        let mut polygons = Vec::new();
        collect_polygons(&doc, &mut polygons)?;
        if polygons.is_empty() {
            return Err(HarvestError::Parse("GeoJSON holds no polygon".into()));
        }
        Ok(BoundingPolygon { polygons })
    }

    /// Ray-casting containment for a `(latitude, longitude)` point. Holes are honoured.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        // ---
        self.polygons.iter().any(|rings| {
            let mut rings = rings.iter();
            let Some(outer) = rings.next() else {
                return false;
            };
            ring_contains(outer, longitude, latitude)
                && !rings.any(|hole| ring_contains(hole, longitude, latitude))
        })
    }
}

fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    // ---
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn collect_polygons(doc: &Value, out: &mut Vec<Vec<Vec<(f64, f64)>>>) -> HarvestResult<()> {
    // ---
    match doc.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            for feature in doc.get("features").and_then(Value::as_array).into_iter().flatten() {
                collect_polygons(feature, out)?;
            }
        }
        Some("Feature") => {
            if let Some(geometry) = doc.get("geometry") {
                collect_polygons(geometry, out)?;
            }
        }
        Some("Polygon") => {
            out.push(parse_rings(doc.get("coordinates"))?);
        }
        Some("MultiPolygon") => {
            let polys = doc
                .get("coordinates")
                .and_then(Value::as_array)
                .ok_or_else(|| HarvestError::Parse("MultiPolygon without coordinates".into()))?;
            for poly in polys {
                out.push(parse_rings(Some(poly))?);
            }
        }
        other => {
            return Err(HarvestError::Parse(format!("unsupported GeoJSON type {:?}", other)));
        }
    }
    Ok(())
}

fn parse_rings(coords: Option<&Value>) -> HarvestResult<Vec<Vec<(f64, f64)>>> {
    // ---
    let rings = coords
        .and_then(Value::as_array)
        .ok_or_else(|| HarvestError::Parse("Polygon without coordinates".into()))?;
    rings
        .iter()
        .map(|ring| {
            ring.as_array()
                .ok_or_else(|| HarvestError::Parse("ring is not an array".into()))?
                .iter()
                .map(|pos| match (pos.get(0).and_then(Value::as_f64), pos.get(1).and_then(Value::as_f64)) {
                    (Some(x), Some(y)) => Ok((x, y)),
                    _ => Err(HarvestError::Parse(format!("bad position {}", pos))),
                })
                .collect()
        })
        .collect()
}
