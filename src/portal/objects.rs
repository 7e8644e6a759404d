//! Mirror objects of the Awesome portal.
//!
//! Named objects are upserted by case-insensitive name; readings only travel
//! through the bulk endpoints.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{format_timestamp, Timestamp};

// ---

/// Anything the portal stores under `/{edge}`.
pub trait PortalObject {
    /// Collection path segment (`locations`, `reading-types`).
    fn edge(&self) -> &'static str;

    /// Request body for POST and PATCH.
    fn to_json(&self) -> Value;
}

/// Portal object with a natural key.
pub trait NamedObject: PortalObject {
    fn name(&self) -> &str;
}

macro_rules! named {
    ($ty:ty, $edge:expr) => {
        impl NamedObject for $ty {
            fn name(&self) -> &str {
                &self.name
            }
        }

        impl $ty {
            pub const EDGE: &'static str = $edge;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
}

impl PortalObject for Location {
    fn edge(&self) -> &'static str {
        Location::EDGE
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "lat": self.lat,
            "lon": self.lon,
            "elevation": self.elevation,
        })
    }
}

named!(Location, "locations");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorCategory {
    pub name: String,
    pub description: Option<String>,
}

impl PortalObject for SensorCategory {
    fn edge(&self) -> &'static str {
        SensorCategory::EDGE
    }

    fn to_json(&self) -> Value {
        json!({ "name": self.name, "description": self.description })
    }
}

named!(SensorCategory, "sensor-categories");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorType {
    pub name: String,
    pub description: Option<String>,
    pub sensor_category_id: Option<i64>,
}

impl PortalObject for SensorType {
    fn edge(&self) -> &'static str {
        SensorType::EDGE
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "sensor_category_id": self.sensor_category_id,
        })
    }
}

named!(SensorType, "sensor-types");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub name: String,
    pub active: bool,
    pub location_id: Option<i64>,
    pub sensor_type_id: Option<i64>,
}

impl PortalObject for Sensor {
    fn edge(&self) -> &'static str {
        Sensor::EDGE
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "active": self.active,
            "location_id": self.location_id,
            "sensor_type_id": self.sensor_type_id,
        })
    }
}

named!(Sensor, "sensors");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingCategory {
    pub name: String,
    pub icon_name: Option<String>,
}

impl PortalObject for ReadingCategory {
    fn edge(&self) -> &'static str {
        ReadingCategory::EDGE
    }

    fn to_json(&self) -> Value {
        json!({ "name": self.name, "icon_name": self.icon_name })
    }
}

named!(ReadingCategory, "reading-categories");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingType {
    pub name: String,
    pub unit: Option<String>,
    pub reading_category_id: Option<i64>,
}

impl PortalObject for ReadingType {
    fn edge(&self) -> &'static str {
        ReadingType::EDGE
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "unit": self.unit,
            "reading_category_id": self.reading_category_id,
        })
    }
}

named!(ReadingType, "reading-types");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqiStandard {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub breakpoints: Value,
}

impl PortalObject for AqiStandard {
    fn edge(&self) -> &'static str {
        AqiStandard::EDGE
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "breakpoints": self.breakpoints,
        })
    }
}

named!(AqiStandard, "aqi-standards");

/// A single measurement, posted in bulk.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sensor_id: i64,
    pub reading_type_id: i64,
    pub value: f64,
    pub created: Timestamp,
}

impl PortalObject for Reading {
    fn edge(&self) -> &'static str {
        "readings"
    }

    fn to_json(&self) -> Value {
        json!({
            "sensor_id": self.sensor_id,
            "reading_type_id": self.reading_type_id,
            "value": self.value,
            "created": format_timestamp(&self.created),
        })
    }
}

/// A computed index value, posted in bulk.
#[derive(Debug, Clone, PartialEq)]
pub struct AqiReading {
    pub location_id: i64,
    pub aqi_standard_id: i64,
    pub value: u8,
    pub created: Timestamp,
}

impl PortalObject for AqiReading {
    fn edge(&self) -> &'static str {
        "aqi-readings"
    }

    fn to_json(&self) -> Value {
        json!({
            "location_id": self.location_id,
            "aqi_standard_id": self.aqi_standard_id,
            "value": self.value,
            "created": format_timestamp(&self.created),
        })
    }
}
