//! Unit mapping and concentration conversions.
//!
//! The table is a two-level lookup `unit → observed property → mapping`. A
//! reading that is already expressed in canonical terms (canonical label and
//! target unit) is left untouched, so applying the table twice is a no-op.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{HarvestError, HarvestResult};
use crate::models::RawReading;

// ---

/// Molar volume at 0 °C and 1 atm, in litres.
pub const MOLAR_VOLUME_STP: f64 = 22.41;
/// Reference temperature for [`MOLAR_VOLUME_STP`], in kelvin.
pub const REFERENCE_TEMPERATURE_K: f64 = 273.16;
/// Reference pressure used by the molar-volume expression, in hPa.
pub const REFERENCE_PRESSURE_HPA: f64 = 1013.0;
pub const DEFAULT_TEMPERATURE_K: f64 = 283.0;
pub const DEFAULT_PRESSURE_HPA: f64 = 1013.25;

const EIONET_UOM: &str = "http://dd.eionet.europa.eu/vocabulary/uom/concentration/";
const EIONET_POLLUTANT: &str = "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/";

/// Target of one `(unit, property)` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitMapping {
    pub label: String,
    pub target_unit: String,
    pub factor: f64,
}

#[derive(Debug, Clone, Default)]
pub struct UnitTable {
    entries: HashMap<String, HashMap<String, UnitMapping>>,
    /// Property ids at or above this value are tolerated when unknown.
    unknown_from: Option<u32>,
}

impl UnitTable {
    pub fn new() -> Self {
        UnitTable::default()
    }

    pub fn with_unknown_range(mut self, from: u32) -> Self {
        self.unknown_from = Some(from);
        self
    }

    pub fn insert(&mut self, unit: &str, property: &str, label: &str, target_unit: &str, factor: f64) {
        self.entries.entry(unit.to_string()).or_default().insert(
            property.to_string(),
            UnitMapping {
                label: label.to_string(),
                target_unit: target_unit.to_string(),
                factor,
            },
        );
    }

    pub fn lookup(&self, unit: &str, property: &str) -> Option<&UnitMapping> {
        self.entries.get(unit).and_then(|by_property| by_property.get(property))
    }

    /// True when `(unit, property)` is already in canonical form.
    pub fn is_canonical(&self, unit: &str, property: &str) -> bool {
        self.entries
            .values()
            .flat_map(|by_property| by_property.values())
            .any(|m| m.label == property && m.target_unit == unit)
    }

    /// Map the reading to canonical property and unit, scaling its value.
    ///
    /// Returns `Ok(None)` when the property is unknown but inside the tolerated
    /// range, and [`HarvestError::MissingConcept`] when it is unknown outside it.
    pub fn apply(&self, mut raw: RawReading) -> HarvestResult<Option<RawReading>> {
        // ---
        if let Some(mapping) = self.lookup(&raw.unit, &raw.property) {
            raw.value = raw.value.scaled(mapping.factor);
            raw.property = mapping.label.clone();
            raw.unit = mapping.target_unit.clone();
            return Ok(Some(raw));
        }
        if self.is_canonical(&raw.unit, &raw.property) {
            return Ok(Some(raw));
        }
        match (self.unknown_from, concept_id(&raw.property)) {
            (Some(from), Some(id)) if id >= from => {
                warn!(
                    "Dropping reading with unknown concept {} (unit {}) for {}",
                    raw.property, raw.unit, raw.sensor_id
                );
                Ok(None)
            }
            _ => Err(HarvestError::MissingConcept {
                unit: raw.unit,
                property: raw.property,
            }),
        }
    }

    /// Mapping for DEFRA AQD observations (EIONET vocabularies).
    pub fn defra_aqd() -> Self {
        // ---
        let mut table = UnitTable::new().with_unknown_range(1000);
        let ug = format!("{}ug.m-3", EIONET_UOM);
        let mg = format!("{}mg.m-3", EIONET_UOM);
        let pollutants: [(u32, &str); 9] = [
            (1, "AQ_SO2"),
            (5, "AQ_PM10"),
            (7, "AQ_O3"),
            (8, "AQ_NO2"),
            (9, "AQ_NOX"),
            (20, "AQ_C6H6"),
            (38, "AQ_NO"),
            (6001, "AQ_PM25"),
            (10, "AQ_CO"),
        ];
        for (id, label) in pollutants {
            let property = format!("{}{}", EIONET_POLLUTANT, id);
            if label == "AQ_CO" {
                table.insert(&mg, &property, label, "mg/m3", 1.0);
                table.insert(&ug, &property, label, "mg/m3", 0.001);
            } else {
                table.insert(&ug, &property, label, "ug/m3", 1.0);
                table.insert(&mg, &property, label, "ug/m3", 1000.0);
            }
        }
        table
    }
}

/// Trailing numeric id of a vocabulary URI (`.../pollutant/6001` → 6001).
pub fn concept_id(uri: &str) -> Option<u32> {
    uri.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// Molar volume in litres at `temperature_k` and `pressure_hpa`.
pub fn molar_volume(temperature_k: f64, pressure_hpa: f64) -> f64 {
    MOLAR_VOLUME_STP * (temperature_k / REFERENCE_TEMPERATURE_K) * (REFERENCE_PRESSURE_HPA / pressure_hpa)
}

/// Convert a ppb mixing ratio to µg/m³.
pub fn ppb_to_ugm3(ppb: f64, molar_mass: f64, temperature_k: f64, pressure_hpa: f64) -> f64 {
    ppb * molar_mass / molar_volume(temperature_k, pressure_hpa)
}

/// [`ppb_to_ugm3`] at the default 283 K and 1013.25 hPa.
pub fn ppb_to_ugm3_default(ppb: f64, molar_mass: f64) -> f64 {
    ppb_to_ugm3(ppb, molar_mass, DEFAULT_TEMPERATURE_K, DEFAULT_PRESSURE_HPA)
}
