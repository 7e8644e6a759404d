//! Vendor → canonical property renaming (`METRICS` / `FIELD_MAP` tables).

use std::collections::HashMap;

use crate::models::RawReading;

// ---

/// Case-insensitive map from vendor column names to canonical UFO names.
#[derive(Debug, Clone, Default)]
pub struct RenameMap {
    names: HashMap<String, String>,
}

impl RenameMap {
    pub fn new() -> Self {
        RenameMap::default()
    }

    /// Build from `(vendor, canonical)` pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        // ---
        let names = pairs
            .iter()
            .map(|(vendor, canonical)| (vendor.to_lowercase(), canonical.to_string()))
            .collect();
        RenameMap { names }
    }

    pub fn insert(&mut self, vendor: &str, canonical: &str) {
        self.names.insert(vendor.to_lowercase(), canonical.to_string());
    }

    pub fn get(&self, vendor: &str) -> Option<&str> {
        self.names.get(&vendor.to_lowercase()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Rename the reading's property in place. Unmapped names pass through.
    /// Returns `true` when the name was mapped.
    pub fn apply(&self, raw: &mut RawReading) -> bool {
        match self.get(&raw.property) {
            Some(canonical) => {
                raw.property = canonical.to_string();
                true
            }
            None => false,
        }
    }
}
