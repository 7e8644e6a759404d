//! Row filters: missing values, quality flags and feature selection.

use std::collections::HashSet;

use crate::models::{RawReading, NO_DATA};

// ---

/// Blank values and the `-32768` no-data sentinel.
pub fn is_missing(raw: &RawReading) -> bool {
    raw.value.is_blank() || raw.value.as_f64() == Some(NO_DATA)
}

/// Readings without quality flags pass; flagged readings must be verified
/// (1 or 2) and valid (≥ 0).
pub fn passes_quality(raw: &RawReading) -> bool {
    raw.quality.map_or(true, |q| q.is_acceptable())
}

/// Selected set of features of interest. An empty selection keeps everything.
#[derive(Debug, Clone, Default)]
pub struct FeatureFilter {
    selected: HashSet<String>,
}

impl FeatureFilter {
    pub fn new<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FeatureFilter {
            selected: features.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Matches either the full feature URI or its last path segment.
    pub fn keeps(&self, raw: &RawReading) -> bool {
        // ---
        if self.selected.is_empty() {
            return true;
        }
        match &raw.feature_of_interest {
            Some(feature) => {
                let local = feature.rsplit('/').next().unwrap_or(feature);
                self.selected.contains(feature) || self.selected.contains(local)
            }
            None => true,
        }
    }
}
