//! Transform pipeline: rename → unit map → missing/quality/feature filters →
//! coercion → dedup, then pivot → sort → chunk.
//!
//! [`Pipeline`] normalizes one [`RawReading`] at a time so a stream can be
//! consumed lazily; [`Pipeline::finish`] pivots a normalized window into
//! ordered [`WideRow`]s.

mod coerce;
mod filter;
mod pivot;
mod rename;
mod units;

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::error::{HarvestError, HarvestResult};
use crate::models::{parse_timestamp, to_second_precision, OutputColumns, RawReading, Reading, WideRow};

pub use coerce::{coerce_value, FieldType, UnknownFieldType};
pub use filter::{is_missing, passes_quality, FeatureFilter};
pub use pivot::{chunk, pivot, sort_rows};
pub use rename::RenameMap;
pub use units::{concept_id, molar_volume, ppb_to_ugm3, ppb_to_ugm3_default, UnitMapping, UnitTable};

// ---

/// Per-source transform configuration.
#[derive(Debug, Clone)]
pub struct TransformSpec {
    pub rename: RenameMap,
    /// Applied only by sources reporting vocabulary units (SOS, Atom).
    pub units: Option<UnitTable>,
    pub features: FeatureFilter,
    /// `[fields]` coercers keyed by lower-cased label.
    pub fields: BTreeMap<String, FieldType>,
    pub columns: OutputColumns,
}

impl TransformSpec {
    pub fn new(columns: OutputColumns) -> Self {
        TransformSpec {
            rename: RenameMap::new(),
            units: None,
            features: FeatureFilter::default(),
            fields: BTreeMap::new(),
            columns,
        }
    }

    pub fn with_rename(mut self, rename: RenameMap) -> Self {
        self.rename = rename;
        self
    }

    pub fn with_units(mut self, units: UnitTable) -> Self {
        self.units = Some(units);
        self
    }
}

/// Row counters for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub retrieved: usize,
    pub missing: usize,
    pub rejected: usize,
    pub unknown: usize,
    pub duplicate: usize,
}

impl TransformStats {
    pub fn dropped(&self) -> usize {
        self.missing + self.rejected + self.unknown + self.duplicate
    }

    pub fn merge(&mut self, other: &TransformStats) {
        self.retrieved += other.retrieved;
        self.missing += other.missing;
        self.rejected += other.rejected;
        self.unknown += other.unknown;
        self.duplicate += other.duplicate;
    }
}

/// Stateful normalizer for one stream. Remembers seen keys for dedup within
/// the current window; the bookmark filters repeats across windows.
#[derive(Debug)]
pub struct Pipeline<'a> {
    spec: &'a TransformSpec,
    seen: HashSet<(String, i64, String)>,
    pub stats: TransformStats,
}

impl<'a> Pipeline<'a> {
    pub fn new(spec: &'a TransformSpec) -> Self {
        Pipeline {
            spec,
            seen: HashSet::new(),
            stats: TransformStats::default(),
        }
    }

    /// Normalize one reading. `Ok(None)` means it was dropped and counted.
    pub fn push(&mut self, raw: RawReading) -> HarvestResult<Option<Reading>> {
        // ---
        self.stats.retrieved += 1;
        match self.normalize(raw) {
            Ok(Some(reading)) => {
                let key = (
                    reading.sensor_id.clone(),
                    reading.timestamp.timestamp(),
                    reading.observed_property.clone(),
                );
                if self.seen.insert(key) {
                    Ok(Some(reading))
                } else {
                    self.stats.duplicate += 1;
                    Ok(None)
                }
            }
            Ok(None) => Ok(None),
            Err(HarvestError::Validation(msg)) => {
                debug!("Dropping row: {}", msg);
                self.stats.rejected += 1;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Normalize one window, stopping at the first stream-aborting error.
    pub fn run<I>(&mut self, raws: I) -> HarvestResult<Vec<Reading>>
    where
        I: IntoIterator<Item = RawReading>,
    {
        // ---
        self.seen.clear();
        let mut out = Vec::new();
        for raw in raws {
            if let Some(reading) = self.push(raw)? {
                out.push(reading);
            }
        }
        Ok(out)
    }

    /// Pivot and order a normalized window.
    pub fn finish(&self, readings: &[Reading]) -> Vec<WideRow> {
        // ---
        let mut rows = pivot(readings, &self.spec.columns);
        sort_rows(&mut rows);
        rows
    }

    fn normalize(&mut self, mut raw: RawReading) -> HarvestResult<Option<Reading>> {
        // ---
        self.spec.rename.apply(&mut raw);

        if let Some(units) = &self.spec.units {
            match units.apply(raw)? {
                Some(mapped) => raw = mapped,
                None => {
                    self.stats.unknown += 1;
                    return Ok(None);
                }
            }
        }

        if is_missing(&raw) {
            self.stats.missing += 1;
            return Ok(None);
        }
        if !passes_quality(&raw) {
            return Err(HarvestError::Validation(format!(
                "quality {:?} rejected for {} at {}",
                raw.quality, raw.sensor_id, raw.timestamp
            )));
        }
        if !self.spec.features.keeps(&raw) {
            return Err(HarvestError::Validation(format!(
                "feature {:?} not selected",
                raw.feature_of_interest
            )));
        }

        self.coerce(raw).map(Some)
    }

    fn coerce(&self, raw: RawReading) -> HarvestResult<Reading> {
        // ---
        for (key, text) in &raw.extras {
            if let Some(ty) = self.spec.fields.get(&key.to_lowercase()) {
                ty.check(text).map_err(|e| {
                    warn!("Offending row {} {} {}: {}", raw.sensor_id, raw.timestamp, key, e);
                    HarvestError::Parse(format!("field {}: {}", key, e))
                })?;
            }
        }

        let timestamp = parse_timestamp(&raw.timestamp).ok_or_else(|| {
            warn!("Offending row {} with timestamp '{}'", raw.sensor_id, raw.timestamp);
            HarvestError::Parse(format!("invalid timestamp '{}'", raw.timestamp))
        })?;
        let value = coerce_value(&raw.value).map_err(|e| {
            warn!("Offending row {} {} {}: {}", raw.sensor_id, raw.timestamp, raw.property, e);
            HarvestError::Parse(format!("{} for {}", e, raw.property))
        })?;

        Ok(Reading {
            timestamp: to_second_precision(timestamp),
            sensor_id: raw.sensor_id,
            site_id: raw.site_id,
            observed_property: raw.property,
            unit: raw.unit,
            value,
            quality: raw.quality,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{FieldValue, Quality};
    use tokio_test::{assert_err, assert_ok};

    fn spec() -> TransformSpec {
        // ---
        TransformSpec::new(OutputColumns::new(
            "station",
            &["WATER_LEVEL", "WATER_FLOW", "WIND_SPEED", "MET_TEMP", "RAINFALL"],
        ))
        .with_rename(RenameMap::from_pairs(&[
            ("level", "WATER_LEVEL"),
            ("flow", "WATER_FLOW"),
            ("rainfall", "RAINFALL"),
        ]))
    }

    fn raw(property: &str, value: FieldValue) -> RawReading {
        RawReading::new("ST1", "2021-06-01T00:00:00Z", property, value)
    }

    #[test]
    fn test_flood_rows_pivot_into_one_line() {
        // ---
        let spec = spec();
        let mut pipeline = Pipeline::new(&spec);
        let readings = assert_ok!(pipeline.run(vec![
            raw("level", FieldValue::Float(1.2)),
            raw("flow", FieldValue::Float(3.4)),
            raw("rainfall", FieldValue::Float(0.0)),
        ]));
        let rows = pipeline.finish(&readings);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sensor_id, "ST1");
        assert_eq!(pipeline.stats.retrieved, 3);
        assert_eq!(pipeline.stats.dropped(), 0);
    }

    #[test]
    fn test_drops_are_counted_not_fatal() {
        // ---
        let spec = spec();
        let mut pipeline = Pipeline::new(&spec);
        let readings = assert_ok!(pipeline.run(vec![
            raw("level", FieldValue::Float(-32768.0)),
            raw("level", FieldValue::Text(String::new())),
            raw("flow", FieldValue::Float(1.0)).with_quality(Quality { verification: 3, validity: 1 }),
            raw("rainfall", FieldValue::Float(0.2)),
            raw("rainfall", FieldValue::Float(0.3)),
        ]));
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, Some(0.2));
        assert_eq!(pipeline.stats.missing, 2);
        assert_eq!(pipeline.stats.rejected, 1);
        assert_eq!(pipeline.stats.duplicate, 1);
        assert_eq!(pipeline.stats.dropped(), 4);
    }

    #[test]
    fn test_dedup_keys_do_not_outlive_the_window() {
        // ---
        let spec = spec();
        let mut pipeline = Pipeline::new(&spec);
        for hour in 0..24 {
            let at = format!("2021-06-01T{:02}:00:00Z", hour);
            let window = vec![
                RawReading::new("ST1", at.as_str(), "level", FieldValue::Float(1.0)),
                RawReading::new("ST1", at.as_str(), "level", FieldValue::Float(2.0)),
            ];
            assert_eq!(assert_ok!(pipeline.run(window)).len(), 1);
            assert_eq!(pipeline.seen.len(), 1);
        }
        assert_eq!(pipeline.stats.duplicate, 24);
    }

    #[test]
    fn test_bad_timestamp_fails_the_stream() {
        // ---
        let spec = spec();
        let mut pipeline = Pipeline::new(&spec);
        let bad = RawReading::new("ST1", "not a time", "level", FieldValue::Float(1.0));
        let err = assert_err!(pipeline.push(bad));
        assert!(matches!(err, HarvestError::Parse(_)));
    }

    #[test]
    fn test_field_coercer_checks_extras() {
        // ---
        let mut spec = spec();
        spec.fields.insert("count".into(), FieldType::Int);
        let mut pipeline = Pipeline::new(&spec);
        assert_ok!(pipeline.push(raw("level", FieldValue::Float(1.0)).with_extra("Count", "")));
        assert_err!(pipeline.push(raw("flow", FieldValue::Float(1.0)).with_extra("count", "many")));
    }

    #[test]
    fn test_unit_table_is_applied_when_configured() {
        // ---
        let spec = TransformSpec::new(OutputColumns::new("sensor", &["AQ_NO2"]))
            .with_units(UnitTable::defra_aqd());
        let mut pipeline = Pipeline::new(&spec);
        let r = RawReading::new(
            "SP1",
            "2024-01-01T00:00:00Z",
            "http://dd.eionet.europa.eu/vocabulary/aq/pollutant/8",
            FieldValue::Text("41.5".into()),
        )
        .with_unit("http://dd.eionet.europa.eu/vocabulary/uom/concentration/ug.m-3");
        let reading = assert_ok!(pipeline.push(r)).unwrap();
        assert_eq!(reading.observed_property, "AQ_NO2");
        assert_eq!(reading.value, Some(41.5));
    }
}
