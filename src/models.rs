//! Data models for the harvester pipeline.
//!
//! Records move through three shapes: [`RawReading`] as yielded by a source
//! adapter (vendor names, untyped values), [`Reading`] after normalization
//! (canonical property, unit and typed value) and [`WideRow`] after pivoting
//! one row per `(timestamp, sensor)`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ---

pub type Timestamp = DateTime<Utc>;

/// Documented vendor "no data" sentinel.
pub const NO_DATA: f64 = -32768.0;

/// Fill value written by the pivot for metrics absent from a row.
pub const PIVOT_FILL: f64 = -32767.0;

/// Untyped vendor value. Integers and floats stay distinct until coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl FieldValue {
    // ---

    /// Numeric view of the value, parsing text when needed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok(),
            FieldValue::Null => None,
        }
    }

    /// Null or whitespace-only text.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Convert a JSON scalar, keeping the integer/float distinction.
    pub fn from_json(value: &serde_json::Value) -> Self {
        // ---
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    FieldValue::Float(f)
                } else {
                    FieldValue::Text(n.to_string())
                }
            }
            serde_json::Value::String(s) => FieldValue::Text(s.clone()),
            serde_json::Value::Bool(b) => FieldValue::Int(i64::from(*b)),
            other => FieldValue::Text(other.to_string()),
        }
    }

    /// Multiply by a conversion factor. A factor of one leaves the value untouched.
    pub fn scaled(&self, factor: f64) -> FieldValue {
        // ---
        if factor == 1.0 {
            return self.clone();
        }
        match self.as_f64() {
            Some(v) => FieldValue::Float(v * factor),
            None => self.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", format_value(*v)),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Null => Ok(()),
        }
    }
}

/// Per-source quality flags (AQD verification and validity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quality {
    pub verification: i32,
    pub validity: i32,
}

impl Quality {
    /// Verified (1) or preliminary verified (2), and not invalid.
    pub fn is_acceptable(&self) -> bool {
        matches!(self.verification, 1 | 2) && self.validity >= 0
    }
}

/// Reading as produced by a source adapter, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    // ---
    pub sensor_id: String,
    pub site_id: String,
    /// Vendor timestamp text, parsed during coercion.
    pub timestamp: String,
    /// Vendor property name, lower-cased or URI.
    pub property: String,
    /// Vendor unit name or URI, empty when the vendor does not say.
    pub unit: String,
    pub value: FieldValue,
    pub quality: Option<Quality>,
    pub feature_of_interest: Option<String>,
    /// Vendor passthrough fields.
    pub extras: BTreeMap<String, String>,
}

impl RawReading {
    pub fn new(
        sensor_id: impl Into<String>,
        timestamp: impl Into<String>,
        property: impl Into<String>,
        value: FieldValue,
    ) -> Self {
        // ---
        let sensor_id = sensor_id.into();
        RawReading {
            site_id: sensor_id.clone(),
            sensor_id,
            timestamp: timestamp.into(),
            property: property.into(),
            unit: String::new(),
            value,
            quality: None,
            feature_of_interest: None,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = site_id.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature_of_interest = Some(feature.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

/// Normalized reading. `(sensor_id, timestamp, observed_property)` is unique
/// once the dedup step has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub timestamp: Timestamp,
    pub sensor_id: String,
    pub site_id: String,
    pub observed_property: String,
    pub unit: String,
    pub value: Option<f64>,
    pub quality: Option<Quality>,
}

/// One cell of a pivoted row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Value(f64),
    Missing,
}

impl Cell {
    pub fn value(&self) -> Option<f64> {
        match self {
            Cell::Value(v) => Some(*v),
            Cell::Missing => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Value(v) => write!(f, "{}", format_value(*v)),
            Cell::Missing => write!(f, "{}", PIVOT_FILL as i64),
        }
    }
}

/// Pivoted row: one per `(timestamp, sensor_id)`, cells aligned to [`OutputColumns::metrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct WideRow {
    pub timestamp: Timestamp,
    pub sensor_id: String,
    pub cells: Vec<Cell>,
}

/// Fixed column tuple of a source's CSV output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumns {
    /// Name of the identifier column (`sensor`, `station`, ...).
    pub id_column: String,
    pub metrics: Vec<String>,
}

impl OutputColumns {
    pub fn new(id_column: impl Into<String>, metrics: &[&str]) -> Self {
        OutputColumns {
            id_column: id_column.into(),
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// `timestamp`, the id column, then the metrics.
    pub fn header(&self) -> Vec<String> {
        // ---
        let mut header = Vec::with_capacity(self.metrics.len() + 2);
        header.push("timestamp".to_string());
        header.push(self.id_column.clone());
        header.extend(self.metrics.iter().cloned());
        header
    }

    pub fn position(&self, metric: &str) -> Option<usize> {
        self.metrics.iter().position(|m| m == metric)
    }
}

// ---

/// A physical location hosting sensors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub postcode: Option<String>,
    pub first_date: Option<NaiveDate>,
    pub operator: BTreeMap<String, String>,
    pub desc_url: Option<String>,
}

/// One measured channel of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub name: String,
    pub unit: String,
    /// Precision, `10^-decimal_places`.
    pub epsilon: f64,
}

impl Detector {
    pub fn with_decimals(name: impl Into<String>, unit: impl Into<String>, decimals: u32) -> Self {
        Detector {
            name: name.into(),
            unit: unit.into(),
            epsilon: 10f64.powi(-(decimals as i32)),
        }
    }

    /// Decimal places implied by `epsilon`.
    pub fn decimals(&self) -> u32 {
        // ---
        if self.epsilon >= 1.0 || self.epsilon <= 0.0 {
            return 0;
        }
        (-self.epsilon.log10()).round() as u32
    }
}

/// A measurement device, optionally deployed at a site.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub family: String,
    pub provider: BTreeMap<String, String>,
    pub serial_number: Option<String>,
    pub detectors: Vec<Detector>,
    pub first_date: Option<NaiveDate>,
    pub desc_url: Option<String>,
    /// Site of the current deployment.
    pub site_id: Option<String>,
}

// ---

/// Format a float with the shortest plain decimal that round-trips (`1.2`,
/// `0.0`), never in exponent form.
pub fn format_value(v: f64) -> String {
    // ---
    let text = format!("{}", v);
    if v.is_finite() && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}

/// RFC 3339 with second precision and an explicit `+00:00` offset.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parse the timestamp spellings seen across vendors. Naive values are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
    // ---
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    if text.chars().all(|c| c.is_ascii_digit()) && text.len() >= 9 {
        let secs: i64 = text.parse().ok()?;
        // Millisecond epochs have 13 digits.
        return if text.len() >= 13 {
            Utc.timestamp_millis_opt(secs).single()
        } else {
            Utc.timestamp_opt(secs, 0).single()
        };
    }
    None
}

/// Truncate to whole seconds.
pub fn to_second_precision(ts: Timestamp) -> Timestamp {
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::Timelike;

    fn create_test_raw_reading(value: FieldValue) -> RawReading {
        // ---
        RawReading::new("ST1", "2021-06-01T00:00:00Z", "level", value).with_unit("m")
    }

    #[test]
    fn test_json_numbers_keep_int_float_distinction() {
        // ---
        let v: serde_json::Value = serde_json::from_str(r#"[3, 3.0, "3", null]"#).unwrap();
        let items = v.as_array().unwrap();
        assert_eq!(FieldValue::from_json(&items[0]), FieldValue::Int(3));
        assert_eq!(FieldValue::from_json(&items[1]), FieldValue::Float(3.0));
        assert_eq!(FieldValue::from_json(&items[2]), FieldValue::Text("3".into()));
        assert_eq!(FieldValue::from_json(&items[3]), FieldValue::Null);
    }

    #[test]
    fn test_scaled_with_unit_factor_is_identity() {
        // ---
        let raw = create_test_raw_reading(FieldValue::Int(7));
        assert_eq!(raw.value.scaled(1.0), FieldValue::Int(7));
        assert_eq!(raw.value.scaled(2.0), FieldValue::Float(14.0));
    }

    #[test]
    fn test_blank_values() {
        // ---
        assert!(FieldValue::Null.is_blank());
        assert!(FieldValue::Text("  ".into()).is_blank());
        assert!(!FieldValue::Float(0.0).is_blank());
    }

    #[test]
    fn test_cell_formatting() {
        // ---
        assert_eq!(Cell::Value(1.2).to_string(), "1.2");
        assert_eq!(Cell::Value(0.0).to_string(), "0.0");
        assert_eq!(Cell::Missing.to_string(), "-32767");
        assert_eq!(format_value(1e16), "10000000000000000.0");
        assert_eq!(format_value(1.5e-7), "0.00000015");
        assert_eq!(format_value(-3.0), "-3.0");
    }

    #[test]
    fn test_timestamp_formats() {
        // ---
        let expected = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2021-06-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2021-06-01T01:00:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2021-06-01 00:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2021-06-01"), Some(expected));
        assert_eq!(parse_timestamp("1622505600"), Some(expected));
        assert_eq!(parse_timestamp("1622505600000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(format_timestamp(&expected), "2021-06-01T00:00:00+00:00");
    }

    #[test]
    fn test_second_precision() {
        // ---
        let ts = parse_timestamp("2021-06-01T00:00:00.750Z").unwrap();
        assert_eq!(to_second_precision(ts).nanosecond(), 0);
    }

    #[test]
    fn test_detector_epsilon() {
        // ---
        let d = Detector::with_decimals("NO2", "ug/m3", 2);
        assert!((d.epsilon - 0.01).abs() < 1e-12);
        assert_eq!(d.decimals(), 2);
        assert_eq!(Detector::with_decimals("n", "u", 0).decimals(), 0);
    }

    #[test]
    fn test_output_header() {
        // ---
        let cols = OutputColumns::new("station", &["WATER_LEVEL", "RAINFALL"]);
        assert_eq!(cols.header(), vec!["timestamp", "station", "WATER_LEVEL", "RAINFALL"]);
        assert_eq!(cols.position("RAINFALL"), Some(1));
    }

    #[test]
    fn test_quality_rule() {
        // ---
        assert!(Quality { verification: 1, validity: 1 }.is_acceptable());
        assert!(Quality { verification: 2, validity: 0 }.is_acceptable());
        assert!(!Quality { verification: 3, validity: 1 }.is_acceptable());
        assert!(!Quality { verification: 1, validity: -1 }.is_acceptable());
    }
}
