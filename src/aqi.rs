//! Daily Air Quality Index.
//!
//! Each pollutant is smoothed with its rolling-mean window over `(t - w, t]`,
//! rounded to the nearest integer and banded against nine ascending
//! thresholds. The overall index at `t` is the highest pollutant band.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Duration;

use crate::error::{HarvestError, HarvestResult};
use crate::models::{parse_timestamp, Timestamp, NO_DATA, PIVOT_FILL};
use crate::parsers::parse_records;
use crate::transform::ppb_to_ugm3_default;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Pollutant {
    Ozone,
    NitrogenDioxide,
    SulphurDioxide,
    Particles25,
    Particles10,
}

impl Pollutant {
    pub const ALL: [Pollutant; 5] = [
        Pollutant::Ozone,
        Pollutant::NitrogenDioxide,
        Pollutant::SulphurDioxide,
        Pollutant::Particles25,
        Pollutant::Particles10,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Pollutant::Ozone => "ozone",
            Pollutant::NitrogenDioxide => "nitrogen_dioxide",
            Pollutant::SulphurDioxide => "sulphur_dioxide",
            Pollutant::Particles25 => "particles_25",
            Pollutant::Particles10 => "particles_10",
        }
    }

    /// Canonical UFO property carrying this pollutant.
    pub fn property(&self) -> &'static str {
        match self {
            Pollutant::Ozone => "AQ_O3",
            Pollutant::NitrogenDioxide => "AQ_NO2",
            Pollutant::SulphurDioxide => "AQ_SO2",
            Pollutant::Particles25 => "AQ_PM25",
            Pollutant::Particles10 => "AQ_PM10",
        }
    }

    /// Accepts vocabulary names and canonical properties, any case.
    pub fn from_name(name: &str) -> Option<Pollutant> {
        Pollutant::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name) || p.property().eq_ignore_ascii_case(name))
    }

    /// Upper bounds of bands 1..9, µg/m³.
    pub fn thresholds(&self) -> [f64; 9] {
        match self {
            Pollutant::Ozone => [33.0, 66.0, 100.0, 120.0, 140.0, 160.0, 187.0, 213.0, 240.0],
            Pollutant::NitrogenDioxide => [67.0, 134.0, 200.0, 267.0, 334.0, 400.0, 467.0, 534.0, 600.0],
            Pollutant::SulphurDioxide => [88.0, 177.0, 266.0, 354.0, 443.0, 532.0, 710.0, 887.0, 1064.0],
            Pollutant::Particles25 => [11.0, 23.0, 35.0, 41.0, 47.0, 53.0, 58.0, 64.0, 70.0],
            Pollutant::Particles10 => [16.0, 33.0, 50.0, 58.0, 66.0, 75.0, 83.0, 91.0, 100.0],
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            Pollutant::NitrogenDioxide => Duration::hours(1),
            Pollutant::SulphurDioxide => Duration::minutes(15),
            Pollutant::Ozone => Duration::hours(8),
            Pollutant::Particles25 | Pollutant::Particles10 => Duration::hours(24),
        }
    }

    /// g/mol, for gases only.
    pub fn molar_mass(&self) -> Option<f64> {
        match self {
            Pollutant::Ozone => Some(47.9982),
            Pollutant::NitrogenDioxide => Some(46.0055),
            Pollutant::SulphurDioxide => Some(64.066),
            Pollutant::Particles25 | Pollutant::Particles10 => None,
        }
    }

    /// Convert a concentration in `unit` to µg/m³.
    pub fn to_ugm3(&self, value: f64, unit: &str) -> HarvestResult<f64> {
        // ---
        match unit.trim().to_lowercase().as_str() {
            "" | "ug/m3" | "µg/m3" | "µg/m³" | "ugm-3" => Ok(value),
            "mg/m3" => Ok(value * 1000.0),
            "ppb" => self
                .molar_mass()
                .map(|m| ppb_to_ugm3_default(value, m))
                .ok_or_else(|| HarvestError::Validation(format!("{} cannot be given in ppb", self.name()))),
            other => Err(HarvestError::Validation(format!("unsupported unit '{}' for {}", other, self.name()))),
        }
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl Band {
    pub fn from_index(index: u8) -> Band {
        match index {
            0..=3 => Band::Low,
            4..=6 => Band::Moderate,
            7..=9 => Band::High,
            _ => Band::VeryHigh,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Band::Low => "LOW",
            Band::Moderate => "MODERATE",
            Band::High => "HIGH",
            Band::VeryHigh => "VERY HIGH",
        }
    }
}

/// Band 1..10 of a concentration: one plus the number of thresholds at or
/// below the rounded value.
pub fn band(pollutant: Pollutant, value: f64) -> u8 {
    // ---
    let rounded = value.round();
    1 + pollutant.thresholds().iter().filter(|t| **t <= rounded).count() as u8
}

/// Overall index of one set of (already averaged) concentrations. Missing
/// or non-finite inputs are skipped; no valid input gives `None`.
pub fn daqi(values: &BTreeMap<Pollutant, f64>) -> Option<u8> {
    values
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(p, v)| band(*p, *v))
        .max()
}

#[derive(Debug, Clone, PartialEq)]
pub struct AqiRow {
    pub timestamp: Timestamp,
    pub bands: BTreeMap<Pollutant, u8>,
    pub index: Option<u8>,
}

impl AqiRow {
    pub fn band(&self) -> Option<Band> {
        self.index.map(Band::from_index)
    }
}

/// Rolling-average DAQI over a time-indexed table, one output row per input row.
///
/// Rows are sorted by timestamp first. Each pollutant's mean covers the valid
/// values in `(t - window, t]` (at least one value needed).
pub fn compute(rows: &[(Timestamp, BTreeMap<Pollutant, f64>)]) -> Vec<AqiRow> {
    // ---
    let mut rows: Vec<&(Timestamp, BTreeMap<Pollutant, f64>)> = rows.iter().collect();
    rows.sort_by_key(|(ts, _)| *ts);

    let mut means: Vec<BTreeMap<Pollutant, f64>> = vec![BTreeMap::new(); rows.len()];
    for pollutant in Pollutant::ALL {
        let window = pollutant.window();
        let mut start = 0;
        let mut sum = 0.0;
        let mut count = 0usize;
        for (i, (ts, values)) in rows.iter().enumerate() {
            if let Some(v) = values.get(&pollutant).filter(|v| v.is_finite()) {
                sum += v;
                count += 1;
            }
            while rows[start].0 <= *ts - window {
                if let Some(v) = rows[start].1.get(&pollutant).filter(|v| v.is_finite()) {
                    sum -= v;
                    count -= 1;
                }
                start += 1;
            }
            if count > 0 {
                means[i].insert(pollutant, sum / count as f64);
            }
        }
    }

    rows.iter()
        .zip(means)
        .map(|((ts, _), mean)| AqiRow {
            timestamp: *ts,
            bands: mean.iter().map(|(p, v)| (*p, band(*p, *v))).collect(),
            index: daqi(&mean),
        })
        .collect()
}

/// DAQI per sensor from a pipe-delimited readings table (`timestamp|sensor|AQ_O3|...`).
///
/// Columns not naming a pollutant are ignored, as are the `-32767`/`-32768`
/// fill values.
pub fn compute_from_csv(text: &str) -> HarvestResult<BTreeMap<String, Vec<AqiRow>>> {
    // ---
    let records = parse_records(text, b'|')?;
    let mut by_sensor: BTreeMap<String, Vec<(Timestamp, BTreeMap<Pollutant, f64>)>> = BTreeMap::new();

    for record in records {
        let ts_text = record.get("timestamp").map(String::as_str).unwrap_or("");
        let timestamp = parse_timestamp(ts_text)
            .ok_or_else(|| HarvestError::Parse(format!("invalid timestamp '{}'", ts_text)))?;
        let sensor = record
            .get("sensor")
            .or_else(|| record.get("station"))
            .cloned()
            .ok_or_else(|| HarvestError::Parse("readings table without sensor column".into()))?;
        let values = record
            .iter()
            .filter_map(|(column, text)| {
                let pollutant = Pollutant::from_name(column)?;
                let value: f64 = text.parse().ok()?;
                (value != NO_DATA && value != PIVOT_FILL).then_some((pollutant, value))
            })
            .collect();
        by_sensor.entry(sensor).or_default().push((timestamp, values));
    }

    Ok(by_sensor
        .into_iter()
        .map(|(sensor, rows)| (sensor, compute(&rows)))
        .collect())
}
