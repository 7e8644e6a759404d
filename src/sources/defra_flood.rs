//! Environment Agency flood-monitoring API (DEFRA flood data).
//!
//! Each day is fetched from the daily archive `readings-full-YYYY-MM-DD.csv`;
//! days the archive does not have yet (404) fall back to the live per-station
//! readings endpoint.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{days, in_window, ready, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::models::{Detector, FieldValue, OutputColumns, RawReading, Sensor, Site, Timestamp};
use crate::parsers::json::{array_at, f64_field, str_field};
use crate::parsers::parse_records;
use crate::transform::RenameMap;

// ---

pub struct DefraFloodAdapter {
    ctx: SourceContext,
}

/// Mean of a value that may hold several readings (`"0.121|0.130"`).
pub fn mean_of_multi_value(text: &str) -> Option<f64> {
    // ---
    let parts: Vec<f64> = text
        .split('|')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::parse::<f64>)
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().sum::<f64>() / parts.len() as f64)
}

fn flood_value(text: &str) -> FieldValue {
    // ---
    let text = text.trim();
    if text.contains('|') {
        return mean_of_multi_value(text)
            .map(FieldValue::Float)
            .unwrap_or_else(|| FieldValue::Text(text.to_string()));
    }
    FieldValue::Text(text.to_string())
}

/// Parameter of a measure id (`.../measures/L1931-level-stage-i-15_min-m` → `level`).
pub(crate) fn measure_parameter(measure: &str) -> Option<&str> {
    let local = measure.trim_end_matches('/').rsplit('/').next()?;
    local.split('-').nth(1)
}

impl DefraFloodAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        DefraFloodAdapter { ctx }
    }

    fn selected(&self, station: &str) -> bool {
        let stations = &self.ctx.cfg.harvester.stations;
        stations.is_empty() || stations.iter().any(|s| s == station)
    }

    async fn archive_day(&self, day: NaiveDate) -> HarvestResult<Vec<RawReading>> {
        // ---
        let url = self
            .ctx
            .url(&format!("archive/readings-full-{}.csv", day.format("%Y-%m-%d")));
        let text = self.ctx.client.get_text(&url, &[]).await?;
        let records = parse_records(&text, b',')?;

        let readings: Vec<RawReading> = records
            .iter()
            .map(|r| {
                let get = |k: &str| r.get(k).cloned().unwrap_or_default();
                let station = get("stationreference");
                let parameter = match get("parameter") {
                    p if p.is_empty() => measure_parameter(&get("measure")).unwrap_or("").to_string(),
                    p => p,
                };
                RawReading::new(station, get("datetime"), parameter, flood_value(&get("value")))
                    .with_unit(get("unitname"))
                    .with_extra("measure", get("measure"))
            })
            .collect();
        debug!("Archive {} has {} rows", day, readings.len());
        Ok(readings.into_iter().filter(|r| self.selected(&r.sensor_id)).collect())
    }

    async fn live_day(&self, day: NaiveDate) -> HarvestResult<Vec<RawReading>> {
        // ---
        let stations = self.ctx.require_stations("defra-flood live fallback")?;
        let next = day.succ_opt().unwrap_or(day);
        let (start, end) = (day.format("%Y-%m-%d").to_string(), next.format("%Y-%m-%d").to_string());
        let mut out = Vec::new();
        for station in stations {
            let url = self.ctx.url(&format!("id/stations/{}/readings", station));
            let page = self
                .ctx
                .client
                .get_json(
                    &url,
                    &[
                        ("startdate", start.as_str()),
                        ("enddate", end.as_str()),
                        ("_sorted", ""),
                        ("_limit", "10000"),
                    ],
                )
                .await?;
            let items = array_at(&page, "/items");
            for item in items {
                let measure = str_field(item, "measure").unwrap_or_default();
                let value = match item.get("value") {
                    Some(Value::String(s)) => flood_value(s),
                    Some(v) => FieldValue::from_json(v),
                    None => FieldValue::Null,
                };
                out.push(
                    RawReading::new(
                        station.clone(),
                        str_field(item, "dateTime").unwrap_or_default(),
                        measure_parameter(&measure).unwrap_or(""),
                        value,
                    )
                    .with_extra("measure", measure.clone()),
                );
            }
        }
        Ok(out)
    }

    async fn station_items(&self) -> HarvestResult<Vec<Value>> {
        // ---
        let (lat, lon) = self.ctx.cfg.harvester.centre;
        let (lat, lon, dist) = (lat.to_string(), lon.to_string(), self.ctx.cfg.harvester.radius_km.to_string());
        let page = self
            .ctx
            .client
            .get_json(
                &self.ctx.url("id/stations"),
                &[
                    ("lat", lat.as_str()),
                    ("long", lon.as_str()),
                    ("dist", dist.as_str()),
                    ("_limit", "10000"),
                ],
            )
            .await?;
        Ok(array_at(&page, "/items")
            .iter()
            .filter(|item| str_field(item, "stationReference").is_some_and(|s| self.selected(&s)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Adapter for DefraFloodAdapter {
    fn name(&self) -> &'static str {
        "defra-flood"
    }

    fn output_columns(&self) -> OutputColumns {
        OutputColumns::new(
            "station",
            &["WATER_LEVEL", "WATER_FLOW", "WIND_SPEED", "MET_TEMP", "RAINFALL"],
        )
    }

    fn rename(&self) -> RenameMap {
        RenameMap::from_pairs(&[
            ("level", "WATER_LEVEL"),
            ("flow", "WATER_FLOW"),
            ("wind", "WIND_SPEED"),
            ("temperature", "MET_TEMP"),
            ("rainfall", "RAINFALL"),
        ])
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        Ok(vec![self.name().to_string()])
    }

    async fn list_sites(&self) -> HarvestResult<Vec<Site>> {
        // ---
        let sites = self
            .station_items()
            .await?
            .iter()
            .filter_map(|item| {
                Some(Site {
                    id: str_field(item, "stationReference")?,
                    latitude: f64_field(item, "lat")?,
                    longitude: f64_field(item, "long")?,
                    address: str_field(item, "label"),
                    city: str_field(item, "town"),
                    country: Some("England".into()),
                    first_date: str_field(item, "dateOpened")
                        .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
                    operator: BTreeMap::from([("name".to_string(), "Environment Agency".to_string())]),
                    desc_url: str_field(item, "@id"),
                    ..Site::default()
                })
            })
            .collect();
        Ok(sites)
    }

    async fn list_sensors(&self) -> HarvestResult<Vec<Sensor>> {
        // ---
        let rename = self.rename();
        let sensors = self
            .station_items()
            .await?
            .iter()
            .filter_map(|item| {
                let id = str_field(item, "stationReference")?;
                let detectors = array_at(item, "/measures")
                    .iter()
                    .filter_map(|m| {
                        let parameter = str_field(m, "parameter")?;
                        let name = rename.get(&parameter).unwrap_or(&parameter).to_string();
                        Some(Detector::with_decimals(name, str_field(m, "unitName").unwrap_or_default(), 3))
                    })
                    .collect();
                Some(Sensor {
                    id: id.clone(),
                    family: "EA flood monitoring".into(),
                    provider: BTreeMap::from([("name".to_string(), "Environment Agency".to_string())]),
                    detectors,
                    desc_url: str_field(item, "@id"),
                    site_id: Some(id),
                    ..Sensor::default()
                })
            })
            .collect();
        Ok(sensors)
    }

    async fn fetch_window(&self, _stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let mut out = Vec::new();
        for day in days(from, to) {
            match self.archive_day(day).await {
                Ok(readings) => out.extend(readings),
                Err(HarvestError::Client { status: 404, .. }) => {
                    warn!("No archive for {}, querying live readings", day);
                    out.extend(self.live_day(day).await?);
                }
                Err(e) => return Err(e),
            }
        }
        let out = in_window(out, from, to);
        info!("{} flood readings between {} and {}", out.len(), from, to);
        Ok(ready(out))
    }
}
