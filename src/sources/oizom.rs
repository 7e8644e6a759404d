//! Oizom / AirSonde devices.
//!
//! Device data arrives as `[{t, payload: {d: {g3: .., p1: ..}}}]` with epoch
//! seconds in `t` and vendor sensor codes in the payload.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{ready, record_readings, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::models::{Detector, OutputColumns, Sensor, Site, Timestamp};
use crate::parsers::json::{array_at, f64_field, str_field};
use crate::transform::RenameMap;

// ---

/// Calibration endpoint, spelled as the vendor serves it.
pub const CALIBRATION_PATH: &str = "devices/calibaration";

const DEVICES_PATH: &str = "devices";
const DATA_PATH: &str = "devicedata";

pub struct OizomAdapter {
    ctx: SourceContext,
}

impl OizomAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        OizomAdapter { ctx }
    }

    async fn devices(&self) -> HarvestResult<Vec<Value>> {
        // ---
        let body = self.ctx.client.get_json(&self.ctx.url(DEVICES_PATH), &[]).await?;
        Ok(match body {
            Value::Array(items) => items,
            other => array_at(&other, "/data").to_vec(),
        })
    }

    /// Calibration coefficients of a device.
    ///
    /// The vendor endpoint at [`CALIBRATION_PATH`] has never answered with a
    /// usable document, so this refuses to call it.
    pub async fn fetch_calibration(&self, device: &str) -> HarvestResult<Value> {
        warn!("Refusing calibration request for {}", device);
        Err(HarvestError::Unsupported(format!(
            "{} is not a working endpoint",
            self.ctx.url(CALIBRATION_PATH)
        )))
    }
}

fn device_id(device: &Value) -> Option<String> {
    str_field(device, "deviceId").or_else(|| str_field(device, "_id"))
}

#[async_trait]
impl Adapter for OizomAdapter {
    fn name(&self) -> &'static str {
        "oizom"
    }

    fn output_columns(&self) -> OutputColumns {
        OutputColumns::new(
            "sensor",
            &[
                "AQ_CO2", "AQ_CO", "AQ_NO2", "AQ_SO2", "AQ_O3", "AQ_PM1", "AQ_PM25", "AQ_PM10", "MET_TEMP",
                "MET_RH", "MET_PRESSURE",
            ],
        )
    }

    fn rename(&self) -> RenameMap {
        RenameMap::from_pairs(&[
            ("g1", "AQ_CO2"),
            ("g2", "AQ_CO"),
            ("g3", "AQ_NO2"),
            ("g4", "AQ_SO2"),
            ("g5", "AQ_O3"),
            ("p1", "AQ_PM25"),
            ("p2", "AQ_PM10"),
            ("p3", "AQ_PM1"),
            ("temp", "MET_TEMP"),
            ("hum", "MET_RH"),
            ("pr", "MET_PRESSURE"),
        ])
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        // ---
        if !self.ctx.cfg.harvester.stations.is_empty() {
            return Ok(self.ctx.cfg.harvester.stations.clone());
        }
        Ok(self.devices().await?.iter().filter_map(device_id).collect())
    }

    async fn list_sites(&self) -> HarvestResult<Vec<Site>> {
        // ---
        let sites = self
            .devices()
            .await?
            .iter()
            .filter_map(|d| {
                let loc = d.get("location").unwrap_or(d);
                Some(Site {
                    id: device_id(d)?,
                    latitude: f64_field(loc, "lat").or_else(|| f64_field(loc, "latitude"))?,
                    longitude: f64_field(loc, "lon").or_else(|| f64_field(loc, "longitude"))?,
                    address: str_field(d, "label"),
                    operator: BTreeMap::from([("name".to_string(), "Oizom".to_string())]),
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
            .devices()
            .await?
            .iter()
            .filter_map(|d| {
                let id = device_id(d)?;
                let detectors = d
                    .get("sensors")
                    .and_then(Value::as_array)
                    .map(|codes| {
                        codes
                            .iter()
                            .filter_map(Value::as_str)
                            .filter_map(|code| rename.get(code))
                            .map(|name| Detector::with_decimals(name, "", 2))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Sensor {
                    id: id.clone(),
                    family: "Oizom".into(),
                    provider: BTreeMap::from([("name".to_string(), "Oizom".to_string())]),
                    serial_number: Some(id.clone()),
                    detectors,
                    site_id: Some(id),
                    ..Sensor::default()
                })
            })
            .collect();
        Ok(sensors)
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let (gte, lte) = (from.timestamp().to_string(), (to.timestamp() - 1).to_string());
        let body = self
            .ctx
            .client
            .get_json(
                &self.ctx.url(DATA_PATH),
                &[("deviceId", stream), ("gte", gte.as_str()), ("lte", lte.as_str())],
            )
            .await?;
        let records = match &body {
            Value::Array(items) => items.as_slice(),
            other => array_at(other, "/data"),
        };
        let mut out = Vec::new();
        for record in records {
            let (Some(t), Some(d)) = (str_field(record, "t"), record.pointer("/payload/d")) else {
                continue;
            };
            out.extend(record_readings(stream, &t, d, &["t"]));
        }
        info!("{} readings from device {}", out.len(), stream);
        Ok(ready(out))
    }
}
