//! Aeroqual Cloud.
//!
//! The session logs in with a user/password form and keeps the cookie. Data is
//! requested per instrument serial and window; each record is one wide row
//! keyed by `Time`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::{ready, record_readings, Adapter, RawStream, SourceContext};
use crate::error::HarvestResult;
use crate::models::{Detector, OutputColumns, Sensor, Timestamp};
use crate::parsers::json::{array_at, str_field};
use crate::transform::RenameMap;

// ---

const TIME_FIELD: &str = "Time";

pub struct AeroqualAdapter {
    ctx: SourceContext,
}

impl AeroqualAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        AeroqualAdapter { ctx }
    }

    /// Instruments visible to the account, as `(serial, name)`.
    async fn instruments(&self) -> HarvestResult<Vec<(String, Option<String>)>> {
        // ---
        let body = self.ctx.client.get_json(&self.ctx.url("api/instrument"), &[]).await?;
        let items = match &body {
            Value::Array(items) => items.as_slice(),
            other => array_at(other, "/instruments"),
        };
        Ok(items
            .iter()
            .filter_map(|item| match item {
                Value::String(serial) => Some((serial.clone(), None)),
                other => str_field(other, "serial")
                    .or_else(|| str_field(other, "serialNumber"))
                    .map(|serial| (serial, str_field(other, "name"))),
            })
            .collect())
    }
}

#[async_trait]
impl Adapter for AeroqualAdapter {
    fn name(&self) -> &'static str {
        "aeroqual"
    }

    fn output_columns(&self) -> OutputColumns {
        OutputColumns::new(
            "sensor",
            &["AQ_NO2", "AQ_O3", "AQ_PM10", "AQ_PM25", "MET_TEMP", "MET_RH"],
        )
    }

    fn rename(&self) -> RenameMap {
        RenameMap::from_pairs(&[
            ("no2", "AQ_NO2"),
            ("o3", "AQ_O3"),
            ("pm10", "AQ_PM10"),
            ("pm2.5", "AQ_PM25"),
            ("pm25", "AQ_PM25"),
            ("temp", "MET_TEMP"),
            ("rh", "MET_RH"),
        ])
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        // ---
        if !self.ctx.cfg.harvester.stations.is_empty() {
            return Ok(self.ctx.cfg.harvester.stations.clone());
        }
        Ok(self.instruments().await?.into_iter().map(|(serial, _)| serial).collect())
    }

    async fn list_sensors(&self) -> HarvestResult<Vec<Sensor>> {
        // ---
        let columns = self.output_columns();
        let sensors = self
            .instruments()
            .await?
            .into_iter()
            .map(|(serial, label)| {
                let mut provider = BTreeMap::from([("name".to_string(), "Aeroqual".to_string())]);
                if let Some(label) = label {
                    provider.insert("label".to_string(), label);
                }
                Sensor {
                    id: serial.clone(),
                    family: "Aeroqual".into(),
                    provider,
                    serial_number: Some(serial),
                    detectors: columns
                        .metrics
                        .iter()
                        .map(|m| Detector::with_decimals(m.as_str(), if m.starts_with("AQ_") { "ug/m3" } else { "" }, 1))
                        .collect(),
                    ..Sensor::default()
                }
            })
            .collect();
        Ok(sensors)
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let path = format!(
            "api/data/{}/{}/{}",
            stream,
            from.format("%Y-%m-%dT%H:%M:%S"),
            to.format("%Y-%m-%dT%H:%M:%S")
        );
        let body = self
            .ctx
            .client
            .get_json(&self.ctx.url(&path), &[("averagingperiod", "1"), ("includejournal", "false")])
            .await?;
        let mut out = Vec::new();
        for record in array_at(&body, "/data") {
            let Some(time) = str_field(record, TIME_FIELD) else {
                debug!("Record without {} from {}", TIME_FIELD, stream);
                continue;
            };
            out.extend(record_readings(stream, &time, record, &[TIME_FIELD]));
        }
        info!("{} readings from instrument {}", out.len(), stream);
        Ok(ready(out))
    }
}
