//! EarthSense Zephyr.
//!
//! Data for a window comes back column-wise per cartridge slot:
//! `{"slotB": {"dateTime": {"data": [..]}, "NO2": {"data": [..], "header": {"units": ".."}}}}`.
//! Columns are zipped with `dateTime` into long readings.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::{ready, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::models::{FieldValue, OutputColumns, RawReading, Sensor, Timestamp};
use crate::parsers::json::{array_at, str_field};
use crate::transform::RenameMap;

// ---

const DEFAULT_SLOT: &str = "slotB";
const TIME_COLUMN: &str = "dateTime";

pub struct ZephyrAdapter {
    ctx: SourceContext,
}

impl ZephyrAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        ZephyrAdapter { ctx }
    }

    fn slot(&self) -> &str {
        self.ctx.cfg.option("slot").unwrap_or(DEFAULT_SLOT)
    }
}

/// Zip the columns of one slot into readings.
fn slot_readings(zephyr: &str, slot: &Value) -> HarvestResult<Vec<RawReading>> {
    // ---
    let Some(columns) = slot.as_object() else {
        return Ok(Vec::new());
    };
    let times = columns
        .get(TIME_COLUMN)
        .map(|c| array_at(c, "/data"))
        .ok_or_else(|| HarvestError::Parse(format!("slot of {} has no {} column", zephyr, TIME_COLUMN)))?;

    let mut out = Vec::new();
    for (name, column) in columns {
        if name == TIME_COLUMN {
            continue;
        }
        let values = array_at(column, "/data");
        if values.is_empty() {
            continue;
        }
        if values.len() != times.len() {
            return Err(HarvestError::Parse(format!(
                "{} column {} has {} values for {} timestamps",
                zephyr,
                name,
                values.len(),
                times.len()
            )));
        }
        let unit = column
            .pointer("/header/units")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        for (time, value) in times.iter().zip(values) {
            let Some(time) = time.as_str() else { continue };
            out.push(RawReading::new(zephyr, time, name.as_str(), FieldValue::from_json(value)).with_unit(unit.clone()));
        }
    }
    Ok(out)
}

#[async_trait]
impl Adapter for ZephyrAdapter {
    fn name(&self) -> &'static str {
        "zephyr"
    }

    fn output_columns(&self) -> OutputColumns {
        OutputColumns::new(
            "sensor",
            &["AQ_NO", "AQ_NO2", "AQ_O3", "AQ_PM1", "AQ_PM25", "AQ_PM10", "MET_TEMP", "MET_RH"],
        )
    }

    fn rename(&self) -> RenameMap {
        RenameMap::from_pairs(&[
            ("NO", "AQ_NO"),
            ("NO2", "AQ_NO2"),
            ("O3", "AQ_O3"),
            ("particulatePM1", "AQ_PM1"),
            ("particulatePM2.5", "AQ_PM25"),
            ("particulatePM10", "AQ_PM10"),
            ("tempC", "MET_TEMP"),
            ("humidity", "MET_RH"),
        ])
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        // ---
        if !self.ctx.cfg.harvester.stations.is_empty() {
            return Ok(self.ctx.cfg.harvester.stations.clone());
        }
        let body = self.ctx.client.get_json(&self.ctx.url("zephyrsJSON"), &[]).await?;
        Ok(array_at(&body, "/usersZephyrs")
            .iter()
            .filter_map(|z| str_field(z, "zNumber"))
            .collect())
    }

    async fn list_sensors(&self) -> HarvestResult<Vec<Sensor>> {
        // ---
        let sensors = self
            .streams()
            .await?
            .into_iter()
            .map(|z| Sensor {
                id: format!("Zephyr{}", z),
                family: "EarthSense Zephyr".into(),
                provider: BTreeMap::from([("name".to_string(), "EarthSense".to_string())]),
                serial_number: Some(z),
                ..Sensor::default()
            })
            .collect();
        Ok(sensors)
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let path = format!(
            "dataForViewBySlots/{}/{}/{}/B/def/json/api",
            stream,
            from.format("%Y%m%d%H%M"),
            to.format("%Y%m%d%H%M")
        );
        let body = self.ctx.client.get_json(&self.ctx.url(&path), &[]).await?;
        let readings = match body.get(self.slot()) {
            Some(slot) => slot_readings(stream, slot)?,
            None => {
                debug!("No {} in response for {}", self.slot(), stream);
                Vec::new()
            }
        };
        info!("{} readings from Zephyr {}", readings.len(), stream);
        Ok(ready(readings))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::Config;
    use crate::http::mock::{MockHttpClient, MockReply};
    use crate::http::HttpClient;
    use crate::models::parse_timestamp;
    use crate::sources::SourceKind;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::Arc;

    fn adapter(mock: &MockHttpClient) -> ZephyrAdapter {
        let client: Arc<dyn HttpClient> = Arc::new(mock.clone());
        ZephyrAdapter::new(SourceContext::new(SourceKind::Zephyr, Arc::new(Config::defaults("zephyr")), client))
    }

    #[tokio::test]
    async fn test_columns_are_zipped_with_time() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get(
            "dataForViewBySlots/814/202401010000/202401020000",
            MockReply::Json(json!({"slotB": {
                "dateTime": {"data": ["2024-01-01T00:00:00+00:00", "2024-01-01T00:15:00+00:00"]},
                "NO2": {"data": [10.5, null], "header": {"units": "ug/m3"}},
                "tempC": {"data": [4.0, 4.5]}
            }})),
        );
        let from = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let to = parse_timestamp("2024-01-02T00:00:00Z").unwrap();
        let readings: Vec<RawReading> = adapter(&mock)
            .fetch_window("814", from, to)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(readings.len(), 4);
        let no2: Vec<&RawReading> = readings.iter().filter(|r| r.property == "NO2").collect();
        assert_eq!(no2[0].unit, "ug/m3");
        assert_eq!(no2[1].value, FieldValue::Null);
    }

    #[test]
    fn test_ragged_columns_are_rejected() {
        // ---
        let slot = json!({"dateTime": {"data": ["a", "b"]}, "NO2": {"data": [1]}});
        assert!(matches!(slot_readings("814", &slot), Err(HarvestError::Parse(_))));
    }
}
