//! The Things Network storage integration.
//!
//! Uplinks of an application are read from the storage package as
//! newline-delimited JSON and decoded lazily, one line at a time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;

use super::{record_readings, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::models::{OutputColumns, RawReading, Sensor, Timestamp};
use crate::parsers::json::{array_at, parse_ndjson_line, str_field};
use crate::transform::RenameMap;

// ---

pub struct TtnAdapter {
    ctx: SourceContext,
}

impl TtnAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        TtnAdapter { ctx }
    }

    fn application_id(&self) -> HarvestResult<String> {
        self.ctx
            .cfg
            .api
            .application_id
            .clone()
            .ok_or_else(|| HarvestError::Config("[api] application_id must be set for ttn".into()))
    }
}

/// Readings of one stored uplink (`{"result": {...}}`).
fn uplink_readings(line: &Value) -> Vec<RawReading> {
    // ---
    let uplink = line.get("result").unwrap_or(line);
    let Some(device) = uplink
        .pointer("/end_device_ids/device_id")
        .and_then(Value::as_str)
    else {
        return Vec::new();
    };
    let received = str_field(uplink, "received_at")
        .or_else(|| uplink.pointer("/uplink_message/received_at").and_then(Value::as_str).map(String::from));
    let (Some(received), Some(payload)) = (received, uplink.pointer("/uplink_message/decoded_payload")) else {
        return Vec::new();
    };
    let f_port = uplink
        .pointer("/uplink_message/f_port")
        .map(Value::to_string)
        .unwrap_or_default();
    record_readings(device, &received, payload, &[])
        .into_iter()
        .map(|r| r.with_extra("f_port", f_port.clone()))
        .collect()
}

#[async_trait]
impl Adapter for TtnAdapter {
    fn name(&self) -> &'static str {
        "ttn"
    }

    fn output_columns(&self) -> OutputColumns {
        OutputColumns::new(
            "sensor",
            &["AQ_PM25", "AQ_PM10", "MET_TEMP", "MET_RH", "MET_PRESSURE", "BATTERY"],
        )
    }

    fn rename(&self) -> RenameMap {
        RenameMap::from_pairs(&[
            ("pm2_5", "AQ_PM25"),
            ("pm25", "AQ_PM25"),
            ("pm10", "AQ_PM10"),
            ("temperature", "MET_TEMP"),
            ("humidity", "MET_RH"),
            ("pressure", "MET_PRESSURE"),
            ("battery", "BATTERY"),
        ])
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        Ok(vec![self.application_id()?])
    }

    async fn list_sensors(&self) -> HarvestResult<Vec<Sensor>> {
        // ---
        let app = self.application_id()?;
        let url = self.ctx.url(&format!("api/v3/applications/{}/devices", app));
        let body = self.ctx.client.get_json(&url, &[]).await?;
        let stations = &self.ctx.cfg.harvester.stations;
        let sensors = array_at(&body, "/end_devices")
            .iter()
            .filter_map(|d| d.pointer("/ids/device_id").and_then(Value::as_str))
            .filter(|id| stations.is_empty() || stations.iter().any(|s| s == id))
            .map(|id| Sensor {
                id: id.to_string(),
                family: "TTN".into(),
                provider: BTreeMap::from([
                    ("name".to_string(), "The Things Network".to_string()),
                    ("application".to_string(), app.clone()),
                ]),
                ..Sensor::default()
            })
            .collect();
        Ok(sensors)
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let url = self
            .ctx
            .url(&format!("api/v3/as/applications/{}/packages/storage/uplink_message", stream));
        let (after, before) = (from.to_rfc3339(), to.to_rfc3339());
        let lines = self
            .ctx
            .client
            .stream_lines(&url, &[("after", after.as_str()), ("before", before.as_str())])
            .await?;
        let stations = self.ctx.cfg.harvester.stations.clone();

        let readings = lines
            .map(move |line| -> HarvestResult<Vec<RawReading>> {
                let readings = match parse_ndjson_line(&line?)? {
                    Some(value) => uplink_readings(&value),
                    None => Vec::new(),
                };
                Ok(readings
                    .into_iter()
                    .filter(|r| stations.is_empty() || stations.contains(&r.sensor_id))
                    .collect())
            })
            .map_ok(|batch| stream::iter(batch.into_iter().map(Ok)))
            .try_flatten()
            .boxed();
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::Config;
    use crate::http::mock::{MockHttpClient, MockReply};
    use crate::http::HttpClient;
    use crate::models::{parse_timestamp, FieldValue};
    use crate::sources::SourceKind;
    use std::sync::Arc;

    const UPLINKS: &str = r#"{"result":{"end_device_ids":{"device_id":"node-1"},"received_at":"2024-01-01T10:00:00.5Z","uplink_message":{"f_port":1,"decoded_payload":{"pm2_5":4.2,"temperature":7}}}}

{"result":{"end_device_ids":{"device_id":"node-2"},"received_at":"2024-01-01T10:05:00Z","uplink_message":{"decoded_payload":{"battery":3.6}}}}
"#;

    fn adapter(mock: &MockHttpClient, stations: &[&str]) -> TtnAdapter {
        let mut cfg = Config::defaults("ttn");
        cfg.api.application_id = Some("ufo-app".into());
        cfg.harvester.stations = stations.iter().map(|s| s.to_string()).collect();
        let client: Arc<dyn HttpClient> = Arc::new(mock.clone());
        TtnAdapter::new(SourceContext::new(SourceKind::Ttn, Arc::new(cfg), client))
    }

    #[tokio::test]
    async fn test_uplinks_are_decoded_line_by_line() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("applications/ufo-app/packages/storage/uplink_message?after=", MockReply::Text(UPLINKS.into()));
        let ttn = adapter(&mock, &[]);
        assert_eq!(ttn.streams().await.unwrap(), vec!["ufo-app"]);
        let from = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let to = parse_timestamp("2024-01-02T00:00:00Z").unwrap();
        let readings: Vec<RawReading> = ttn.fetch_window("ufo-app", from, to).await.unwrap().try_collect().await.unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0].sensor_id, "node-1");
        assert_eq!(readings[0].property, "pm2_5");
        assert_eq!(readings[0].extras.get("f_port").map(String::as_str), Some("1"));
        assert_eq!(readings[2].value, FieldValue::Float(3.6));
    }

    #[tokio::test]
    async fn test_bad_line_fails_the_stream() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("uplink_message", MockReply::Text("{not json\n".into()));
        let from = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let to = parse_timestamp("2024-01-02T00:00:00Z").unwrap();
        let result: HarvestResult<Vec<RawReading>> =
            adapter(&mock, &[]).fetch_window("ufo-app", from, to).await.unwrap().try_collect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_station_selection_filters_devices() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("uplink_message", MockReply::Text(UPLINKS.into()));
        let from = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let to = parse_timestamp("2024-01-02T00:00:00Z").unwrap();
        let readings: Vec<RawReading> =
            adapter(&mock, &["node-2"]).fetch_window("ufo-app", from, to).await.unwrap().try_collect().await.unwrap();
        assert_eq!(readings.len(), 1);
    }
}
