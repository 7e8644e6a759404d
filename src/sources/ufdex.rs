//! Urban Flows data-extraction endpoint (UF-DEX).
//!
//! Responses use the UF-DEX CSV dialect and can be large, so they are read
//! line by line and each table is turned into readings as soon as its end
//! marker arrives.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use super::{Adapter, RawStream, SourceContext};
use crate::error::HarvestResult;
use crate::http::LineStream;
use crate::models::{OutputColumns, RawReading, Timestamp};
use crate::parsers::UfdexParser;

// ---

const DATA_PATH: &str = "getdata";

pub struct UfdexAdapter {
    ctx: SourceContext,
}

impl UfdexAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        UfdexAdapter { ctx }
    }
}

struct TableState {
    lines: LineStream,
    parser: UfdexParser,
}

/// Readings of the next complete table, `None` once the input is exhausted.
async fn next_table(mut st: TableState) -> HarvestResult<Option<(Vec<RawReading>, TableState)>> {
    // ---
    while let Some(line) = st.lines.next().await {
        if let Some(table) = st.parser.push_line(&line?)? {
            let readings = table.readings()?;
            debug!("UF-DEX table with {} rows", table.rows.len());
            return Ok(Some((readings, st)));
        }
    }
    std::mem::take(&mut st.parser).finish()?;
    Ok(None)
}

/// Lazily decode UF-DEX lines into readings.
pub fn ufdex_readings(lines: LineStream) -> RawStream {
    let state = TableState {
        lines,
        parser: UfdexParser::new(),
    };
    stream::try_unfold(state, next_table)
        .map_ok(|batch| stream::iter(batch.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
}

#[async_trait]
impl Adapter for UfdexAdapter {
    fn name(&self) -> &'static str {
        "ufdex"
    }

    fn output_columns(&self) -> OutputColumns {
        let metrics = self.ctx.list_option("columns");
        let metrics: Vec<&str> = metrics.iter().map(String::as_str).collect();
        OutputColumns::new("sensor", &metrics)
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        self.ctx.require_stations("ufdex")
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let (from, to) = (from.timestamp().to_string(), to.timestamp().to_string());
        let lines = self
            .ctx
            .client
            .stream_lines(
                &self.ctx.url(DATA_PATH),
                &[
                    ("sensorID", stream),
                    ("timeFrom", from.as_str()),
                    ("timeTo", to.as_str()),
                    ("dataType", "csv"),
                ],
            )
            .await?;
        Ok(ufdex_readings(lines))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::Config;
    use crate::error::HarvestError;
    use crate::http::mock::{MockHttpClient, MockReply};
    use crate::http::HttpClient;
    use crate::models::{parse_timestamp, FieldValue};
    use crate::sources::SourceKind;
    use std::sync::Arc;

    const TABLES: &str = "# Begin CSV table\n\
# site.id S0001\n\
# sensor.id AQ_MESH_1\n\
# number of points: 2\n\
# Column_1 / Timestamp / s / time.epoch / Time of reading / int / -32768\n\
# Column_2 / NO2 / ug/m3 / phys.conc / Nitrogen dioxide / float / -32768\n\
1704067200,12.5\n\
1704068100,-32768\n\
# End CSV table\n";

    fn adapter(mock: &MockHttpClient) -> UfdexAdapter {
        let mut cfg = Config::defaults("ufdex");
        cfg.harvester.stations = vec!["AQ_MESH_1".into()];
        let client: Arc<dyn HttpClient> = Arc::new(mock.clone());
        UfdexAdapter::new(SourceContext::new(SourceKind::Ufdex, Arc::new(cfg), client))
    }

    #[tokio::test]
    async fn test_tables_stream_into_readings() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("getdata?sensorID=AQ_MESH_1&timeFrom=1704067200", MockReply::Text(TABLES.into()));
        let from = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let to = parse_timestamp("2024-01-02T00:00:00Z").unwrap();
        let readings: Vec<RawReading> = adapter(&mock)
            .fetch_window("AQ_MESH_1", from, to)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].site_id, "S0001");
        assert_eq!(readings[0].property, "no2");
        assert_eq!(readings[1].value, FieldValue::Null);
    }

    #[tokio::test]
    async fn test_point_count_mismatch_fails() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("getdata", MockReply::Text(TABLES.replace("points: 2", "points: 3")));
        let from = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let to = parse_timestamp("2024-01-02T00:00:00Z").unwrap();
        let out: HarvestResult<Vec<RawReading>> =
            adapter(&mock).fetch_window("AQ_MESH_1", from, to).await.unwrap().try_collect().await;
        assert!(matches!(out, Err(HarvestError::Parse(_))));
    }

    #[tokio::test]
    async fn test_truncated_table_fails() {
        // ---
        let lines: LineStream = stream::iter(vec![Ok("# Begin CSV table".to_string())]).boxed();
        let out: HarvestResult<Vec<RawReading>> = ufdex_readings(lines).try_collect().await;
        assert!(out.is_err());
    }
}
