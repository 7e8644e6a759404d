//! UK Government CKAN DataStore.
//!
//! Each configured resource is a stream. Records are paged through
//! `datastore_search` by following `_links.next` and kept when their
//! timestamp field falls in the window.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;

use super::{record_readings, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::http::{paginate, PageRule};
use crate::models::{parse_timestamp, OutputColumns, RawReading, Timestamp};
use crate::parsers::json::str_field;

// ---

const SEARCH_PATH: &str = "api/3/action/datastore_search";
const PAGE_SIZE: &str = "1000";
const DEFAULT_TIMESTAMP_FIELD: &str = "timestamp";
const DEFAULT_ID_FIELD: &str = "site_id";

pub struct CkanAdapter {
    ctx: SourceContext,
}

impl CkanAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        CkanAdapter { ctx }
    }

    fn timestamp_field(&self) -> String {
        self.ctx
            .cfg
            .option("timestamp_field")
            .unwrap_or(DEFAULT_TIMESTAMP_FIELD)
            .to_string()
    }

    fn id_field(&self) -> String {
        self.ctx.cfg.option("id_field").unwrap_or(DEFAULT_ID_FIELD).to_string()
    }
}

/// Readings of one datastore record, or none when it lies outside `[from, to)`.
fn record_in_window(
    record: &Value,
    resource: &str,
    ts_field: &str,
    id_field: &str,
    from: Timestamp,
    to: Timestamp,
) -> Vec<RawReading> {
    // ---
    let Some(time) = str_field(record, ts_field) else {
        return Vec::new();
    };
    if !parse_timestamp(&time).is_some_and(|ts| ts >= from && ts < to) {
        return Vec::new();
    }
    let id = str_field(record, id_field).unwrap_or_else(|| resource.to_string());
    record_readings(&id, &time, record, &["_id", ts_field, id_field])
}

#[async_trait]
impl Adapter for CkanAdapter {
    fn name(&self) -> &'static str {
        "ckan"
    }

    fn output_columns(&self) -> OutputColumns {
        let metrics = self.ctx.list_option("columns");
        let metrics: Vec<&str> = metrics.iter().map(String::as_str).collect();
        OutputColumns::new("sensor", &metrics)
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        // ---
        let resources = self.ctx.list_option("resource_ids");
        if resources.is_empty() {
            return Err(HarvestError::Config("[source] resource_ids must be set for ckan".into()));
        }
        Ok(resources)
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let (ts_field, id_field) = (self.timestamp_field(), self.id_field());
        let params = vec![
            ("resource_id".to_string(), stream.to_string()),
            ("limit".to_string(), PAGE_SIZE.to_string()),
            ("sort".to_string(), ts_field.clone()),
        ];
        let resource = stream.to_string();
        let records = paginate(
            self.ctx.client.clone(),
            &self.ctx.url(SEARCH_PATH),
            params,
            PageRule::next_link("/result/records", "/result/_links/next"),
        );
        let readings = records
            .map_ok(move |record| {
                let batch = record_in_window(&record, &resource, &ts_field, &id_field, from, to);
                stream::iter(batch.into_iter().map(Ok))
            })
            .try_flatten()
            .boxed();
        Ok(readings)
    }
}
