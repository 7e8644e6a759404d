//! Public Health England Fingertips indicators.
//!
//! Each configured indicator is one stream. The CSV export holds one row per
//! area and period; periods are labelled by year (`2019`, `2019/20`).

use async_trait::async_trait;
use chrono::Duration;
use tracing::info;

use super::{ready, year_start, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::models::{parse_timestamp, FieldValue, OutputColumns, RawReading, Timestamp};
use crate::parsers::parse_records;

// ---

const DEFAULT_AREA_TYPE: &str = "402";
const DEFAULT_SEX: &str = "Persons";

pub struct FingertipsAdapter {
    ctx: SourceContext,
}

impl FingertipsAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        FingertipsAdapter { ctx }
    }
}

/// Canonical property of an indicator.
pub fn indicator_property(indicator: &str) -> String {
    format!("PHE_{}", indicator)
}

#[async_trait]
impl Adapter for FingertipsAdapter {
    fn name(&self) -> &'static str {
        "fingertips"
    }

    fn output_columns(&self) -> OutputColumns {
        let metrics: Vec<String> = self
            .ctx
            .list_option("indicator_ids")
            .iter()
            .map(|id| indicator_property(id))
            .collect();
        let metrics: Vec<&str> = metrics.iter().map(String::as_str).collect();
        OutputColumns::new("area", &metrics)
    }

    fn window(&self) -> Option<Duration> {
        Some(Duration::days(366))
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        // ---
        let ids = self.ctx.list_option("indicator_ids");
        if ids.is_empty() {
            return Err(HarvestError::Config("[source] indicator_ids must be set for fingertips".into()));
        }
        Ok(ids)
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let area_type = self.ctx.cfg.option("area_type_id").unwrap_or(DEFAULT_AREA_TYPE);
        let sex = self.ctx.cfg.option("sex").unwrap_or(DEFAULT_SEX);
        let text = self
            .ctx
            .client
            .get_text(
                &self.ctx.url("api/all_data/csv/by_indicator_id"),
                &[("indicator_ids", stream), ("child_area_type_id", area_type)],
            )
            .await?;
        let property = indicator_property(stream);

        let mut out = Vec::new();
        for record in parse_records(&text, b',')? {
            let get = |k: &str| record.get(k).map(String::as_str).unwrap_or("");
            if !get("sex").is_empty() && !get("sex").eq_ignore_ascii_case(sex) {
                continue;
            }
            let Some(start) = year_start(get("time period")) else {
                continue;
            };
            if !parse_timestamp(&start).is_some_and(|ts| ts >= from && ts < to) {
                continue;
            }
            out.push(
                RawReading::new(get("area code"), start, property.as_str(), FieldValue::Text(get("value").to_string()))
                    .with_extra("period", get("time period")),
            );
        }
        info!("{} rows for indicator {}", out.len(), stream);
        Ok(ready(out))
    }
}
