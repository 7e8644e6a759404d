//! NOMIS official labour-market statistics.
//!
//! One stream per configured dataset; each window year is requested with
//! `date=<year>` from the dataset's CSV endpoint.

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info};

use super::{in_window, ready, year_start, years, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::models::{FieldValue, OutputColumns, RawReading, Timestamp};
use crate::parsers::parse_records;

// ---

const DEFAULT_GEOGRAPHY: &str = "TYPE464";

pub struct NomisAdapter {
    ctx: SourceContext,
}

impl NomisAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        NomisAdapter { ctx }
    }
}

/// Canonical property of a dataset (`NM_31_1` → `NOMIS_NM_31_1`).
pub fn dataset_property(dataset: &str) -> String {
    format!("NOMIS_{}", dataset.to_uppercase())
}

#[async_trait]
impl Adapter for NomisAdapter {
    fn name(&self) -> &'static str {
        "nomis"
    }

    fn output_columns(&self) -> OutputColumns {
        let metrics: Vec<String> = self.ctx.list_option("datasets").iter().map(|d| dataset_property(d)).collect();
        let metrics: Vec<&str> = metrics.iter().map(String::as_str).collect();
        OutputColumns::new("area", &metrics)
    }

    fn window(&self) -> Option<Duration> {
        Some(Duration::days(366))
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        // ---
        let datasets = self.ctx.list_option("datasets");
        if datasets.is_empty() {
            return Err(HarvestError::Config("[source] datasets must be set for nomis".into()));
        }
        Ok(datasets)
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let url = self.ctx.url(&format!("api/v01/dataset/{}.data.csv", stream));
        let geography = self.ctx.cfg.option("geography").unwrap_or(DEFAULT_GEOGRAPHY);
        let property = dataset_property(stream);
        let mut out = Vec::new();
        for year in years(from, to) {
            let year = year.to_string();
            let mut params = vec![
                ("date", year.as_str()),
                ("geography", geography),
                ("select", "date,geography_code,obs_value"),
            ];
            if let Some(measures) = self.ctx.cfg.option("measures") {
                params.push(("measures", measures));
            }
            let text = self.ctx.client.get_text(&url, &params).await?;
            let records = parse_records(&text, b',')?;
            debug!("{} rows for {} in {}", records.len(), stream, year);
            for record in records {
                let get = |k: &str| record.get(k).map(String::as_str).unwrap_or("");
                let Some(start) = year_start(get("date")) else {
                    continue;
                };
                out.push(RawReading::new(
                    get("geography_code"),
                    start,
                    property.as_str(),
                    FieldValue::Text(get("obs_value").to_string()),
                ));
            }
        }
        let out = in_window(out, from, to);
        info!("{} rows from dataset {}", out.len(), stream);
        Ok(ready(out))
    }
}
