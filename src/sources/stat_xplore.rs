//! DWP Stat-Xplore open data API.
//!
//! A table query names a database, one measure and two dimensions (date and
//! area). The answer is a cube whose axes are described by `fields` and whose
//! cells live in `cubes[measure].values[date][area]`.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ready, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::models::{FieldValue, OutputColumns, RawReading, Timestamp};
use crate::parsers::json::array_at;

// ---

pub struct StatXploreAdapter {
    ctx: SourceContext,
}

impl StatXploreAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        StatXploreAdapter { ctx }
    }

    fn property(&self) -> String {
        // ---
        if let Some(p) = self.ctx.cfg.option("property") {
            return p.to_string();
        }
        let measure = self.ctx.cfg.option("measure").unwrap_or("");
        let local = measure.rsplit(':').next().unwrap_or(measure);
        format!("DWP_{}", local.to_uppercase())
    }

    fn query(&self) -> HarvestResult<(Value, String)> {
        // ---
        let database = self.ctx.require_option("database")?;
        let measure = self.ctx.require_option("measure")?;
        let date_field = self.ctx.require_option("date_field")?;
        let area_field = self.ctx.require_option("area_field")?;
        let body = json!({
            "database": database,
            "measures": [measure],
            "dimensions": [[date_field], [area_field]],
        });
        Ok((body, measure.to_string()))
    }
}

/// First label of every item on one axis of the cube.
fn axis_labels(table: &Value, axis: usize) -> Vec<String> {
    // ---
    array_at(table, &format!("/fields/{}/items", axis))
        .iter()
        .map(|item| {
            array_at(item, "/labels")
                .first()
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        })
        .collect()
}

/// First day of a month label (`January 2020`, `202001`).
fn month_start(label: &str) -> Option<NaiveDate> {
    // ---
    let label = label.trim();
    NaiveDate::parse_from_str(&format!("1 {}", label), "%d %B %Y")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}01", label), "%Y%m%d"))
        .ok()
}

/// Long readings from a two-axis cube.
pub fn cube_readings(table: &Value, measure: &str, property: &str) -> HarvestResult<Vec<RawReading>> {
    // ---
    let dates = axis_labels(table, 0);
    let areas = axis_labels(table, 1);
    let values = table
        .get("cubes")
        .and_then(|c| c.get(measure))
        .map(|c| array_at(c, "/values"))
        .ok_or_else(|| HarvestError::Parse(format!("no cube for measure {}", measure)))?;
    if values.len() != dates.len() {
        return Err(HarvestError::Parse(format!(
            "cube has {} date rows for {} date labels",
            values.len(),
            dates.len()
        )));
    }

    let mut out = Vec::new();
    for (date, row) in dates.iter().zip(values) {
        let Some(day) = month_start(date) else {
            warn!("Skipping unparsable period '{}'", date);
            continue;
        };
        let ts = format!("{}T00:00:00Z", day.format("%Y-%m-%d"));
        let cells = row.as_array().map(Vec::as_slice).unwrap_or(&[]);
        for (area, cell) in areas.iter().zip(cells) {
            out.push(RawReading::new(area.as_str(), ts.as_str(), property, FieldValue::from_json(cell)));
        }
    }
    Ok(out)
}

#[async_trait]
impl Adapter for StatXploreAdapter {
    fn name(&self) -> &'static str {
        "stat-xplore"
    }

    fn output_columns(&self) -> OutputColumns {
        let property = self.property();
        OutputColumns::new("area", &[property.as_str()])
    }

    fn window(&self) -> Option<Duration> {
        Some(Duration::days(366))
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        Ok(vec![self.ctx.require_option("database")?.to_string()])
    }

    async fn fetch_window(&self, _stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let (body, measure) = self.query()?;
        let table = self.ctx.client.post_json(&self.ctx.url("table"), &body).await?;
        let from_day = from.date_naive();
        let to_day = to.date_naive();
        let readings: Vec<RawReading> = cube_readings(&table, &measure, &self.property())?
            .into_iter()
            .filter(|r| {
                r.timestamp
                    .get(..10)
                    .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                    .is_some_and(|d| d >= from_day && d < to_day)
            })
            .collect();
        info!("{} cells from Stat-Xplore", readings.len());
        Ok(ready(readings))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::Config;
    use crate::http::mock::{MockHttpClient, MockReply, Method};
    use crate::http::HttpClient;
    use crate::models::parse_timestamp;
    use crate::sources::SourceKind;
    use futures::TryStreamExt;
    use std::sync::Arc;

    const MEASURE: &str = "str:count:UC_Monthly:V_F_UC_CASELOAD_FULL";

    fn table() -> Value {
        json!({
            "fields": [
                {"items": [{"labels": ["December 2019"]}, {"labels": ["January 2020"]}]},
                {"items": [{"labels": ["E14000919"]}, {"labels": ["E14000920"]}]}
            ],
            "cubes": {MEASURE: {"values": [[100, 200], [110, null]]}}
        })
    }

    fn adapter(mock: &MockHttpClient) -> StatXploreAdapter {
        let mut cfg = Config::defaults("stat-xplore");
        for (k, v) in [
            ("database", "str:database:UC_Monthly"),
            ("measure", MEASURE),
            ("date_field", "str:field:UC_Monthly:F_UC_DATE:DATE_NAME"),
            ("area_field", "str:field:UC_Monthly:V_F_UC_CASELOAD_FULL:PARLC_CODE"),
        ] {
            cfg.source_options.insert(k.into(), v.into());
        }
        let client: Arc<dyn HttpClient> = Arc::new(mock.clone());
        StatXploreAdapter::new(SourceContext::new(SourceKind::StatXplore, Arc::new(cfg), client))
    }

    #[test]
    fn test_cube_is_unfolded_by_date_and_area() {
        // ---
        let readings = cube_readings(&table(), MEASURE, "DWP_X").unwrap();
        assert_eq!(readings.len(), 4);
        assert_eq!(readings[0].timestamp, "2019-12-01T00:00:00Z");
        assert_eq!(readings[3].sensor_id, "E14000920");
        assert_eq!(readings[3].value, FieldValue::Null);
        assert_eq!(month_start("202003"), NaiveDate::from_ymd_opt(2020, 3, 1));
    }

    #[tokio::test]
    async fn test_query_is_posted_and_window_applied() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_post("/table", MockReply::Json(table()));
        let sx = adapter(&mock);
        assert_eq!(sx.output_columns().header(), vec!["timestamp", "area", "DWP_V_F_UC_CASELOAD_FULL"]);
        let from = parse_timestamp("2020-01-01T00:00:00Z").unwrap();
        let to = parse_timestamp("2021-01-01T00:00:00Z").unwrap();
        let readings: Vec<RawReading> = sx.fetch_window("uc", from, to).await.unwrap().try_collect().await.unwrap();
        assert_eq!(readings.len(), 2);
        let posted = mock.requests_of(Method::Post);
        assert_eq!(posted[0].body.as_ref().unwrap()["measures"][0], MEASURE);
    }

    #[test]
    fn test_mismatched_cube_is_rejected() {
        // ---
        let mut t = table();
        t["cubes"][MEASURE]["values"] = json!([[1, 2]]);
        assert!(cube_readings(&t, MEASURE, "P").is_err());
    }
}
