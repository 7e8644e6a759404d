//! DEFRA INSPIRE download service (Atom).
//!
//! A yearly index feed lists one entry per station with its location and a
//! link to the station's own feed. The station feed links the AQD observation
//! documents, which share the SOS observation format. Entries are filtered by
//! distance from the configured centre before any bulk data is downloaded.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Datelike, Duration, Utc};
use tracing::{debug, info};

use super::defra_sos::parse_observations;
use super::{in_window, ready, years, Adapter, RawStream, SourceContext};
use crate::error::HarvestResult;
use crate::geo::within_radius;
use crate::models::{OutputColumns, RawReading, Site, Timestamp};
use crate::parsers::xml::{parse_document, parse_iso6709, parse_pos, Element};
use crate::transform::UnitTable;

// ---

const DEFAULT_INDEX_PATH: &str = "observation/{year}/atom.en.xml";

/// One station entry of the yearly index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub code: String,
    pub title: String,
    pub position: (f64, f64),
    pub feed_url: String,
}

pub struct DefraAtomAdapter {
    ctx: SourceContext,
}

impl DefraAtomAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        DefraAtomAdapter { ctx }
    }

    fn index_url(&self, year: i32) -> String {
        let path = self.ctx.cfg.option("index_path").unwrap_or(DEFAULT_INDEX_PATH);
        self.ctx.url(&path.replace("{year}", &year.to_string()))
    }

    /// Index entries of `year` within the configured radius.
    pub async fn nearby_entries(&self, year: i32) -> HarvestResult<Vec<IndexEntry>> {
        // ---
        let text = self.ctx.client.get_text(&self.index_url(year), &[]).await?;
        let root = parse_document(&text)?;
        let h = &self.ctx.cfg.harvester;
        let entries: Vec<IndexEntry> = root
            .findall("atom:entry")
            .into_iter()
            .filter_map(index_entry)
            .filter(|e| within_radius(h.centre, e.position, h.radius_km))
            .collect();
        info!("{} stations within {} km in the {} index", entries.len(), h.radius_km, year);
        Ok(entries)
    }

    async fn station_readings(&self, entry: &IndexEntry) -> HarvestResult<Vec<RawReading>> {
        // ---
        let text = self.ctx.client.get_text(&entry.feed_url, &[]).await?;
        let root = parse_document(&text)?;
        let mut out = Vec::new();
        for link in data_links(&root) {
            debug!("Downloading {} for {}", link, entry.code);
            let doc = self.ctx.client.get_text(&link, &[]).await?;
            out.extend(parse_observations(&doc)?);
        }
        Ok(out)
    }
}

fn index_entry(entry: &Element) -> Option<IndexEntry> {
    // ---
    let position = entry
        .find_text("georss:point")
        .and_then(parse_pos)
        .or_else(|| entry.find_text(".//gml:pos").and_then(parse_pos))
        .or_else(|| entry.find_text("atom:summary").and_then(parse_iso6709))?;
    let title = entry.find_text("atom:title").unwrap_or("").to_string();
    let code = entry
        .find_text("inspire_dls:spatial_dataset_identifier_code")
        .map(String::from)
        .or_else(|| title.split_whitespace().next().map(String::from))?;
    let feed_url = entry
        .findall("atom:link")
        .into_iter()
        .find(|l| l.attr("rel").unwrap_or("alternate") == "alternate")
        .and_then(|l| l.attr("href"))?
        .to_string();
    Some(IndexEntry {
        code,
        title,
        position,
        feed_url,
    })
}

/// XML download links of a station feed.
fn data_links(root: &Element) -> Vec<String> {
    root.findall("atom:entry/atom:link")
        .into_iter()
        .filter(|l| {
            l.attr("type").is_some_and(|t| t.contains("xml")) || l.attr("href").is_some_and(|h| h.ends_with(".xml"))
        })
        .filter_map(|l| l.attr("href").map(String::from))
        .collect()
}

#[async_trait]
impl Adapter for DefraAtomAdapter {
    fn name(&self) -> &'static str {
        "defra-atom"
    }

    fn output_columns(&self) -> OutputColumns {
        OutputColumns::new(
            "sensor",
            &["AQ_NO2", "AQ_NO", "AQ_NOX", "AQ_O3", "AQ_SO2", "AQ_PM10", "AQ_PM25", "AQ_CO", "AQ_C6H6"],
        )
    }

    fn units(&self) -> Option<UnitTable> {
        Some(UnitTable::defra_aqd())
    }

    fn window(&self) -> Option<Duration> {
        Some(Duration::days(366))
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        Ok(vec![self.name().to_string()])
    }

    async fn list_sites(&self) -> HarvestResult<Vec<Site>> {
        // ---
        let year = Utc::now().year();
        let sites = self
            .nearby_entries(year)
            .await?
            .into_iter()
            .map(|e| Site {
                id: e.code,
                latitude: e.position.0,
                longitude: e.position.1,
                address: Some(e.title),
                country: Some("United Kingdom".into()),
                operator: BTreeMap::from([("name".to_string(), "DEFRA".to_string())]),
                desc_url: Some(e.feed_url),
                ..Site::default()
            })
            .collect();
        Ok(sites)
    }

    async fn fetch_window(&self, _stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let mut out = Vec::new();
        for year in years(from, to) {
            for entry in self.nearby_entries(year).await? {
                out.extend(self.station_readings(&entry).await?);
            }
        }
        let out = in_window(out, from, to);
        info!("{} readings from the INSPIRE feeds", out.len());
        Ok(ready(out))
    }
}
