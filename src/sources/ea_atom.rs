//! Environment Agency Atom feeds.
//!
//! The feed publishes one entry per data package with an `updated` time and
//! CSV enclosures. Packages updated inside the window are downloaded; each CSV
//! row carries a measure id, a `dateTime` and a value.

use async_trait::async_trait;
use tracing::{debug, info};

use super::defra_flood::{mean_of_multi_value, measure_parameter};
use super::{ready, Adapter, RawStream, SourceContext};
use crate::error::HarvestResult;
use crate::models::{parse_timestamp, FieldValue, OutputColumns, RawReading, Timestamp};
use crate::parsers::parse_records;
use crate::parsers::xml::{parse_document, Element};
use crate::transform::RenameMap;

// ---

const DEFAULT_FEED_PATH: &str = "hydrology/data/atom.xml";

/// A data package of the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub title: String,
    pub updated: Timestamp,
    pub csv_links: Vec<String>,
}

pub struct EaAtomAdapter {
    ctx: SourceContext,
}

impl EaAtomAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        EaAtomAdapter { ctx }
    }

    /// Packages updated in `[from, to)`.
    pub async fn packages(&self, from: Timestamp, to: Timestamp) -> HarvestResult<Vec<Package>> {
        // ---
        let path = self.ctx.cfg.option("feed_path").unwrap_or(DEFAULT_FEED_PATH);
        let text = self.ctx.client.get_text(&self.ctx.url(path), &[]).await?;
        let root = parse_document(&text)?;
        let packages: Vec<Package> = root
            .findall("atom:entry")
            .into_iter()
            .filter_map(package)
            .filter(|p| p.updated >= from && p.updated < to)
            .collect();
        info!("{} packages updated between {} and {}", packages.len(), from, to);
        Ok(packages)
    }

    async fn package_readings(&self, package: &Package) -> HarvestResult<Vec<RawReading>> {
        // ---
        let stations = &self.ctx.cfg.harvester.stations;
        let mut out = Vec::new();
        for link in &package.csv_links {
            debug!("Downloading {}", link);
            let text = self.ctx.client.get_text(link, &[]).await?;
            for record in parse_records(&text, b',')? {
                let get = |k: &str| record.get(k).map(String::as_str).unwrap_or("");
                let measure = get("measure");
                let station = match get("station") {
                    "" => measure_station(measure).unwrap_or(""),
                    s => s,
                };
                if !stations.is_empty() && !stations.iter().any(|s| s == station) {
                    continue;
                }
                let value = match mean_of_multi_value(get("value")) {
                    Some(v) if get("value").contains('|') => FieldValue::Float(v),
                    _ => FieldValue::Text(get("value").to_string()),
                };
                let mut reading = RawReading::new(
                    station,
                    get("datetime"),
                    measure_parameter(measure).unwrap_or(""),
                    value,
                )
                .with_extra("measure", measure);
                if !get("quality").is_empty() {
                    reading = reading.with_extra("quality", get("quality"));
                }
                out.push(reading);
            }
        }
        Ok(out)
    }
}

fn package(entry: &Element) -> Option<Package> {
    // ---
    let updated = entry.find_text("atom:updated").and_then(parse_timestamp)?;
    let csv_links: Vec<String> = entry
        .findall("atom:link")
        .into_iter()
        .filter(|l| {
            l.attr("type").is_some_and(|t| t.contains("csv")) || l.attr("href").is_some_and(|h| h.ends_with(".csv"))
        })
        .filter_map(|l| l.attr("href").map(String::from))
        .collect();
    if csv_links.is_empty() {
        return None;
    }
    Some(Package {
        title: entry.find_text("atom:title").unwrap_or("").to_string(),
        updated,
        csv_links,
    })
}

/// Station part of a measure id (`.../measures/L1931-level-...` → `L1931`).
fn measure_station(measure: &str) -> Option<&str> {
    let local = measure.trim_end_matches('/').rsplit('/').next()?;
    local.split('-').next().filter(|s| !s.is_empty())
}

#[async_trait]
impl Adapter for EaAtomAdapter {
    fn name(&self) -> &'static str {
        "ea-atom"
    }

    fn output_columns(&self) -> OutputColumns {
        OutputColumns::new("station", &["WATER_LEVEL", "WATER_FLOW", "RAINFALL", "WATER_TEMP"])
    }

    fn rename(&self) -> RenameMap {
        RenameMap::from_pairs(&[
            ("level", "WATER_LEVEL"),
            ("flow", "WATER_FLOW"),
            ("rainfall", "RAINFALL"),
            ("temperature", "WATER_TEMP"),
        ])
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        Ok(vec![self.name().to_string()])
    }

    async fn fetch_window(&self, _stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let mut out = Vec::new();
        for package in self.packages(from, to).await? {
            out.extend(self.package_readings(&package).await?);
        }
        Ok(ready(out))
    }
}
