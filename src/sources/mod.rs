//! Source adapters.
//!
//! Every vendor API is wrapped by an [`Adapter`] that lists its streams and
//! assets and yields [`RawReading`]s for a time window. The driver owns
//! everything after that: normalization, bookmarks, output.

mod aeroqual;
mod ckan;
mod defra_atom;
mod defra_flood;
mod defra_sos;
mod ea_atom;
mod fingertips;
mod nomis;
mod oizom;
mod stat_xplore;
mod ttn;
mod ufdex;
mod zephyr;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::config::Config;
use crate::error::{HarvestError, HarvestResult};
use crate::http::{join_url, AuthScheme, HttpClient};
use crate::models::{parse_timestamp, OutputColumns, RawReading, Sensor, Site, Timestamp};
use crate::parsers::json::flatten;
use crate::transform::{FeatureFilter, RenameMap, TransformSpec, UnitTable};

pub use aeroqual::AeroqualAdapter;
pub use ckan::CkanAdapter;
pub use defra_atom::DefraAtomAdapter;
pub use defra_flood::{mean_of_multi_value, DefraFloodAdapter};
pub use defra_sos::{parse_observations, spatial_filter, DefraSosAdapter};
pub use ea_atom::EaAtomAdapter;
pub use fingertips::FingertipsAdapter;
pub use nomis::NomisAdapter;
pub use oizom::{OizomAdapter, CALIBRATION_PATH};
pub use stat_xplore::StatXploreAdapter;
pub use ttn::TtnAdapter;
pub use ufdex::UfdexAdapter;
pub use zephyr::ZephyrAdapter;

// ---

/// Lazy sequence of vendor readings for one window.
pub type RawStream = BoxStream<'static, HarvestResult<RawReading>>;

/// Capability set shared by every vendor adapter.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fixed CSV column tuple of the source.
    fn output_columns(&self) -> OutputColumns;

    /// Vendor → canonical property names.
    fn rename(&self) -> RenameMap {
        RenameMap::new()
    }

    /// Unit/property vocabulary mapping, for sources reporting URIs.
    fn units(&self) -> Option<UnitTable> {
        None
    }

    /// Preferred window width when the source publishes in larger periods.
    fn window(&self) -> Option<Duration> {
        None
    }

    /// Independent stream keys (sampling points, devices, datasets).
    async fn streams(&self) -> HarvestResult<Vec<String>>;

    async fn list_sites(&self) -> HarvestResult<Vec<Site>> {
        Ok(Vec::new())
    }

    async fn list_sensors(&self) -> HarvestResult<Vec<Sensor>> {
        Ok(Vec::new())
    }

    /// Readings of `stream` observed in `[from, to)`.
    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream>;
}

/// Transform settings of `adapter` with the `[csv]`, `[fields]` and feature
/// selection of the configuration applied.
pub fn transform_spec(adapter: &dyn Adapter, cfg: &Config) -> TransformSpec {
    // ---
    let mut columns = adapter.output_columns();
    if let Some(id) = &cfg.csv.id_column {
        columns.id_column = id.clone();
    }
    if let Some(metrics) = &cfg.csv.columns {
        columns.metrics = metrics.clone();
    }
    let mut spec = TransformSpec::new(columns).with_rename(adapter.rename());
    spec.units = adapter.units();
    spec.features = FeatureFilter::new(cfg.harvester.features.iter().cloned());
    spec.fields = cfg.fields.clone();
    spec
}

/// Every supported source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    DefraSos,
    DefraFlood,
    DefraAtom,
    EaAtom,
    Aeroqual,
    Oizom,
    Zephyr,
    Ttn,
    Fingertips,
    Nomis,
    StatXplore,
    Ckan,
    Ufdex,
}

impl SourceKind {
    pub const ALL: [SourceKind; 13] = [
        SourceKind::DefraSos,
        SourceKind::DefraFlood,
        SourceKind::DefraAtom,
        SourceKind::EaAtom,
        SourceKind::Aeroqual,
        SourceKind::Oizom,
        SourceKind::Zephyr,
        SourceKind::Ttn,
        SourceKind::Fingertips,
        SourceKind::Nomis,
        SourceKind::StatXplore,
        SourceKind::Ckan,
        SourceKind::Ufdex,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::DefraSos => "defra-sos",
            SourceKind::DefraFlood => "defra-flood",
            SourceKind::DefraAtom => "defra-atom",
            SourceKind::EaAtom => "ea-atom",
            SourceKind::Aeroqual => "aeroqual",
            SourceKind::Oizom => "oizom",
            SourceKind::Zephyr => "zephyr",
            SourceKind::Ttn => "ttn",
            SourceKind::Fingertips => "fingertips",
            SourceKind::Nomis => "nomis",
            SourceKind::StatXplore => "stat-xplore",
            SourceKind::Ckan => "ckan",
            SourceKind::Ufdex => "ufdex",
        }
    }

    /// Authentication the vendor expects; `[source] auth` overrides it.
    pub fn auth_scheme(&self) -> AuthScheme {
        match self {
            SourceKind::Aeroqual => AuthScheme::Login,
            SourceKind::Oizom => AuthScheme::Bearer,
            SourceKind::Zephyr => AuthScheme::Basic,
            SourceKind::Ttn => AuthScheme::Bearer,
            SourceKind::StatXplore => AuthScheme::ApiKey,
            SourceKind::Ufdex => AuthScheme::ClientCredentials,
            _ => AuthScheme::None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            SourceKind::DefraSos => "https://uk-air.defra.gov.uk/sos-ukair/service",
            SourceKind::DefraFlood => "https://environment.data.gov.uk/flood-monitoring",
            SourceKind::DefraAtom => "https://uk-air.defra.gov.uk/data/atom-dls",
            SourceKind::EaAtom => "https://environment.data.gov.uk",
            SourceKind::Aeroqual => "https://cloud.aeroqual.com",
            SourceKind::Oizom => "https://app.oizom.com/api",
            SourceKind::Zephyr => "https://data.earthsense.co.uk",
            SourceKind::Ttn => "https://eu1.cloud.thethings.network",
            SourceKind::Fingertips => "https://fingertips.phe.org.uk",
            SourceKind::Nomis => "https://www.nomisweb.co.uk",
            SourceKind::StatXplore => "https://stat-xplore.dwp.gov.uk/webapi/rest/v1",
            SourceKind::Ckan => "https://data.gov.uk",
            SourceKind::Ufdex => "https://ufdev21.shef.ac.uk/api",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SourceKind {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        SourceKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| HarvestError::Config(format!("unknown source '{}'", s)))
    }
}

/// What every adapter needs: the session, the configuration and its base URL.
#[derive(Clone)]
pub struct SourceContext {
    pub client: Arc<dyn HttpClient>,
    pub cfg: Arc<Config>,
    pub base_url: String,
}

impl SourceContext {
    pub fn new(kind: SourceKind, cfg: Arc<Config>, client: Arc<dyn HttpClient>) -> Self {
        // ---
        let base_url = cfg
            .api
            .base_url
            .clone()
            .unwrap_or_else(|| kind.default_base_url().to_string());
        SourceContext { client, cfg, base_url }
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Required `[source]` option.
    pub fn require_option(&self, key: &str) -> HarvestResult<&str> {
        self.cfg
            .option(key)
            .ok_or_else(|| HarvestError::Config(format!("[source] {} must be set", key)))
    }

    /// Comma-separated `[source]` option, empty when unset.
    pub fn list_option(&self, key: &str) -> Vec<String> {
        self.cfg
            .option(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Configured stations, or an error naming the source.
    pub fn require_stations(&self, source: &str) -> HarvestResult<Vec<String>> {
        // ---
        if self.cfg.harvester.stations.is_empty() {
            return Err(HarvestError::Config(format!(
                "{} needs [harvester] stations",
                source
            )));
        }
        Ok(self.cfg.harvester.stations.clone())
    }
}

/// Build the adapter for `kind`.
pub fn build(kind: SourceKind, ctx: SourceContext) -> Box<dyn Adapter> {
    match kind {
        SourceKind::DefraSos => Box::new(DefraSosAdapter::new(ctx)),
        SourceKind::DefraFlood => Box::new(DefraFloodAdapter::new(ctx)),
        SourceKind::DefraAtom => Box::new(DefraAtomAdapter::new(ctx)),
        SourceKind::EaAtom => Box::new(EaAtomAdapter::new(ctx)),
        SourceKind::Aeroqual => Box::new(AeroqualAdapter::new(ctx)),
        SourceKind::Oizom => Box::new(OizomAdapter::new(ctx)),
        SourceKind::Zephyr => Box::new(ZephyrAdapter::new(ctx)),
        SourceKind::Ttn => Box::new(TtnAdapter::new(ctx)),
        SourceKind::Fingertips => Box::new(FingertipsAdapter::new(ctx)),
        SourceKind::Nomis => Box::new(NomisAdapter::new(ctx)),
        SourceKind::StatXplore => Box::new(StatXploreAdapter::new(ctx)),
        SourceKind::Ckan => Box::new(CkanAdapter::new(ctx)),
        SourceKind::Ufdex => Box::new(UfdexAdapter::new(ctx)),
    }
}

/// Readings already in memory, as a stream.
pub(crate) fn ready(readings: Vec<RawReading>) -> RawStream {
    stream::iter(readings.into_iter().map(Ok)).boxed()
}

/// Keep readings observed in `[from, to)`. Sources that publish whole days or
/// years fetch more than the window asks for. Unparseable timestamps are kept
/// for coercion to report.
pub(crate) fn in_window(mut readings: Vec<RawReading>, from: Timestamp, to: Timestamp) -> Vec<RawReading> {
    readings.retain(|r| parse_timestamp(&r.timestamp).map_or(true, |ts| ts >= from && ts < to));
    readings
}

/// One reading per scalar field of a wide vendor record, keys lower-cased and
/// nested objects flattened with dots. Keys in `skip` are left out.
pub(crate) fn record_readings(sensor: &str, timestamp: &str, record: &Value, skip: &[&str]) -> Vec<RawReading> {
    // ---
    flatten(record)
        .into_iter()
        .filter(|(k, v)| !skip.iter().any(|s| s.eq_ignore_ascii_case(k)) && !v.is_blank())
        .map(|(k, v)| RawReading::new(sensor, timestamp, k, v))
        .collect()
}

/// Calendar days touched by `[from, to)`.
pub(crate) fn days(from: Timestamp, to: Timestamp) -> Vec<NaiveDate> {
    // ---
    let mut out = Vec::new();
    let mut day = from.date_naive();
    let last = (to - Duration::seconds(1)).date_naive();
    while day <= last {
        out.push(day);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    out
}

/// Calendar years touched by `[from, to)`.
pub(crate) fn years(from: Timestamp, to: Timestamp) -> Vec<i32> {
    let last = (to - Duration::seconds(1)).year();
    (from.year()..=last.max(from.year())).collect()
}

/// `YYYY-01-01T00:00:00Z` from a period label starting with a year
/// (`2019`, `2019/20`, `2019 Q1`).
pub(crate) fn year_start(label: &str) -> Option<String> {
    // ---
    let digits: String = label.trim().chars().take(4).collect();
    if digits.len() == 4 && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("{}-01-01T00:00:00Z", digits))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::parse_timestamp;

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn test_source_names_round_trip() {
        // ---
        for kind in SourceKind::ALL {
            assert_eq!(kind.name().parse::<SourceKind>().unwrap(), kind);
        }
        assert_eq!("stat_xplore".parse::<SourceKind>().unwrap(), SourceKind::StatXplore);
        assert!("nope".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_days_and_years_of_window() {
        // ---
        let d = days(ts("2024-01-01T10:00:00Z"), ts("2024-01-03T00:00:00Z"));
        assert_eq!(d.len(), 2);
        assert_eq!(years(ts("2019-06-01T00:00:00Z"), ts("2021-01-01T00:00:00Z")), vec![2019, 2020]);
        assert_eq!(year_start("2019/20").as_deref(), Some("2019-01-01T00:00:00Z"));
        assert_eq!(year_start("Q1"), None);
    }

    #[test]
    fn test_in_window_is_half_open() {
        // ---
        let at = |t: &str| RawReading::new("S1", t, "no2", crate::models::FieldValue::Float(1.0));
        let kept = in_window(
            vec![at("2024-01-01T11:59:59Z"), at("2024-01-01T12:00:00Z"), at("2024-01-01T13:00:00Z"), at("later")],
            ts("2024-01-01T12:00:00Z"),
            ts("2024-01-01T13:00:00Z"),
        );
        let stamps: Vec<&str> = kept.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(stamps, vec!["2024-01-01T12:00:00Z", "later"]);
    }

    #[test]
    fn test_record_readings_skip_time_and_blanks() {
        // ---
        let record = serde_json::json!({"Time": "t", "NO2": 12, "d": {"p1": 1.5}, "note": null});
        let readings = record_readings("S1", "t", &record, &["time"]);
        let props: Vec<&str> = readings.iter().map(|r| r.property.as_str()).collect();
        assert_eq!(props, vec!["d.p1", "no2"]);
    }

    #[test]
    fn test_csv_overrides_columns() {
        // ---
        let mut cfg = Config::defaults("nomis");
        cfg.csv.id_column = Some("area".into());
        cfg.csv.columns = Some(vec!["POP".into()]);
        cfg.harvester.features = vec!["SP1".into()];
        let client: Arc<dyn HttpClient> = Arc::new(crate::http::mock::MockHttpClient::new());
        let adapter = build(
            SourceKind::Nomis,
            SourceContext::new(SourceKind::Nomis, Arc::new(cfg.clone()), client),
        );
        let spec = transform_spec(adapter.as_ref(), &cfg);
        assert_eq!(spec.columns.header(), vec!["timestamp", "area", "POP"]);
        assert!(!spec.features.is_empty());
    }
}
