//! Harvest driver.
//!
//! Runs one source end to end: assets first, then every stream window by
//! window from its bookmark up to the end of the requested range. Each window
//! is fetched (with retries), normalized, filtered against the bookmark,
//! pivoted, written durably and optionally uploaded to the portal. Only then
//! is the bookmark advanced.
//!
//! Streams run concurrently on a [`JoinSet`], bounded by
//! `[harvester] parallel_streams`. They share the bookmark store (one key per
//! stream) and the CSV emitter (behind a mutex). A stream failure is recorded
//! in its [`StreamOutcome`] and never stops its siblings.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::TryStreamExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::aqi::compute_from_csv;
use crate::assets::AssetWriter;
use crate::bookmark::BookmarkStore;
use crate::context::HarvesterContext;
use crate::emitter::CsvEmitter;
use crate::error::{HarvestError, HarvestResult};
use crate::geo::BoundingPolygon;
use crate::models::{format_timestamp, RawReading, Reading, Timestamp};
use crate::portal::{
    load_aqi_standards, load_reading_type_groups, sync_aqi_standards, sync_reading_type_groups, AqiReading,
    AqiStandard, Location, MetaSummary, PortalClient,
};
use crate::retry::retry_with_max_retries;
use crate::sources::{build, transform_spec, Adapter, SourceKind};
use crate::transform::{Pipeline, TransformSpec};

// ---

/// What the command line asked for.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub output: PathBuf,
    /// Directory for site and sensor descriptors.
    pub assets: Option<PathBuf>,
    /// Mirror assets and readings to the Awesome portal.
    pub sync: bool,
    /// Explicit `[from, to)` (from `--date` or `--year`). Without it streams
    /// run from their bookmark up to now.
    pub range: Option<(Timestamp, Timestamp)>,
}

impl RunOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        RunOptions {
            output: output.into(),
            assets: None,
            sync: false,
            range: None,
        }
    }
}

/// Result of harvesting one stream.
#[derive(Debug)]
pub struct StreamOutcome {
    pub stream: String,
    pub retrieved: usize,
    pub written: usize,
    pub dropped: usize,
    pub uploaded: usize,
    /// Bookmark after the run.
    pub bookmark: Option<Timestamp>,
    pub cancelled: bool,
    pub error: Option<HarvestError>,
}

impl StreamOutcome {
    fn new(stream: &str) -> Self {
        StreamOutcome {
            stream: stream.to_string(),
            retrieved: 0,
            written: 0,
            dropped: 0,
            uploaded: 0,
            bookmark: None,
            cancelled: false,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let bookmark = self
            .bookmark
            .map(|ts| format_timestamp(&ts))
            .unwrap_or_else(|| "unset".to_string());
        write!(
            f,
            "{}: retrieved {} rows, wrote {} rows, dropped {}, bookmark advanced to {}",
            self.stream, self.retrieved, self.written, self.dropped, bookmark
        )?;
        if self.uploaded > 0 {
            write!(f, ", uploaded {}", self.uploaded)?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        if let Some(e) = &self.error {
            write!(f, " (failed: {})", e)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetSummary {
    pub sites: usize,
    pub sensors: usize,
    /// Sites left out by the bounding polygon.
    pub outside: usize,
}

/// Aggregate of one source run.
#[derive(Debug)]
pub struct RunSummary {
    pub source: String,
    pub streams: Vec<StreamOutcome>,
    pub assets: Option<AssetSummary>,
    pub rows_written: usize,
    /// Failure outside any stream (asset listing, output file).
    pub error: Option<HarvestError>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.streams.iter().all(StreamOutcome::is_ok)
    }

    /// Process exit status: 0 when every stream succeeded, else 1.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

/// Harvest every stream of `kind`.
///
/// # Errors
/// Fails only when the source cannot enumerate its streams; per-stream
/// failures are reported in the summary.
pub async fn run_source(ctx: &HarvesterContext, kind: SourceKind, opts: &RunOptions) -> HarvestResult<RunSummary> {
    // ---
    let adapter: Arc<dyn Adapter> = Arc::from(build(kind, ctx.source_context(kind)));
    let mut summary = RunSummary {
        source: kind.name().to_string(),
        streams: Vec::new(),
        assets: None,
        rows_written: 0,
        error: None,
    };

    if let Some(dir) = &opts.assets {
        match harvest_assets(ctx, adapter.as_ref(), dir.clone(), opts.sync).await {
            Ok(assets) => summary.assets = Some(assets),
            Err(e) => {
                error!("Asset harvest for {} failed: {}", kind, e);
                summary.error = Some(e);
            }
        }
    }

    let streams = adapter.streams().await?;
    info!("{} streams to harvest for {}", streams.len(), kind);

    let spec = Arc::new(transform_spec(adapter.as_ref(), &ctx.cfg));
    let emitter = Arc::new(Mutex::new(CsvEmitter::new(&opts.output, &spec.columns)));
    let permits = Arc::new(Semaphore::new(ctx.cfg.harvester.parallel_streams.max(1)));

    let mut tasks = JoinSet::new();
    for stream in streams {
        let worker = StreamWorker {
            ctx: ctx.clone(),
            adapter: adapter.clone(),
            spec: spec.clone(),
            emitter: emitter.clone(),
            key: format!("{}:{}", kind.name(), stream),
            stream,
            range: opts.range,
            sync: opts.sync,
        };
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            worker.run().await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                if outcome.is_ok() {
                    info!("{}", outcome);
                } else {
                    error!("{}", outcome);
                }
                summary.streams.push(outcome);
            }
            Err(e) => {
                error!("Stream worker of {} did not finish: {}", kind, e);
                let mut outcome = StreamOutcome::new("?");
                outcome.error = Some(HarvestError::Io(std::io::Error::other(e.to_string())));
                summary.streams.push(outcome);
            }
        }
    }
    summary.streams.sort_by(|a, b| a.stream.cmp(&b.stream));

    match Arc::try_unwrap(emitter) {
        Ok(emitter) => match emitter.into_inner().finish() {
            Ok(rows) => summary.rows_written = rows,
            Err(e) => {
                error!("Closing {} failed: {}", opts.output.display(), e);
                summary.error.get_or_insert(e);
            }
        },
        Err(_) => warn!("Output {} still shared, not closed", opts.output.display()),
    }

    info!(
        "{} finished: {} of {} streams ok, {} rows in {}",
        kind,
        summary.streams.iter().filter(|s| s.is_ok()).count(),
        summary.streams.len(),
        summary.rows_written,
        opts.output.display()
    );
    Ok(summary)
}

/// Everything one stream task owns.
struct StreamWorker {
    ctx: HarvesterContext,
    adapter: Arc<dyn Adapter>,
    spec: Arc<TransformSpec>,
    emitter: Arc<Mutex<CsvEmitter>>,
    key: String,
    stream: String,
    range: Option<(Timestamp, Timestamp)>,
    sync: bool,
}

impl StreamWorker {
    async fn run(self) -> StreamOutcome {
        // ---
        let mut outcome = StreamOutcome::new(&self.stream);
        if let Err(e) = self.drive(&mut outcome).await {
            outcome.error = Some(e);
        }
        outcome.bookmark = self.ctx.bookmarks.get(&self.key);
        outcome
    }

    fn window(&self) -> Duration {
        self.adapter
            .window()
            .unwrap_or_else(|| Duration::hours(self.ctx.cfg.harvester.window_hours.max(1)))
    }

    async fn drive(&self, outcome: &mut StreamOutcome) -> HarvestResult<()> {
        // ---
        let bookmarks: &BookmarkStore = &self.ctx.bookmarks;
        let previous = bookmarks.get(&self.key);
        let (start, until) = match self.range {
            Some((from, to)) => (previous.map_or(from, |b| b.max(from)), to),
            None => (bookmarks.cursor(&self.key, self.ctx.cfg.harvester.time_start), Utc::now()),
        };
        let step = self.window();
        let mut portal = if self.sync {
            Some(PortalClient::from_config(&self.ctx.cfg, self.ctx.portal_client()?)?)
        } else {
            None
        };
        let mut pipeline = Pipeline::new(&self.spec);
        let max_retries = self.ctx.cfg.harvester.max_retries;
        info!("Harvesting {} from {} to {}", self.key, format_timestamp(&start), format_timestamp(&until));

        let mut from = start;
        while from < until {
            if self.ctx.is_cancelled() {
                outcome.cancelled = true;
                info!("{} cancelled before {}", self.key, format_timestamp(&from));
                break;
            }
            let to = (from + step).min(until);
            let adapter = self.adapter.as_ref();
            let stream = self.stream.as_str();
            let raws: Vec<RawReading> = retry_with_max_retries(max_retries, &self.key, move || async move {
                adapter.fetch_window(stream, from, to).await?.try_collect().await
            })
            .await?;

            let normalized = pipeline.run(raws)?;
            let bookmark = bookmarks.get(&self.key);
            let (readings, stale) = after_bookmark(normalized, bookmark);
            outcome.dropped += stale;

            let rows = pipeline.finish(&readings);
            if !rows.is_empty() {
                outcome.written += self.emitter.lock().await.write_rows(&rows)?;
            }
            debug!("{} window {} .. {}: {} rows", self.key, format_timestamp(&from), format_timestamp(&to), rows.len());

            let newest = rows.iter().map(|r| r.timestamp).max();
            match portal.as_mut() {
                Some(portal) => {
                    let (uploaded, ended) = upload_window(portal, bookmarks, &self.key, &readings, newest).await?;
                    outcome.uploaded += uploaded;
                    if ended {
                        info!("{} ended by the portal after {} uploads", self.key, outcome.uploaded);
                        break;
                    }
                }
                None => {
                    if let Some(ts) = newest {
                        bookmarks.commit(&self.key, ts)?;
                    }
                }
            }
            from = to;
        }

        outcome.retrieved = pipeline.stats.retrieved;
        outcome.dropped += pipeline.stats.dropped();
        Ok(())
    }
}

/// Readings strictly newer than `bookmark`, and how many were not.
fn after_bookmark(readings: Vec<Reading>, bookmark: Option<Timestamp>) -> (Vec<Reading>, usize) {
    // ---
    let Some(bookmark) = bookmark else {
        return (readings, 0);
    };
    let total = readings.len();
    let fresh: Vec<Reading> = readings.into_iter().filter(|r| r.timestamp > bookmark).collect();
    let stale = total - fresh.len();
    (fresh, stale)
}

/// Upload one window and advance the bookmark batch by batch.
///
/// Returns the number of readings acknowledged and whether the portal ended
/// the stream with an empty batch.
async fn upload_window(
    portal: &mut PortalClient,
    bookmarks: &BookmarkStore,
    key: &str,
    readings: &[Reading],
    newest: Option<Timestamp>,
) -> HarvestResult<(usize, bool)> {
    // ---
    let mut mapped = portal.portal_readings(readings).await?;
    mapped.sort_by_key(|r| r.created);
    let stamps: Vec<Timestamp> = mapped.iter().map(|r| r.created).collect();

    let mut acked = 0;
    let outcome = portal
        .upload_readings(&mapped, |batch| {
            acked += batch.len();
            if let Some(ts) = acknowledged_through(&stamps, acked) {
                bookmarks.commit(key, ts)?;
            }
            Ok(())
        })
        .await?;

    if !outcome.ended_empty {
        if let Some(ts) = newest {
            bookmarks.commit(key, ts)?;
        }
    }
    Ok((outcome.uploaded, outcome.ended_empty))
}

/// Newest timestamp all of whose readings are among the first `acked` of
/// `stamps` (sorted ascending).
fn acknowledged_through(stamps: &[Timestamp], acked: usize) -> Option<Timestamp> {
    // ---
    let acked = acked.min(stamps.len());
    let next = stamps.get(acked);
    stamps[..acked]
        .iter()
        .rev()
        .find(|ts| next.map_or(true, |n| *ts < n))
        .copied()
}

/// List, filter and write site and sensor descriptors; mirror them to the
/// portal when `sync` is set.
pub async fn harvest_assets(
    ctx: &HarvesterContext,
    adapter: &dyn Adapter,
    dir: PathBuf,
    sync: bool,
) -> HarvestResult<AssetSummary> {
    // ---
    let polygon = match &ctx.cfg.harvester.bbox_file {
        Some(path) => Some(BoundingPolygon::from_file(path)?),
        None => None,
    };

    let mut sites = adapter.list_sites().await?;
    let listed = sites.len();
    if let Some(polygon) = &polygon {
        sites.retain(|s| polygon.contains(s.latitude, s.longitude));
    }
    let kept: HashSet<String> = sites.iter().map(|s| s.id.clone()).collect();

    let mut sensors = adapter.list_sensors().await?;
    if polygon.is_some() {
        sensors.retain(|s| s.site_id.as_ref().map_or(true, |site| kept.contains(site)));
    }

    let writer = AssetWriter::new(dir);
    for site in &sites {
        writer.write(site)?;
    }
    for sensor in &sensors {
        writer.write(sensor)?;
    }
    info!(
        "Wrote {} sites and {} sensors under {}",
        sites.len(),
        sensors.len(),
        writer.root().display()
    );

    if sync {
        let mut portal = PortalClient::from_config(&ctx.cfg, ctx.portal_client()?)?;
        for site in &sites {
            portal.sync_site(site).await?;
        }
        for sensor in &sensors {
            portal.sync_sensor(sensor).await?;
        }
        info!("Synchronized {} sites and {} sensors with the portal", sites.len(), sensors.len());
    }

    Ok(AssetSummary {
        sites: sites.len(),
        sensors: sensors.len(),
        outside: listed - sites.len(),
    })
}

/// Outcome of the AQI job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AqiSummary {
    pub sensors: usize,
    pub rows: usize,
    pub uploaded: usize,
}

/// Header of the AQI output table.
pub const AQI_HEADER: [&str; 4] = ["timestamp", "sensor", "AQI_DAQI", "AQI_BAND"];

/// Name of the portal AQI standard the index is uploaded under.
pub const DAQI_STANDARD: &str = "DAQI";

/// Compute DAQI for a pipe-delimited readings table and write
/// `timestamp|sensor|AQI_DAQI|AQI_BAND`. Rows without any valid pollutant
/// carry no index and are left out. With a portal session the indices are
/// uploaded as AQI readings of the sensor's location.
pub async fn run_aqi(input: &Path, output: &Path, portal: Option<&HarvesterContext>) -> HarvestResult<AqiSummary> {
    // ---
    let text = tokio::fs::read_to_string(input).await?;
    let by_sensor = compute_from_csv(&text)?;
    let mut summary = AqiSummary {
        sensors: by_sensor.len(),
        ..AqiSummary::default()
    };

    let mut records = Vec::new();
    for (sensor, rows) in &by_sensor {
        for row in rows {
            if let (Some(index), Some(band)) = (row.index, row.band()) {
                records.push(vec![
                    format_timestamp(&row.timestamp),
                    sensor.clone(),
                    index.to_string(),
                    band.label().to_string(),
                ]);
            }
        }
    }
    let mut emitter = CsvEmitter::with_header(output, AQI_HEADER.iter().map(|h| h.to_string()).collect());
    summary.rows = emitter.write_records(&records)?;
    emitter.finish()?;
    info!("{} AQI rows for {} sensors in {}", summary.rows, summary.sensors, output.display());

    if let Some(ctx) = portal {
        let mut client = PortalClient::from_config(&ctx.cfg, ctx.portal_client()?)?;
        let standard = client
            .lookup(AqiStandard::EDGE, DAQI_STANDARD)
            .await?
            .ok_or_else(|| HarvestError::Config(format!("portal has no AQI standard {}", DAQI_STANDARD)))?;
        let mut readings = Vec::new();
        for (sensor, rows) in &by_sensor {
            let Some(location) = client.lookup(Location::EDGE, sensor).await? else {
                warn!("No portal location for {}, skipping its AQI", sensor);
                continue;
            };
            readings.extend(rows.iter().filter_map(|row| {
                row.index.map(|value| AqiReading {
                    location_id: location,
                    aqi_standard_id: standard,
                    value,
                    created: row.timestamp,
                })
            }));
        }
        summary.uploaded = client.upload_aqi_readings(&readings).await?.uploaded;
    }
    Ok(summary)
}

/// Upsert reading-type groups and AQI standards from the `[portal]` input files.
pub async fn run_portal_meta(ctx: &HarvesterContext) -> HarvestResult<MetaSummary> {
    // ---
    let mut portal = PortalClient::from_config(&ctx.cfg, ctx.portal_client()?)?;
    let mut summary = MetaSummary::default();
    if let Some(path) = &ctx.cfg.portal.reading_type_groups {
        let groups = load_reading_type_groups(path)?;
        let synced = sync_reading_type_groups(&mut portal, &groups).await?;
        summary.categories = synced.categories;
        summary.reading_types = synced.reading_types;
    }
    if let Some(path) = &ctx.cfg.portal.aqi_standards {
        let standards = load_aqi_standards(path)?;
        summary.aqi_standards = sync_aqi_standards(&mut portal, &standards).await?;
    }
    if summary == MetaSummary::default() {
        warn!("Nothing to sync: set [portal] reading_type_groups or aqi_standards");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::Config;
    use crate::http::mock::{MockHttpClient, MockReply, Method};
    use crate::http::HttpClient;
    use crate::models::{parse_timestamp, FieldValue, OutputColumns, Sensor, Site};
    use crate::sources::RawStream;
    use async_trait::async_trait;
    use chrono::Timelike;
    use futures::stream::{self, StreamExt};
    use serde_json::json;
    use uuid::Uuid;

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("ufo-driver-{}", Uuid::new_v4()))
    }

    /// Hourly windows on 2024-01-01; the 13:00 window fails.
    struct HourlyAdapter;

    #[async_trait]
    impl Adapter for HourlyAdapter {
        fn name(&self) -> &'static str {
            "hourly"
        }

        fn output_columns(&self) -> OutputColumns {
            OutputColumns::new("sensor", &["AQ_NO2"])
        }

        fn window(&self) -> Option<Duration> {
            Some(Duration::hours(1))
        }

        async fn streams(&self) -> HarvestResult<Vec<String>> {
            Ok(vec!["S1".into()])
        }

        async fn list_sites(&self) -> HarvestResult<Vec<Site>> {
            Ok(vec![
                Site {
                    id: "S0001".into(),
                    latitude: 53.38,
                    longitude: -1.47,
                    ..Site::default()
                },
                Site {
                    id: "FAR".into(),
                    latitude: 51.5,
                    longitude: -0.12,
                    ..Site::default()
                },
            ])
        }

        async fn list_sensors(&self) -> HarvestResult<Vec<Sensor>> {
            Ok(vec![
                Sensor {
                    id: "S1".into(),
                    site_id: Some("S0001".into()),
                    ..Sensor::default()
                },
                Sensor {
                    id: "S2".into(),
                    site_id: Some("FAR".into()),
                    ..Sensor::default()
                },
            ])
        }

        async fn fetch_window(&self, stream: &str, from: Timestamp, _to: Timestamp) -> HarvestResult<RawStream> {
            // ---
            let at = |t: &str, v: f64| Ok(RawReading::new(stream, t, "AQ_NO2", FieldValue::Float(v)));
            let rows = match from.hour() {
                10 => vec![at("2024-01-01T10:00:00Z", 1.0), at("2024-01-01T10:30:00Z", 2.0)],
                11 => vec![at("2024-01-01T11:15:00Z", 3.0)],
                12 => vec![at("2024-01-01T12:00:00Z", 4.0)],
                _ => return Err(HarvestError::Parse("truncated block".into())),
            };
            Ok(stream::iter(rows).boxed())
        }
    }

    fn context(dir: &Path, portal: Option<&MockHttpClient>) -> HarvesterContext {
        // ---
        let mut cfg = Config::defaults("hourly");
        cfg.portal.base_url = Some("https://portal.test".into());
        cfg.harvester.max_retries = 0;
        let bookmarks = Arc::new(BookmarkStore::open(dir.join("bookmarks.json")).unwrap());
        let ctx = HarvesterContext::new(Arc::new(cfg), Arc::new(MockHttpClient::new()), bookmarks);
        match portal {
            Some(mock) => {
                let client: Arc<dyn HttpClient> = Arc::new(mock.clone());
                ctx.with_portal(client)
            }
            None => ctx,
        }
    }

    fn worker(ctx: &HarvesterContext, output: &Path, range: (Timestamp, Timestamp), sync: bool) -> StreamWorker {
        // ---
        let adapter: Arc<dyn Adapter> = Arc::new(HourlyAdapter);
        let spec = Arc::new(transform_spec(adapter.as_ref(), &ctx.cfg));
        StreamWorker {
            ctx: ctx.clone(),
            emitter: Arc::new(Mutex::new(CsvEmitter::new(output, &spec.columns))),
            adapter,
            spec,
            key: "hourly:S1".into(),
            stream: "S1".into(),
            range: Some(range),
            sync,
        }
    }

    #[tokio::test]
    async fn test_failed_window_keeps_last_committed_bookmark() {
        // ---
        let dir = scratch();
        let ctx = context(&dir, None);
        ctx.bookmarks.commit("hourly:S1", ts("2024-01-01T10:00:00Z")).unwrap();
        let output = dir.join("out.csv");
        let w = worker(&ctx, &output, (ts("2024-01-01T10:00:00Z"), ts("2024-01-01T14:00:00Z")), false);

        let outcome = w.run().await;

        assert!(matches!(outcome.error, Some(HarvestError::Parse(_))));
        assert_eq!(outcome.bookmark, Some(ts("2024-01-01T12:00:00Z")));
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.dropped, 1);
        let text = std::fs::read_to_string(&output).unwrap();
        assert!(!text.contains("10:00:00+00:00"));
        assert!(text.ends_with("2024-01-01T12:00:00+00:00|S1|4.0\n"));
        let reopened = BookmarkStore::open(dir.join("bookmarks.json")).unwrap();
        assert_eq!(reopened.get("hourly:S1"), Some(ts("2024-01-01T12:00:00Z")));
    }

    #[tokio::test]
    async fn test_cancelled_stream_stops_between_windows() {
        // ---
        let dir = scratch();
        let ctx = context(&dir, None);
        ctx.cancel();
        let w = worker(&ctx, &dir.join("out.csv"), (ts("2024-01-01T10:00:00Z"), ts("2024-01-01T12:00:00Z")), false);
        let outcome = w.run().await;
        assert!(outcome.is_ok());
        assert!(outcome.cancelled);
        assert_eq!(outcome.written, 0);
        assert_eq!(outcome.bookmark, None);
    }

    #[tokio::test]
    async fn test_portal_upload_advances_bookmark_per_window() {
        // ---
        let dir = scratch();
        let portal = MockHttpClient::new();
        portal.on_get("/sensors", MockReply::Json(json!([{"id": 7, "name": "S1"}])));
        portal.on_get("/reading-types", MockReply::Json(json!([{"id": 3, "name": "AQ_NO2"}])));
        portal.on_post("readings/bulk", MockReply::Json(json!({"created": 1})));
        let ctx = context(&dir, Some(&portal));
        let w = worker(&ctx, &dir.join("out.csv"), (ts("2024-01-01T10:00:00Z"), ts("2024-01-01T12:00:00Z")), true);

        let outcome = w.run().await;

        assert!(outcome.is_ok(), "{}", outcome);
        assert_eq!(outcome.uploaded, 3);
        assert_eq!(outcome.bookmark, Some(ts("2024-01-01T11:15:00Z")));
        let posted = portal.requests_of(Method::Post);
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].body.as_ref().unwrap()[0]["sensor_id"], 7);
    }

    #[tokio::test]
    async fn test_empty_batch_ends_stream_cleanly() {
        // ---
        let dir = scratch();
        let portal = MockHttpClient::new();
        portal.on_get("/sensors", MockReply::Json(json!([{"id": 7, "name": "S1"}])));
        portal.on_get("/reading-types", MockReply::Json(json!([{"id": 3, "name": "AQ_NO2"}])));
        portal.on_post("readings/bulk", MockReply::Status(422, "empty batch".into()));
        let ctx = context(&dir, Some(&portal));
        let w = worker(&ctx, &dir.join("out.csv"), (ts("2024-01-01T10:00:00Z"), ts("2024-01-01T14:00:00Z")), true);

        let outcome = w.run().await;

        assert!(outcome.is_ok());
        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.bookmark, None);
        assert_eq!(portal.requests_of(Method::Post).len(), 1);
    }

    #[test]
    fn test_acknowledged_through_never_splits_a_timestamp() {
        // ---
        let stamps = vec![
            ts("2024-01-01T10:00:00Z"),
            ts("2024-01-01T11:00:00Z"),
            ts("2024-01-01T11:00:00Z"),
            ts("2024-01-01T12:00:00Z"),
        ];
        assert_eq!(acknowledged_through(&stamps, 0), None);
        assert_eq!(acknowledged_through(&stamps, 2), Some(ts("2024-01-01T10:00:00Z")));
        assert_eq!(acknowledged_through(&stamps, 3), Some(ts("2024-01-01T11:00:00Z")));
        assert_eq!(acknowledged_through(&stamps, 4), Some(ts("2024-01-01T12:00:00Z")));
    }

    #[tokio::test]
    async fn test_assets_are_clipped_to_bounding_polygon() {
        // ---
        let dir = scratch();
        std::fs::create_dir_all(&dir).unwrap();
        let bbox = dir.join("bbox.geojson");
        std::fs::write(
            &bbox,
            r#"{"type":"Polygon","coordinates":[[[-2.0,53.0],[-1.0,53.0],[-1.0,54.0],[-2.0,54.0],[-2.0,53.0]]]}"#,
        )
        .unwrap();
        let mut cfg = Config::defaults("hourly");
        cfg.harvester.bbox_file = Some(bbox);
        let bookmarks = Arc::new(BookmarkStore::open(dir.join("b.json")).unwrap());
        let ctx = HarvesterContext::new(Arc::new(cfg), Arc::new(MockHttpClient::new()), bookmarks);

        let summary = harvest_assets(&ctx, &HourlyAdapter, dir.join("assets"), false).await.unwrap();

        assert_eq!(summary, AssetSummary { sites: 1, sensors: 1, outside: 1 });
        assert!(dir.join("assets/sites/S0001.txt").exists());
        assert!(dir.join("assets/sensors/S1.txt").exists());
        assert!(!dir.join("assets/sites/FAR.txt").exists());
    }

    #[test]
    fn test_summary_line() {
        // ---
        let mut outcome = StreamOutcome::new("ST1");
        outcome.retrieved = 10;
        outcome.written = 4;
        outcome.dropped = 2;
        outcome.bookmark = Some(ts("2024-01-01T12:00:00Z"));
        assert_eq!(
            outcome.to_string(),
            "ST1: retrieved 10 rows, wrote 4 rows, dropped 2, bookmark advanced to 2024-01-01T12:00:00+00:00"
        );
        let summary = RunSummary {
            source: "x".into(),
            streams: vec![outcome],
            assets: None,
            rows_written: 4,
            error: None,
        };
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_aqi_job_writes_and_uploads_indices() {
        // ---
        let dir = scratch();
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("readings.csv");
        std::fs::write(
            &input,
            "timestamp|sensor|AQ_O3|AQ_NO2\n\
             2024-01-01T00:00:00+00:00|S0001|115|201\n\
             2024-01-01T00:00:00+00:00|S0002|-32767|-32767\n",
        )
        .unwrap();
        let portal = MockHttpClient::new();
        portal.on_get("/aqi-standards", MockReply::Json(json!([{"id": 2, "name": "daqi"}])));
        portal.on_get("/locations", MockReply::Json(json!([{"id": 11, "name": "S0001"}])));
        portal.on_post("aqi-readings/bulk", MockReply::Json(json!({})));
        let ctx = context(&dir, Some(&portal));
        let output = dir.join("aqi.csv");

        let summary = run_aqi(&input, &output, Some(&ctx)).await.unwrap();

        assert_eq!(summary, AqiSummary { sensors: 2, rows: 1, uploaded: 1 });
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "timestamp|sensor|AQI_DAQI|AQI_BAND\n2024-01-01T00:00:00+00:00|S0001|4|MODERATE\n"
        );
        let body = portal.requests_of(Method::Post)[0].body.clone().unwrap();
        assert_eq!(body[0]["location_id"], 11);
        assert_eq!(body[0]["aqi_standard_id"], 2);
        assert_eq!(body[0]["value"], 4);
    }

    #[tokio::test]
    async fn test_portal_meta_without_inputs_touches_nothing() {
        // ---
        let dir = scratch();
        let portal = MockHttpClient::new();
        let ctx = context(&dir, Some(&portal));
        assert_eq!(run_portal_meta(&ctx).await.unwrap(), MetaSummary::default());
        assert!(portal.requests().is_empty());
    }
}
