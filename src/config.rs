//! Configuration loader for the harvesters.
//!
//! Values come from three layers, later layers winning: built-in defaults, the
//! INI file given with `-c/--config` (or `$HOME/.ufo-harvester/<source>.ini`)
//! and `UFO_*` environment variables (with optional `.env` support provided by
//! the caller). The result is an immutable [`Config`] shared by every component
//! of a run through the harvester context.
//!
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use ini::Ini;

use crate::models::{parse_timestamp, Timestamp};
use crate::transform::FieldType;

// ---

/// Sheffield city centre, the default central point for distance filters.
pub const DEFAULT_CENTRE: (f64, f64) = (53.3811, -1.4701);

/// Server contract for `/readings/bulk`.
pub const MAX_BULK_READINGS_CHUNK_SIZE: usize = 100;

/// Parse an optional environment variable into `$ty`, keeping `$current` when unset.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $current:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($current)
    };
}

/// Read a required key from an INI section.
macro_rules! require_key {
    ($props:expr, $section:expr, $key:expr) => {
        $props
            .get($key)
            .ok_or_else(|| anyhow!("[{}] {} must be set", $section, $key))?
    };
}

/// Credentials from the `[credentials]` section. Which fields matter depends
/// on the source's authentication scheme.
#[derive(Debug, Clone, Default)]
pub struct CredentialsConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token: Option<String>,
}

/// Vendor API settings from `[api]`.
#[derive(Debug, Clone, Default)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub application_id: Option<String>,
    pub token_url: Option<String>,
    pub login_url: Option<String>,
}

/// CSV output settings from `[csv]`.
#[derive(Debug, Clone, Default)]
pub struct CsvConfig {
    /// Overrides the source's identifier column name.
    pub id_column: Option<String>,
    /// Overrides the source's metric columns.
    pub columns: Option<Vec<String>>,
}

/// Run-level settings from `[harvester]`.
#[derive(Debug, Clone)]
pub struct HarvesterSettings {
    /// Cursor used when a stream has no bookmark yet.
    pub time_start: Timestamp,
    pub bookmark_file: PathBuf,
    /// Width of one fetch window, in hours.
    pub window_hours: i64,
    pub max_retries: usize,
    /// Streams harvested concurrently.
    pub parallel_streams: usize,
    pub connect_timeout: Duration,
    /// Deadline for non-streamed requests. `None` leaves them uncapped.
    pub request_timeout: Option<Duration>,
    pub centre: (f64, f64),
    pub radius_km: f64,
    /// Selected features of interest (sampling points). Empty selects all.
    pub features: Vec<String>,
    /// Selected stations or devices. Empty selects all.
    pub stations: Vec<String>,
    pub bbox_file: Option<PathBuf>,
}

impl Default for HarvesterSettings {
    fn default() -> Self {
        HarvesterSettings {
            time_start: Utc.timestamp_opt(1_577_836_800, 0).single().unwrap_or_default(),
            bookmark_file: PathBuf::from("bookmarks.json"),
            window_hours: 24,
            max_retries: 3,
            parallel_streams: 4,
            connect_timeout: Duration::from_secs(60),
            request_timeout: Some(Duration::from_secs(300)),
            centre: DEFAULT_CENTRE,
            radius_km: 30.0,
            features: Vec::new(),
            stations: Vec::new(),
            bbox_file: None,
        }
    }
}

/// Awesome portal settings from `[portal]`.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bulk_readings_chunk_size: usize,
    pub reading_type_groups: Option<PathBuf>,
    pub aqi_standards: Option<PathBuf>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        PortalConfig {
            base_url: None,
            username: None,
            password: None,
            bulk_readings_chunk_size: MAX_BULK_READINGS_CHUNK_SIZE,
            reading_type_groups: None,
            aqi_standards: None,
        }
    }
}

/// Strongly typed harvester configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the run.
#[derive(Debug, Clone, Default)]
pub struct Config {
    // ---
    /// Source name this configuration was loaded for.
    pub source: String,
    pub credentials: CredentialsConfig,
    pub api: ApiConfig,
    pub csv: CsvConfig,
    /// `[fields]` `<label>=<type>` coercers.
    pub fields: BTreeMap<String, FieldType>,
    pub harvester: HarvesterSettings,
    pub portal: PortalConfig,
    /// Free-form `[source]` options interpreted by the adapter.
    pub source_options: BTreeMap<String, String>,
}

impl Config {
    // ---

    /// Built-in defaults for `source`.
    pub fn defaults(source: &str) -> Self {
        Config {
            source: source.to_string(),
            ..Config::default()
        }
    }

    /// Load configuration for `source`.
    ///
    /// Uses `path` when given, else `$HOME/.ufo-harvester/<source>.ini` when it
    /// exists, else defaults. Environment overrides are applied last.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a value is invalid.
    pub fn load(source: &str, path: Option<&Path>) -> Result<Config> {
        // ---
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(source).filter(|p| p.exists()),
        };

        let cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read config file '{}'", p.display()))?;
                Config::from_ini_str(source, &text)
                    .with_context(|| format!("Invalid config file '{}'", p.display()))?
            }
            None => Config::defaults(source),
        };

        cfg.with_env_overrides()
    }

    /// Parse an INI document on top of the defaults.
    pub fn from_ini_str(source: &str, text: &str) -> Result<Config> {
        // ---
        let ini = Ini::load_from_str(text).map_err(|e| anyhow!("INI parse error: {}", e))?;
        let mut cfg = Config::defaults(source);

        if let Some(props) = ini.section(Some("credentials")) {
            cfg.credentials = CredentialsConfig {
                username: props.get("username").map(String::from),
                password: props.get("password").map(String::from),
                client_id: props.get("client_id").map(String::from),
                client_secret: props.get("client_secret").map(String::from),
                token: props.get("token").map(String::from),
            };
            if cfg.credentials.client_id.is_some() {
                let _ = require_key!(props, "credentials", "client_secret");
            }
        }

        if let Some(props) = ini.section(Some("api")) {
            cfg.api = ApiConfig {
                base_url: props.get("base_url").map(String::from),
                application_id: props.get("application_id").map(String::from),
                token_url: props.get("token_url").map(String::from),
                login_url: props.get("login_url").map(String::from),
            };
        }

        if let Some(props) = ini.section(Some("csv")) {
            cfg.csv = CsvConfig {
                id_column: props.get("id_column").map(String::from),
                columns: props.get("columns").map(split_list),
            };
        }

        if let Some(props) = ini.section(Some("fields")) {
            for (label, ty) in props.iter() {
                let field_type = ty
                    .parse::<FieldType>()
                    .map_err(|e| anyhow!("[fields] {}: {}", label, e))?;
                cfg.fields.insert(label.to_lowercase(), field_type);
            }
        }

        if let Some(props) = ini.section(Some("harvester")) {
            let h = &mut cfg.harvester;
            if let Some(v) = props.get("time_start") {
                h.time_start =
                    parse_timestamp(v).ok_or_else(|| anyhow!("[harvester] invalid time_start '{}'", v))?;
            }
            if let Some(v) = props.get("bookmark_file") {
                h.bookmark_file = PathBuf::from(v);
            }
            if let Some(v) = props.get("window_hours") {
                h.window_hours = parse_key("harvester", "window_hours", v)?;
                if h.window_hours <= 0 {
                    return Err(anyhow!("[harvester] window_hours must be positive"));
                }
            }
            if let Some(v) = props.get("max_retries") {
                h.max_retries = parse_key("harvester", "max_retries", v)?;
            }
            if let Some(v) = props.get("parallel_streams") {
                h.parallel_streams = parse_key::<usize>("harvester", "parallel_streams", v)?.max(1);
            }
            if let Some(v) = props.get("connect_timeout_secs") {
                h.connect_timeout = Duration::from_secs(parse_key("harvester", "connect_timeout_secs", v)?);
            }
            if let Some(v) = props.get("request_timeout_secs") {
                let secs: u64 = parse_key("harvester", "request_timeout_secs", v)?;
                h.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if let Some(v) = props.get("latitude") {
                h.centre.0 = parse_key("harvester", "latitude", v)?;
            }
            if let Some(v) = props.get("longitude") {
                h.centre.1 = parse_key("harvester", "longitude", v)?;
            }
            if let Some(v) = props.get("radius_km") {
                h.radius_km = parse_key("harvester", "radius_km", v)?;
            }
            if let Some(v) = props.get("features") {
                h.features = split_list(v);
            }
            if let Some(v) = props.get("stations") {
                h.stations = split_list(v);
            }
            if let Some(v) = props.get("bbox_file") {
                h.bbox_file = Some(PathBuf::from(v));
            }
        }

        if let Some(props) = ini.section(Some("portal")) {
            let p = &mut cfg.portal;
            p.base_url = props.get("base_url").map(String::from);
            p.username = props.get("username").map(String::from);
            p.password = props.get("password").map(String::from);
            if let Some(v) = props.get("bulk_readings_chunk_size") {
                p.bulk_readings_chunk_size = parse_key("portal", "bulk_readings_chunk_size", v)?;
            }
            p.reading_type_groups = props.get("reading_type_groups").map(PathBuf::from);
            p.aqi_standards = props.get("aqi_standards").map(PathBuf::from);
        }

        if let Some(props) = ini.section(Some("source")) {
            for (k, v) in props.iter() {
                cfg.source_options.insert(k.to_string(), v.to_string());
            }
        }

        cfg.portal.bulk_readings_chunk_size = clamp_chunk_size(cfg.portal.bulk_readings_chunk_size);
        Ok(cfg)
    }

    /// Apply `UFO_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Config> {
        // ---
        if let Ok(v) = env::var("UFO_BOOKMARK_FILE") {
            self.harvester.bookmark_file = PathBuf::from(v);
        }
        if let Ok(v) = env::var("UFO_TIME_START") {
            self.harvester.time_start =
                parse_timestamp(&v).ok_or_else(|| anyhow!("Invalid UFO_TIME_START: {}", v))?;
        }
        let chunk = parse_env!(
            "UFO_BULK_READINGS_CHUNK_SIZE",
            usize,
            self.portal.bulk_readings_chunk_size
        );
        self.portal.bulk_readings_chunk_size = clamp_chunk_size(chunk);
        let connect_secs = parse_env!(
            "UFO_HTTP_CONNECT_TIMEOUT_SECS",
            u64,
            self.harvester.connect_timeout.as_secs()
        );
        self.harvester.connect_timeout = Duration::from_secs(connect_secs);
        Ok(self)
    }

    /// Source option from `[source]`.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.source_options.get(key).map(String::as_str)
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks passwords, secrets and tokens while showing all other values.
    pub fn log_config(&self) {
        // ---
        let h = &self.harvester;
        tracing::info!("Configuration loaded for source '{}':", self.source);
        tracing::info!("  api.base_url        : {}", show(&self.api.base_url));
        tracing::info!("  credentials.username: {}", show(&self.credentials.username));
        tracing::info!("  credentials.password: {}", mask(&self.credentials.password));
        tracing::info!("  credentials.client  : {}", show(&self.credentials.client_id));
        tracing::info!("  credentials.secret  : {}", mask(&self.credentials.client_secret));
        tracing::info!("  credentials.token   : {}", mask(&self.credentials.token));
        tracing::info!("  time_start          : {}", h.time_start.to_rfc3339());
        tracing::info!("  bookmark_file       : {}", h.bookmark_file.display());
        tracing::info!("  window_hours        : {}", h.window_hours);
        tracing::info!("  max_retries         : {}", h.max_retries);
        tracing::info!("  parallel_streams    : {}", h.parallel_streams);
        tracing::info!("  connect_timeout     : {:?}", h.connect_timeout);
        tracing::info!("  request_timeout     : {:?}", h.request_timeout);
        tracing::info!("  centre              : {:?} radius {} km", h.centre, h.radius_km);
        tracing::info!("  features            : {}", h.features.len());
        tracing::info!("  stations            : {}", h.stations.len());
        tracing::info!("  portal.base_url     : {}", show(&self.portal.base_url));
        tracing::info!("  portal.password     : {}", mask(&self.portal.password));
        tracing::info!("  bulk_chunk_size     : {}", self.portal.bulk_readings_chunk_size);
        tracing::info!("  fields              : {}", self.fields.len());
    }
}

/// `$HOME/.ufo-harvester/<source>.ini`, when `HOME` is set.
pub fn default_config_path(source: &str) -> Option<PathBuf> {
    env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".ufo-harvester")
            .join(format!("{}.ini", source))
    })
}

fn parse_key<T>(section: &str, key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow!("[{}] invalid {} '{}': {}", section, key, value, e))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn clamp_chunk_size(size: usize) -> usize {
    size.clamp(1, MAX_BULK_READINGS_CHUNK_SIZE)
}

fn show(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("<unset>")
}

fn mask(value: &Option<String>) -> &str {
    match value {
        Some(_) => "****",
        None => "<unset>",
    }
}
