//! Command-line entry point for the Urban Flows harvesters.
//!
//! One subcommand per source plus the `aqi` and `portal-meta` jobs. The
//! startup sequence is:
//! - Load `.env`, parse arguments
//! - Initialize structured logging/tracing
//! - Load the INI configuration for the chosen source
//! - Build the [`HarvesterContext`] (sessions, bookmarks, cancellation)
//! - Run the job inside a span carrying a fresh run id
//!
//! # Environment Variables
//! - `RUST_LOG` (optional) – overrides the level chosen by `-v`/`-d`
//! - `FORCE_COLOR` (optional) – force colours on or off
//! - `UFO_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `UFO_CONFIG` (optional) – same as `-c/--config`
//!
//! Exit codes: 0 success, 1 failure, 2 invalid arguments.

use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tracing::Instrument;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use ufo_harvester::driver::{run_aqi, run_portal_meta};
use ufo_harvester::models::Timestamp;
use ufo_harvester::{run_source, Config, HarvesterContext, RunOptions, SourceKind};

// ---

#[derive(Debug, Parser)]
#[command(name = "ufo-harvester", version, about = "Urban Flows Observatory data harvesters")]
struct Cli {
    /// Log progress (info level).
    #[arg(short, long)]
    verbose: bool,

    /// Log everything (debug level).
    #[arg(short, long)]
    debug: bool,

    /// Also append errors to this file.
    #[arg(short, long, value_name = "PATH")]
    error: Option<PathBuf>,

    /// Configuration file (INI).
    #[arg(short, long, value_name = "PATH", env = "UFO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// DEFRA UK-AIR OGC SOS observations
    DefraSos(SourceArgs),
    /// Environment Agency flood-monitoring readings
    DefraFlood(SourceArgs),
    /// DEFRA UK-AIR annual INSPIRE Atom downloads
    DefraAtom(SourceArgs),
    /// Environment Agency hydrology Atom packages
    EaAtom(SourceArgs),
    /// Aeroqual Cloud instruments
    Aeroqual(SourceArgs),
    /// Oizom devices
    Oizom(SourceArgs),
    /// EarthSense Zephyr monitors
    Zephyr(SourceArgs),
    /// The Things Network storage integration
    Ttn(SourceArgs),
    /// PHE Fingertips indicators
    Fingertips(SourceArgs),
    /// NOMIS labour-market datasets
    Nomis(SourceArgs),
    /// DWP Stat-Xplore tables
    StatXplore(SourceArgs),
    /// data.gov.uk CKAN DataStore resources
    Ckan(SourceArgs),
    /// Urban Flows data-extraction endpoint
    Ufdex(SourceArgs),
    /// Compute DAQI from a readings CSV
    Aqi(AqiArgs),
    /// Upsert reading-type groups and AQI standards into the portal
    PortalMeta,
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Harvest this single day only.
    #[arg(short, long, value_name = "YYYY-MM-DD", conflicts_with = "year")]
    date: Option<NaiveDate>,

    /// Harvest this calendar year only.
    #[arg(long, value_name = "YYYY")]
    year: Option<i32>,

    /// Readings CSV (default `<source>.csv`).
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Write site and sensor descriptors under this directory.
    #[arg(long, value_name = "DIR")]
    assets: Option<PathBuf>,

    /// Mirror assets and readings to the portal.
    #[arg(long)]
    sync: bool,
}

#[derive(Debug, Args)]
struct AqiArgs {
    /// Pipe-delimited readings table.
    input: PathBuf,

    #[arg(short, long, value_name = "PATH", default_value = "aqi.csv")]
    output: PathBuf,

    /// Upload the indices as portal AQI readings.
    #[arg(long)]
    upload: bool,
}

impl Command {
    fn source(&self) -> Option<(SourceKind, &SourceArgs)> {
        // ---
        let pair = match self {
            Command::DefraSos(a) => (SourceKind::DefraSos, a),
            Command::DefraFlood(a) => (SourceKind::DefraFlood, a),
            Command::DefraAtom(a) => (SourceKind::DefraAtom, a),
            Command::EaAtom(a) => (SourceKind::EaAtom, a),
            Command::Aeroqual(a) => (SourceKind::Aeroqual, a),
            Command::Oizom(a) => (SourceKind::Oizom, a),
            Command::Zephyr(a) => (SourceKind::Zephyr, a),
            Command::Ttn(a) => (SourceKind::Ttn, a),
            Command::Fingertips(a) => (SourceKind::Fingertips, a),
            Command::Nomis(a) => (SourceKind::Nomis, a),
            Command::StatXplore(a) => (SourceKind::StatXplore, a),
            Command::Ckan(a) => (SourceKind::Ckan, a),
            Command::Ufdex(a) => (SourceKind::Ufdex, a),
            Command::Aqi(_) | Command::PortalMeta => return None,
        };
        Some(pair)
    }

    /// Configuration name: the source, or the job.
    fn name(&self) -> &'static str {
        match self {
            Command::Aqi(_) => "aqi",
            Command::PortalMeta => "portal",
            other => other.source().map(|(kind, _)| kind.name()).unwrap_or("harvester"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---
    dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose, cli.debug, cli.error.as_deref()) {
        eprintln!("Cannot initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    let span = tracing::info_span!("run", id = %Uuid::new_v4(), job = cli.command.name());
    match run(&cli).instrument(span).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<ExitCode> {
    // ---
    let name = cli.command.name();
    let cfg = Config::load(name, cli.config.as_deref())?;
    cfg.log_config();

    if let Some((kind, args)) = cli.command.source() {
        return harvest(kind, args, cfg).await;
    }

    match &cli.command {
        Command::Aqi(args) => {
            let ctx = if args.upload {
                Some(HarvesterContext::portal_only(cfg)?)
            } else {
                None
            };
            let summary = run_aqi(&args.input, &args.output, ctx.as_ref())
                .await
                .with_context(|| format!("AQI job on '{}' failed", args.input.display()))?;
            println!(
                "aqi: {} sensors, wrote {} rows, uploaded {}",
                summary.sensors, summary.rows, summary.uploaded
            );
        }
        Command::PortalMeta => {
            let ctx = HarvesterContext::portal_only(cfg)?;
            let summary = run_portal_meta(&ctx).await?;
            println!(
                "portal-meta: {} categories, {} reading types, {} AQI standards",
                summary.categories, summary.reading_types, summary.aqi_standards
            );
        }
        _ => return Err(anyhow!("unhandled command {}", name)),
    }
    Ok(ExitCode::SUCCESS)
}

async fn harvest(kind: SourceKind, args: &SourceArgs, cfg: Config) -> Result<ExitCode> {
    // ---
    let ctx = HarvesterContext::from_config(kind, cfg)?;

    let watcher = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher.cancel();
        }
    });

    let opts = RunOptions {
        output: args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.csv", kind.name()))),
        assets: args.assets.clone(),
        sync: args.sync,
        range: requested_range(args)?,
    };

    let summary = run_source(&ctx, kind, &opts)
        .await
        .with_context(|| format!("{} harvest failed", kind))?;

    for outcome in &summary.streams {
        println!("{}", outcome);
    }
    if let Some(assets) = summary.assets {
        println!(
            "assets: {} sites, {} sensors ({} sites outside the bounding box)",
            assets.sites, assets.sensors, assets.outside
        );
    }
    if let Some(e) = &summary.error {
        eprintln!("error: {}", e);
    }
    Ok(match summary.exit_code() {
        0 => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// `[from, to)` for `--date` or `--year`.
fn requested_range(args: &SourceArgs) -> Result<Option<(Timestamp, Timestamp)>> {
    // ---
    let midnight = |day: NaiveDate| Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN));
    if let Some(day) = args.date {
        return Ok(Some((midnight(day), midnight(day) + Duration::days(1))));
    }
    if let Some(year) = args.year {
        let first = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(|| anyhow!("Invalid year {}", year))?;
        let next = NaiveDate::from_ymd_opt(first.year() + 1, 1, 1).ok_or_else(|| anyhow!("Invalid year {}", year))?;
        return Ok(Some((midnight(first), midnight(next))));
    }
    Ok(None)
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled, written to stderr
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `UFO_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG` when set, else `-d` (debug), `-v` (info) or warn
/// - With `error_file`, a second layer appending ERROR events to that file
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing(verbose: bool, debug: bool, error_file: Option<&Path>) -> Result<()> {
    // ---
    let span_events = match env::var("UFO_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to the command-line flags
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match (debug, verbose) {
            (true, _) => "debug",
            (false, true) => "info",
            _ => "warn",
        };
        EnvFilter::new(format!("{level},hyper=warn,hyper_util=warn,reqwest=warn,h2=warn,rustls=warn"))
    };

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_ansi(use_color)
        .compact()
        .with_filter(env_filter);

    let errors = match error_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open error log '{}'", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .compact()
                    .with_filter(LevelFilter::ERROR),
            )
        }
        None => None,
    };

    tracing_subscriber::registry().with(console).with(errors).init();
    Ok(())
}
