//! Urban Flows Observatory harvesters.
//!
//! Pulls environmental and socio-economic time series from vendor APIs,
//! normalizes them into canonical readings and writes them out as Urban
//! Flows CSV files, asset descriptors and (optionally) portal objects.
//!
//! Components talk to each other only through the gateways re-exported
//! here; the binary is a thin command-line layer over [`driver`].

pub mod aqi;
pub mod assets;
mod atomic;
pub mod bookmark;
pub mod config;
pub mod context;
pub mod driver;
pub mod emitter;
pub mod error;
pub mod geo;
pub mod http;
pub mod models;
pub mod parsers;
pub mod portal;
pub mod retry;
pub mod sources;
pub mod transform;

pub use config::Config;
pub use context::HarvesterContext;
pub use driver::{run_source, RunOptions, RunSummary, StreamOutcome};
pub use error::{HarvestError, HarvestResult};
pub use sources::SourceKind;
