//! HTTP client core.
//!
//! [`HttpClient`] is the seam between adapters/portal sync and the network.
//! [`ReqwestHttpClient`] is the production implementation; unit tests use the
//! scripted mock in `mock`.

mod auth;
mod client;
mod lines;
#[cfg(test)]
pub(crate) mod mock;
mod paginate;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::HarvestResult;

pub use auth::{AuthScheme, Credentials, SessionState};
pub use client::{ReqwestHttpClient, USER_AGENT};
pub use lines::byte_lines;
pub use paginate::{paginate, PageRule};

// ---

/// Query parameters as `(name, value)` pairs, sent in order.
pub type Params<'a> = &'a [(&'a str, &'a str)];

/// Lazy sequence of text lines.
pub type LineStream = BoxStream<'static, HarvestResult<String>>;

/// Authenticated HTTP session used by every component.
///
/// No method retries on its own except the single re-login after a 401.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_json(&self, url: &str, params: Params<'_>) -> HarvestResult<Value>;

    async fn get_text(&self, url: &str, params: Params<'_>) -> HarvestResult<String>;

    /// Stream the body line by line. No total deadline applies.
    async fn stream_lines(&self, url: &str, params: Params<'_>) -> HarvestResult<LineStream>;

    async fn post_json(&self, url: &str, body: &Value) -> HarvestResult<Value>;

    async fn patch_json(&self, url: &str, body: &Value) -> HarvestResult<Value>;

    async fn delete(&self, url: &str) -> HarvestResult<()>;
}

/// Join a base URL and a relative path with exactly one slash.
pub fn join_url(base: &str, path: &str) -> String {
    // ---
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
