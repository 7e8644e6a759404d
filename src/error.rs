//! Error taxonomy shared by every harvester component.
//!
//! Each variant maps to one failure class of the pipeline. The driver looks at
//! [`HarvestError::is_retryable`] to decide whether a window is worth fetching again and
//! at [`HarvestError::aborts_stream`] to decide whether a stream must stop.

use thiserror::Error;

// ---

/// Longest response body excerpt carried inside an error.
pub const BODY_EXCERPT_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// Connection refused, TLS failure, reset.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request deadline passed before a response arrived.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// 401 or 403 that survived a single re-login.
    #[error("authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },

    /// 5xx from the server.
    #[error("server error {status} for {url}: {body}")]
    Server { status: u16, url: String, body: String },

    /// 4xx other than 401/403.
    #[error("client error {status} for {url}: {body}")]
    Client { status: u16, url: String, body: String },

    /// Response body could not be decoded (malformed JSON, invalid UTF-8).
    #[error("decode error: {0}")]
    Decode(String),

    /// Structural violation of a vendor payload.
    #[error("parse error: {0}")]
    Parse(String),

    /// An OGC `ows:Exception` payload.
    #[error("service exception {code}: {text}")]
    ServiceException { code: String, text: String },

    /// A row failed a data-quality rule. Rows are dropped, never the stream.
    #[error("validation error: {0}")]
    Validation(String),

    /// An observed property outside the mapping table and outside the tolerated range.
    #[error("unknown concept: unit={unit} property={property}")]
    MissingConcept { unit: String, property: String },

    /// The portal reported the batch held no storable rows.
    #[error("empty batch: {0}")]
    EmptyBatch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the library.
pub type HarvestResult<T> = Result<T, HarvestError>;

impl HarvestError {
    // ---

    /// Errors the driver may retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarvestError::Transport(_) | HarvestError::Timeout(_) | HarvestError::Server { .. }
        )
    }

    /// Validation errors only drop a row; everything else stops the current stream.
    pub fn aborts_stream(&self) -> bool {
        !matches!(self, HarvestError::Validation(_))
    }

    /// Classify a non-2xx HTTP status into the taxonomy.
    pub fn from_status(status: u16, url: &str, body: &str) -> Self {
        // ---
        let body = excerpt(body);
        match status {
            401 | 403 => HarvestError::Auth { status, body },
            500..=599 => HarvestError::Server {
                status,
                url: url.to_string(),
                body,
            },
            _ => HarvestError::Client {
                status,
                url: url.to_string(),
                body,
            },
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            HarvestError::Auth { status, .. }
            | HarvestError::Server { status, .. }
            | HarvestError::Client { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Trim a response body to [`BODY_EXCERPT_LEN`] characters.
pub fn excerpt(body: &str) -> String {
    // ---
    if body.chars().count() <= BODY_EXCERPT_LEN {
        return body.to_string();
    }
    let mut out: String = body.chars().take(BODY_EXCERPT_LEN).collect();
    out.push('…');
    out
}

impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        // ---
        if e.is_timeout() {
            HarvestError::Timeout(e.to_string())
        } else if e.is_decode() {
            HarvestError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            let url = e.url().map(|u| u.to_string()).unwrap_or_default();
            HarvestError::from_status(status.as_u16(), &url, "")
        } else {
            HarvestError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(e: serde_json::Error) -> Self {
        HarvestError::Decode(e.to_string())
    }
}

impl From<csv::Error> for HarvestError {
    fn from(e: csv::Error) -> Self {
        HarvestError::Parse(format!("csv: {}", e))
    }
}

impl From<quick_xml::Error> for HarvestError {
    fn from(e: quick_xml::Error) -> Self {
        HarvestError::Parse(format!("xml: {}", e))
    }
}
