//! Per-run state handed to every component.
//!
//! Holds the immutable configuration, the vendor session, the portal session
//! factory, the bookmark store and the cancellation flag. Cloning is cheap;
//! every field is shared. Portal sessions are not: each caller of
//! [`HarvesterContext::portal_client`] gets its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::bookmark::BookmarkStore;
use crate::config::Config;
use crate::error::{HarvestError, HarvestResult};
use crate::http::{AuthScheme, Credentials, HttpClient, ReqwestHttpClient};
use crate::sources::{SourceContext, SourceKind};

// ---

/// Opens a portal session for one worker.
type PortalSessions = Arc<dyn Fn() -> HarvestResult<Arc<dyn HttpClient>> + Send + Sync>;

#[derive(Clone)]
pub struct HarvesterContext {
    pub cfg: Arc<Config>,
    pub client: Arc<dyn HttpClient>,
    /// Source of Awesome portal sessions, when `[portal] base_url` is set.
    portal: Option<PortalSessions>,
    pub bookmarks: Arc<BookmarkStore>,
    cancel: Arc<AtomicBool>,
}

impl HarvesterContext {
    pub fn new(cfg: Arc<Config>, client: Arc<dyn HttpClient>, bookmarks: Arc<BookmarkStore>) -> Self {
        HarvesterContext {
            cfg,
            client,
            portal: None,
            bookmarks,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Every worker shares `portal`.
    pub fn with_portal(mut self, portal: Arc<dyn HttpClient>) -> Self {
        self.portal = Some(Arc::new(move || -> HarvestResult<Arc<dyn HttpClient>> { Ok(portal.clone()) }));
        self
    }

    /// Every worker opens a fresh session from `[portal]`.
    fn with_portal_sessions(mut self) -> Self {
        let cfg = self.cfg.clone();
        self.portal = Some(Arc::new(move || portal_session(&cfg)));
        self
    }

    /// Context for `kind` with real HTTP sessions and the configured bookmark file.
    ///
    /// The vendor session uses the source's usual scheme unless `[source] auth`
    /// names another one.
    pub fn from_config(kind: SourceKind, cfg: Config) -> HarvestResult<Self> {
        // ---
        let scheme = match cfg.option("auth") {
            Some(name) => name.parse::<AuthScheme>()?,
            None => kind.auth_scheme(),
        };
        let credentials = Credentials::from_config(&cfg, scheme)?;
        info!("Using {:?} authentication for {}", scheme, kind);
        let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::from_config(&cfg, credentials)?);
        let bookmarks = Arc::new(BookmarkStore::open(cfg.harvester.bookmark_file.clone())?);
        let has_portal = cfg.portal.base_url.is_some();

        let ctx = HarvesterContext::new(Arc::new(cfg), client, bookmarks);
        Ok(if has_portal { ctx.with_portal_sessions() } else { ctx })
    }

    /// Context for jobs that only talk to the portal (AQI upload, metadata).
    pub fn portal_only(cfg: Config) -> HarvestResult<Self> {
        // ---
        if cfg.portal.base_url.is_none() {
            return Err(HarvestError::Config("[portal] base_url must be set".into()));
        }
        let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::from_config(&cfg, Credentials::None)?);
        let bookmarks = Arc::new(BookmarkStore::open(cfg.harvester.bookmark_file.clone())?);
        Ok(HarvesterContext::new(Arc::new(cfg), client, bookmarks).with_portal_sessions())
    }

    /// What an adapter of `kind` needs from this run.
    pub fn source_context(&self, kind: SourceKind) -> SourceContext {
        SourceContext::new(kind, self.cfg.clone(), self.client.clone())
    }

    /// A portal session for one worker.
    pub fn portal_client(&self) -> HarvestResult<Arc<dyn HttpClient>> {
        match &self.portal {
            Some(open) => open(),
            None => Err(HarvestError::Config("[portal] base_url must be set".into())),
        }
    }

    /// Ask every stream to stop after its current window.
    pub fn cancel(&self) {
        // ---
        if !self.cancel.swap(true, Ordering::SeqCst) {
            warn!("Cancellation requested, finishing current windows");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Portal session: Basic auth when `[portal] username` is set, else anonymous.
fn portal_session(cfg: &Config) -> HarvestResult<Arc<dyn HttpClient>> {
    // ---
    let credentials = match &cfg.portal.username {
        Some(username) => Credentials::Basic {
            username: username.clone(),
            password: cfg.portal.password.clone().unwrap_or_default(),
        },
        None => Credentials::None,
    };
    Ok(Arc::new(ReqwestHttpClient::from_config(cfg, credentials)?))
}
