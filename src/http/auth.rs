//! Credential sources and the session login state machine.
//!
//! `Unauthenticated → Authenticating → Authenticated → Expired → Authenticating`.
//! Bearer and Basic credentials need no login; the session is authenticated
//! from the start.

use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::error::{HarvestError, HarvestResult};

// ---

/// OAuth2 scope requested by the client-credentials grant.
pub const OAUTH_SCOPE: &str = "view_data";

/// Header carrying the key of [`AuthScheme::ApiKey`] sources.
pub const DEFAULT_API_KEY_HEADER: &str = "APIKey";

/// Authentication scheme a source expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    Bearer,
    Basic,
    ClientCredentials,
    Login,
    /// Key sent in a vendor-specific header (Stat-Xplore `APIKey`).
    ApiKey,
}

impl FromStr for AuthScheme {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(AuthScheme::None),
            "bearer" | "token" => Ok(AuthScheme::Bearer),
            "basic" => Ok(AuthScheme::Basic),
            "oauth2" | "client_credentials" => Ok(AuthScheme::ClientCredentials),
            "login" | "cookie" => Ok(AuthScheme::Login),
            "apikey" | "api_key" => Ok(AuthScheme::ApiKey),
            other => Err(HarvestError::Config(format!("unknown auth scheme '{}'", other))),
        }
    }
}

#[derive(Clone)]
pub enum Credentials {
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
    },
    /// User/password login that issues a session cookie.
    Login {
        login_url: String,
        username: String,
        password: String,
    },
    ApiKey {
        header: String,
        key: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        match self {
            Credentials::None => write!(f, "None"),
            Credentials::Bearer(_) => write!(f, "Bearer(****)"),
            Credentials::Basic { username, .. } => write!(f, "Basic({}:****)", username),
            Credentials::ClientCredentials { token_url, client_id, .. } => {
                write!(f, "ClientCredentials({} @ {})", client_id, token_url)
            }
            Credentials::Login { login_url, username, .. } => {
                write!(f, "Login({} @ {})", username, login_url)
            }
            Credentials::ApiKey { header, .. } => write!(f, "ApiKey({}: ****)", header),
        }
    }
}

impl Credentials {
    /// Build credentials for `scheme` from the `[credentials]` and `[api]` sections.
    pub fn from_config(cfg: &Config, scheme: AuthScheme) -> HarvestResult<Credentials> {
        // ---
        let c = &cfg.credentials;
        let missing = |key: &str| HarvestError::Config(format!("{:?} auth needs {}", scheme, key));
        Ok(match scheme {
            AuthScheme::None => Credentials::None,
            AuthScheme::Bearer => Credentials::Bearer(c.token.clone().ok_or_else(|| missing("token"))?),
            AuthScheme::Basic => Credentials::Basic {
                username: c.username.clone().ok_or_else(|| missing("username"))?,
                password: c.password.clone().unwrap_or_default(),
            },
            AuthScheme::ClientCredentials => Credentials::ClientCredentials {
                token_url: cfg.api.token_url.clone().ok_or_else(|| missing("token_url"))?,
                client_id: c.client_id.clone().ok_or_else(|| missing("client_id"))?,
                client_secret: c.client_secret.clone().ok_or_else(|| missing("client_secret"))?,
            },
            AuthScheme::Login => Credentials::Login {
                login_url: cfg.api.login_url.clone().ok_or_else(|| missing("login_url"))?,
                username: c.username.clone().ok_or_else(|| missing("username"))?,
                password: c.password.clone().ok_or_else(|| missing("password"))?,
            },
            AuthScheme::ApiKey => Credentials::ApiKey {
                header: cfg.option("api_key_header").unwrap_or(DEFAULT_API_KEY_HEADER).to_string(),
                key: c.token.clone().ok_or_else(|| missing("token"))?,
            },
        })
    }

    /// Whether a 401 can be answered by logging in again.
    pub fn can_login(&self) -> bool {
        matches!(
            self,
            Credentials::ClientCredentials { .. } | Credentials::Login { .. }
        )
    }

    /// Initial session state for these credentials.
    pub fn initial_state(&self) -> SessionState {
        if self.can_login() {
            SessionState::Unauthenticated
        } else {
            SessionState::Authenticated { token: None }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    /// `token` is the OAuth2 access token; cookie sessions keep it in the jar.
    Authenticated { token: Option<String> },
    Expired,
}

impl SessionState {
    pub fn needs_login(&self) -> bool {
        matches!(self, SessionState::Unauthenticated | SessionState::Expired)
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            SessionState::Authenticated { token } => token.as_deref(),
            _ => None,
        }
    }
}
