//! `reqwest` implementation of [`HttpClient`].

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::auth::{Credentials, SessionState, OAUTH_SCOPE};
use super::lines::byte_lines;
use super::{HttpClient, LineStream, Params};
use crate::config::Config;
use crate::error::{HarvestError, HarvestResult};

// ---

/// Fixed user-agent sent with every request.
pub const USER_AGENT: &str = concat!("ufo-harvester/", env!("CARGO_PKG_VERSION"));

/// Header names whose values never reach the log.
const REDACTED_HEADERS: [&str; 5] = ["authorization", "cookie", "set-cookie", "x-api-key", "apikey"];

pub struct ReqwestHttpClient {
    client: reqwest::Client,
    credentials: Credentials,
    state: Mutex<SessionState>,
    /// Deadline for non-streamed requests.
    request_timeout: Option<Duration>,
}

impl ReqwestHttpClient {
    pub fn new(
        credentials: Credentials,
        connect_timeout: Duration,
        request_timeout: Option<Duration>,
    ) -> HarvestResult<Self> {
        // ---
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| HarvestError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(ReqwestHttpClient {
            client,
            state: Mutex::new(credentials.initial_state()),
            credentials,
            request_timeout,
        })
    }

    /// Client with the run's timeouts and the given credentials.
    pub fn from_config(cfg: &Config, credentials: Credentials) -> HarvestResult<Self> {
        ReqwestHttpClient::new(
            credentials,
            cfg.harvester.connect_timeout,
            cfg.harvester.request_timeout,
        )
    }

    pub async fn session_state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Log in when needed and return the bearer token of the session, if any.
    async fn ensure_session(&self) -> HarvestResult<Option<String>> {
        // ---
        let mut state = self.state.lock().await;
        if state.needs_login() {
            debug!("Session {:?} -> Authenticating", *state);
            *state = SessionState::Authenticating;
            match self.login().await {
                Ok(token) => {
                    info!("Session authenticated with {:?}", self.credentials);
                    *state = SessionState::Authenticated { token };
                }
                Err(e) => {
                    *state = SessionState::Unauthenticated;
                    return Err(e);
                }
            }
        }
        Ok(state.token().map(String::from))
    }

    async fn login(&self) -> HarvestResult<Option<String>> {
        // ---
        match &self.credentials {
            Credentials::ClientCredentials {
                token_url,
                client_id,
                client_secret,
            } => {
                let response = self
                    .client
                    .post(token_url)
                    .basic_auth(client_id, Some(client_secret))
                    .form(&[("grant_type", "client_credentials"), ("scope", OAUTH_SCOPE)])
                    .send()
                    .await?;
                let body: Value = check(response, token_url).await?.json().await?;
                let token = body
                    .get("access_token")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HarvestError::Auth {
                        status: 200,
                        body: "token response without access_token".into(),
                    })?;
                Ok(Some(token.to_string()))
            }
            Credentials::Login {
                login_url,
                username,
                password,
            } => {
                let response = self
                    .client
                    .post(login_url)
                    .form(&[("username", username.as_str()), ("password", password.as_str())])
                    .send()
                    .await?;
                check(response, login_url).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        params: Params<'_>,
        body: Option<&Value>,
        streamed: bool,
    ) -> HarvestResult<Response> {
        // ---
        let mut relogged = false;
        loop {
            let token = self.ensure_session().await?;

            let mut builder = self.client.request(method.clone(), url);
            if !params.is_empty() {
                builder = builder.query(params);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }
            builder = match (&self.credentials, token) {
                (_, Some(token)) => builder.bearer_auth(token),
                (Credentials::Bearer(token), None) => builder.bearer_auth(token),
                (Credentials::Basic { username, password }, None) => {
                    builder.basic_auth(username, Some(password))
                }
                (Credentials::ApiKey { header, key }, None) => builder.header(header.as_str(), key.as_str()),
                _ => builder,
            };
            if !streamed {
                if let Some(timeout) = self.request_timeout {
                    builder = builder.timeout(timeout);
                }
            }

            let request = builder.build()?;
            debug!("{} {}", request.method(), request.url());
            log_headers(">>", request.headers());

            let response = self.client.execute(request).await?;
            let status = response.status();
            debug!("{} {} -> {}", method, url, status);
            log_headers("<<", response.headers());

            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED && self.credentials.can_login() && !relogged {
                warn!("401 from {}, logging in again", url);
                *self.state.lock().await = SessionState::Expired;
                relogged = true;
                continue;
            }
            let text = response.text().await.unwrap_or_default();
            return Err(HarvestError::from_status(status.as_u16(), url, &text));
        }
    }
}

async fn check(response: Response, url: &str) -> HarvestResult<Response> {
    // ---
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(HarvestError::from_status(status.as_u16(), url, &text))
}

fn log_headers(direction: &str, headers: &HeaderMap) {
    // ---
    for (name, value) in headers {
        if REDACTED_HEADERS.contains(&name.as_str()) {
            debug!("{} {}: <redacted>", direction, name);
        } else {
            debug!("{} {}: {}", direction, name, value.to_str().unwrap_or("<binary>"));
        }
    }
}

/// Parse a JSON body; an empty body is `null`.
fn parse_body(text: &str) -> HarvestResult<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(text)?)
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get_json(&self, url: &str, params: Params<'_>) -> HarvestResult<Value> {
        let response = self.send(Method::GET, url, params, None, false).await?;
        parse_body(&response.text().await?)
    }

    async fn get_text(&self, url: &str, params: Params<'_>) -> HarvestResult<String> {
        let response = self.send(Method::GET, url, params, None, false).await?;
        Ok(response.text().await?)
    }

    async fn stream_lines(&self, url: &str, params: Params<'_>) -> HarvestResult<LineStream> {
        // ---
        let response = self.send(Method::GET, url, params, None, true).await?;
        let chunks = Box::pin(response.bytes_stream());
        Ok(byte_lines(chunks).boxed())
    }

    async fn post_json(&self, url: &str, body: &Value) -> HarvestResult<Value> {
        let response = self.send(Method::POST, url, &[], Some(body), false).await?;
        parse_body(&response.text().await?)
    }

    async fn patch_json(&self, url: &str, body: &Value) -> HarvestResult<Value> {
        let response = self.send(Method::PATCH, url, &[], Some(body), false).await?;
        parse_body(&response.text().await?)
    }

    async fn delete(&self, url: &str) -> HarvestResult<()> {
        self.send(Method::DELETE, url, &[], None, false).await?;
        Ok(())
    }
}
