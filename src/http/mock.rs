//! Scripted [`HttpClient`] for unit tests.
//!
//! Routes match when the request method agrees and the full request URL
//! (with `?k=v&...` appended) contains the route pattern. Each route replays
//! its queued replies in order and repeats the last one once the queue is
//! drained.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use super::{HttpClient, LineStream, Params};
use crate::error::{HarvestError, HarvestResult};

// ---

#[derive(Debug, Clone)]
pub enum MockReply {
    Json(Value),
    Text(String),
    Status(u16, String),
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

#[derive(Debug)]
struct Route {
    method: Method,
    pattern: String,
    replies: VecDeque<MockReply>,
}

#[derive(Debug, Default)]
struct Inner {
    routes: Vec<Route>,
    requests: Vec<Recorded>,
}

#[derive(Debug, Clone, Default)]
pub struct MockHttpClient {
    inner: Arc<Mutex<Inner>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        MockHttpClient::default()
    }

    pub fn on(&self, method: Method, pattern: &str, reply: MockReply) {
        // ---
        let mut inner = self.inner.lock().unwrap();
        if let Some(route) = inner
            .routes
            .iter_mut()
            .find(|r| r.method == method && r.pattern == pattern)
        {
            route.replies.push_back(reply);
            return;
        }
        inner.routes.push(Route {
            method,
            pattern: pattern.to_string(),
            replies: VecDeque::from([reply]),
        });
    }

    pub fn on_get(&self, pattern: &str, reply: MockReply) {
        self.on(Method::Get, pattern, reply);
    }

    pub fn on_post(&self, pattern: &str, reply: MockReply) {
        self.on(Method::Post, pattern, reply);
    }

    pub fn on_patch(&self, pattern: &str, reply: MockReply) {
        self.on(Method::Patch, pattern, reply);
    }

    pub fn on_delete(&self, pattern: &str, reply: MockReply) {
        self.on(Method::Delete, pattern, reply);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Recorded requests of one method.
    pub fn requests_of(&self, method: Method) -> Vec<Recorded> {
        self.requests().into_iter().filter(|r| r.method == method).collect()
    }

    fn reply(&self, method: Method, url: &str, params: Params<'_>, body: Option<&Value>) -> MockReply {
        // ---
        let full = full_url(url, params);
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(Recorded {
            method,
            url: full.clone(),
            body: body.cloned(),
        });
        let route = inner
            .routes
            .iter_mut()
            .find(|r| r.method == method && full.contains(&r.pattern));
        match route {
            Some(route) if route.replies.len() > 1 => route.replies.pop_front().unwrap(),
            Some(route) => route.replies.front().cloned().unwrap(),
            None => MockReply::Status(404, format!("no mock route for {:?} {}", method, full)),
        }
    }

    fn json(&self, method: Method, url: &str, params: Params<'_>, body: Option<&Value>) -> HarvestResult<Value> {
        match self.reply(method, url, params, body) {
            MockReply::Json(v) => Ok(v),
            MockReply::Text(t) => Ok(serde_json::from_str(&t)?),
            other => Err(into_error(other, url)),
        }
    }

    fn text(&self, url: &str, params: Params<'_>) -> HarvestResult<String> {
        match self.reply(Method::Get, url, params, None) {
            MockReply::Json(v) => Ok(v.to_string()),
            MockReply::Text(t) => Ok(t),
            other => Err(into_error(other, url)),
        }
    }
}

fn full_url(url: &str, params: Params<'_>) -> String {
    // ---
    if params.is_empty() {
        return url.to_string();
    }
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, sep, query.join("&"))
}

fn into_error(reply: MockReply, url: &str) -> HarvestError {
    match reply {
        MockReply::Status(status, body) => HarvestError::from_status(status, url, &body),
        MockReply::Transport(msg) => HarvestError::Transport(msg),
        _ => HarvestError::Decode("unexpected reply".into()),
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get_json(&self, url: &str, params: Params<'_>) -> HarvestResult<Value> {
        self.json(Method::Get, url, params, None)
    }

    async fn get_text(&self, url: &str, params: Params<'_>) -> HarvestResult<String> {
        self.text(url, params)
    }

    async fn stream_lines(&self, url: &str, params: Params<'_>) -> HarvestResult<LineStream> {
        // ---
        let text = self.text(url, params)?;
        let lines: Vec<HarvestResult<String>> = text.lines().map(|l| Ok(l.to_string())).collect();
        Ok(stream::iter(lines).boxed())
    }

    async fn post_json(&self, url: &str, body: &Value) -> HarvestResult<Value> {
        self.json(Method::Post, url, &[], Some(body))
    }

    async fn patch_json(&self, url: &str, body: &Value) -> HarvestResult<Value> {
        self.json(Method::Patch, url, &[], Some(body))
    }

    async fn delete(&self, url: &str) -> HarvestResult<()> {
        self.json(Method::Delete, url, &[], None).map(|_| ())
    }
}
