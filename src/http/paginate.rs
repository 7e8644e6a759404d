//! Link- and cursor-following pagination.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::{debug, info};

use super::HttpClient;
use crate::error::HarvestResult;

// ---

/// Where a paged JSON response keeps its items and its continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRule {
    /// JSON pointer to the item array (`/result/results`).
    pub items: String,
    /// JSON pointer to the next link or cursor (`/links/next`, `/next_cursor`).
    pub next: String,
    /// When set, the continuation is a cursor sent as this query parameter on
    /// the original URL instead of a full link.
    pub cursor_param: Option<String>,
    /// Safety cap on the number of pages fetched.
    pub max_pages: Option<u32>,
}

impl PageRule {
    pub fn next_link(items: &str, next: &str) -> Self {
        PageRule {
            items: items.to_string(),
            next: next.to_string(),
            cursor_param: None,
            max_pages: None,
        }
    }

    pub fn cursor(items: &str, next: &str, param: &str) -> Self {
        PageRule {
            cursor_param: Some(param.to_string()),
            ..PageRule::next_link(items, next)
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Continuation token of a page; `None` when absent, null or empty.
    pub fn continuation(&self, page: &Value) -> Option<String> {
        // ---
        match page.pointer(&self.next)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

enum Cursor {
    First,
    Next(String),
    End,
}

struct PageState {
    client: Arc<dyn HttpClient>,
    url: String,
    params: Vec<(String, String)>,
    rule: PageRule,
    cursor: Cursor,
    pages: u32,
}

/// Lazy sequence of items across every page.
///
/// Ends cleanly when the continuation is absent or empty, when a page holds no
/// items, or when the page cap is reached. Relative next links are resolved
/// against the page URL.
pub fn paginate(
    client: Arc<dyn HttpClient>,
    url: &str,
    params: Vec<(String, String)>,
    rule: PageRule,
) -> BoxStream<'static, HarvestResult<Value>> {
    // ---
    let state = PageState {
        client,
        url: url.to_string(),
        params,
        rule,
        cursor: Cursor::First,
        pages: 0,
    };

    stream::try_unfold(state, next_page).try_flatten().boxed()
}

type PageItems = stream::Iter<std::vec::IntoIter<HarvestResult<Value>>>;

async fn next_page(mut st: PageState) -> HarvestResult<Option<(PageItems, PageState)>> {
    // ---
    let (url, params) = match std::mem::replace(&mut st.cursor, Cursor::End) {
        Cursor::End => return Ok(None),
        Cursor::First => (st.url.clone(), st.params.clone()),
        Cursor::Next(next) => match &st.rule.cursor_param {
            Some(param) => {
                let mut params = st.params.clone();
                params.push((param.clone(), next));
                (st.url.clone(), params)
            }
            None => (next, Vec::new()),
        },
    };
    if let Some(max) = st.rule.max_pages {
        if st.pages >= max {
            debug!("Hit page limit of {}, stopping pagination", max);
            return Ok(None);
        }
    }
    st.pages += 1;
    debug!("Fetching page {} from: {}", st.pages, url);

    let borrowed: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let page = st.client.get_json(&url, &borrowed).await?;

    let items: Vec<HarvestResult<Value>> = page
        .pointer(&st.rule.items)
        .and_then(Value::as_array)
        .map(|items| items.iter().cloned().map(Ok).collect())
        .unwrap_or_default();
    debug!("Page {} found {} items", st.pages, items.len());

    st.cursor = match st.rule.continuation(&page) {
        Some(_) if items.is_empty() => {
            info!("Page {} was empty, stopping pagination", st.pages);
            Cursor::End
        }
        Some(next) if st.rule.cursor_param.is_some() => Cursor::Next(next),
        Some(next) => Cursor::Next(resolve(&url, &next)),
        None => {
            info!("No more pages after page {}", st.pages);
            Cursor::End
        }
    };
    Ok(Some((stream::iter(items), st)))
}

/// Resolve a possibly relative next link against the page it came from.
fn resolve(current: &str, next: &str) -> String {
    reqwest::Url::parse(current)
        .and_then(|base| base.join(next))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| next.to_string())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::http::mock::{MockHttpClient, MockReply};
    use serde_json::json;

    #[tokio::test]
    async fn test_follows_next_links_until_empty() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get(
            "https://ckan/api?rows=2",
            MockReply::Json(json!({"result": {"results": [1, 2]}, "next": "https://ckan/api?page=2"})),
        );
        mock.on_get(
            "https://ckan/api?page=2",
            MockReply::Json(json!({"result": {"results": [3]}, "next": ""})),
        );
        let client: Arc<dyn HttpClient> = Arc::new(mock.clone());
        let items: Vec<Value> = paginate(
            client,
            "https://ckan/api",
            vec![("rows".into(), "2".into())],
            PageRule::next_link("/result/results", "/next"),
        )
        .try_collect()
        .await
        .unwrap();
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_mode_and_page_cap() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get(
            "https://api/readings?cursor=c1",
            MockReply::Json(json!({"results": ["b"], "next_cursor": "c2"})),
        );
        mock.on_get(
            "https://api/readings",
            MockReply::Json(json!({"results": ["a"], "next_cursor": "c1"})),
        );
        let client: Arc<dyn HttpClient> = Arc::new(mock.clone());
        let items: Vec<Value> = paginate(
            client,
            "https://api/readings",
            Vec::new(),
            PageRule::cursor("/results", "/next_cursor", "cursor").with_max_pages(2),
        )
        .try_collect()
        .await
        .unwrap();
        assert_eq!(items, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_relative_links_and_empty_page_end() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get(
            "offset=100",
            MockReply::Json(json!({"result": {"records": [], "_links": {"next": "/api/3/action/datastore_search?offset=200"}}})),
        );
        mock.on_get(
            "https://ckan.test/api/3/action/datastore_search?resource_id=r",
            MockReply::Json(json!({"result": {"records": [{"a": 1}], "_links": {"next": "/api/3/action/datastore_search?offset=100"}}})),
        );
        let client: Arc<dyn HttpClient> = Arc::new(mock.clone());
        let items: Vec<Value> = paginate(
            client,
            "https://ckan.test/api/3/action/datastore_search",
            vec![("resource_id".into(), "r".into())],
            PageRule::next_link("/result/records", "/result/_links/next"),
        )
        .try_collect()
        .await
        .unwrap();
        assert_eq!(items.len(), 1);
        let urls: Vec<String> = mock.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(urls[1], "https://ckan.test/api/3/action/datastore_search?offset=100");
    }

    #[tokio::test]
    async fn test_error_page_surfaces() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("https://api/x", MockReply::Status(502, "bad gateway".into()));
        let client: Arc<dyn HttpClient> = Arc::new(mock);
        let out: HarvestResult<Vec<Value>> =
            paginate(client, "https://api/x", Vec::new(), PageRule::next_link("/items", "/next"))
                .try_collect()
                .await;
        assert!(out.unwrap_err().is_retryable());
    }
}
