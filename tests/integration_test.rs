//! End-to-end checks of the reqwest session against an in-process axum server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use ufo_harvester::bookmark::BookmarkStore;
use ufo_harvester::http::{paginate, Credentials, HttpClient, PageRule, ReqwestHttpClient};
use ufo_harvester::portal::{PortalClient, Reading};
use ufo_harvester::{run_source, Config, HarvestError, HarvesterContext, RunOptions, SourceKind};

// ---

#[derive(Default)]
struct Counters {
    logins: AtomicUsize,
    data_calls: AtomicUsize,
    bulk_bodies: Mutex<Vec<Value>>,
}

async fn serve(app: Router) -> String {
    // ---
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(credentials: Credentials) -> Arc<dyn HttpClient> {
    Arc::new(ReqwestHttpClient::new(credentials, Duration::from_secs(5), Some(Duration::from_secs(5))).unwrap())
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn pagination_follows_next_links_until_empty() {
    // ---
    async fn items(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        let page = q.get("page").map(String::as_str).unwrap_or("1");
        Json(match page {
            "1" => json!({"items": [1, 2], "links": {"next": "/items?page=2"}}),
            "2" => json!({"items": [3], "links": {"next": ""}}),
            _ => json!({"items": [99], "links": {"next": "/items?page=4"}}),
        })
    }
    let base = serve(Router::new().route("/items", get(items))).await;

    let pages = paginate(
        client(Credentials::None),
        &format!("{}/items", base),
        vec![("page".into(), "1".into())],
        PageRule::next_link("/items", "/links/next"),
    );
    let all: Vec<Value> = assert_ok!(pages.try_collect().await);
    assert_eq!(all, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn expired_session_logs_in_once_more() {
    // ---
    async fn login(State(c): State<Arc<Counters>>) -> StatusCode {
        c.logins.fetch_add(1, Ordering::SeqCst);
        StatusCode::OK
    }
    async fn data(State(c): State<Arc<Counters>>) -> (StatusCode, Json<Value>) {
        match c.data_calls.fetch_add(1, Ordering::SeqCst) {
            0 => (StatusCode::UNAUTHORIZED, Json(json!({"error": "expired"}))),
            _ => (StatusCode::OK, Json(json!({"ok": true}))),
        }
    }
    let counters = Arc::new(Counters::default());
    let app = Router::new()
        .route("/login", post(login))
        .route("/data", get(data))
        .with_state(counters.clone());
    let base = serve(app).await;

    let session = client(Credentials::Login {
        login_url: format!("{}/login", base),
        username: "ufo".into(),
        password: "secret".into(),
    });
    let body = assert_ok!(session.get_json(&format!("{}/data", base), &[]).await);

    assert_eq!(body["ok"], true);
    assert_eq!(counters.logins.load(Ordering::SeqCst), 2);
    assert_eq!(counters.data_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn status_codes_map_onto_error_classes() {
    // ---
    let app = Router::new()
        .route("/busy", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }))
        .route("/gone", get(|| async { (StatusCode::NOT_FOUND, "no such station") }))
        .route("/denied", get(|| async { (StatusCode::FORBIDDEN, "bad token") }))
        .route("/garbled", get(|| async { "{not json" }));
    let base = serve(app).await;
    let session = client(Credentials::Bearer("token".into()));

    let busy = assert_err!(session.get_json(&format!("{}/busy", base), &[]).await);
    assert!(matches!(busy, HarvestError::Server { status: 503, .. }));
    assert!(busy.is_retryable());

    let gone = assert_err!(session.get_text(&format!("{}/gone", base), &[]).await);
    assert!(matches!(gone, HarvestError::Client { status: 404, ref body, .. } if body == "no such station"));
    assert!(!gone.is_retryable());

    let denied = assert_err!(session.get_json(&format!("{}/denied", base), &[]).await);
    assert!(matches!(denied, HarvestError::Auth { status: 403, .. }));

    let garbled = assert_err!(session.get_json(&format!("{}/garbled", base), &[]).await);
    assert!(matches!(garbled, HarvestError::Decode(_)));
}

#[tokio::test]
async fn connection_refused_is_a_transport_error() {
    // ---
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = assert_err!(client(Credentials::None).get_json(&format!("http://{}/x", addr), &[]).await);
    assert!(matches!(err, HarvestError::Transport(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn body_is_streamed_line_by_line() {
    // ---
    let app = Router::new().route("/lines", get(|| async { "first\r\nsecond\n\nlast" }));
    let base = serve(app).await;

    let lines = assert_ok!(client(Credentials::None).stream_lines(&format!("{}/lines", base), &[]).await);
    let lines: Vec<String> = assert_ok!(lines.try_collect().await);
    assert_eq!(lines, vec!["first", "second", "", "last"]);
}

#[tokio::test]
async fn bulk_upload_is_chunked_and_stops_on_empty_batch() {
    // ---
    async fn bulk(State(c): State<Arc<Counters>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let mut bodies = c.bulk_bodies.lock().unwrap();
        bodies.push(body);
        match bodies.len() {
            1 | 2 => (StatusCode::CREATED, Json(json!({"created": 2}))),
            _ => (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"message": "Empty batch"}))),
        }
    }
    let counters = Arc::new(Counters::default());
    let app = Router::new()
        .route("/readings/bulk", post(bulk))
        .with_state(counters.clone());
    let base = serve(app).await;

    let readings: Vec<Reading> = (0..7)
        .map(|i| Reading {
            sensor_id: 1,
            reading_type_id: 2,
            value: i as f64,
            created: ts("2024-01-01T00:00:00Z") + chrono::Duration::minutes(i),
        })
        .collect();
    let portal = PortalClient::new(client(Credentials::None), base, 2);
    let mut acknowledged = 0;
    let outcome = assert_ok!(
        portal
            .upload_readings(&readings, |batch| {
                acknowledged += batch.len();
                Ok(())
            })
            .await
    );

    assert_eq!(outcome.batches, 2);
    assert_eq!(outcome.uploaded, 4);
    assert!(outcome.ended_empty);
    assert_eq!(acknowledged, 4);
    let bodies = counters.bulk_bodies.lock().unwrap();
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0].as_array().unwrap().len(), 2);
    assert_eq!(bodies[1][0]["created"], "2024-01-01T00:02:00+00:00");
}

#[tokio::test]
async fn ckan_harvest_writes_csv_and_bookmark() {
    // ---
    async fn search(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        Json(match q.get("offset").map(String::as_str) {
            None => json!({"result": {
                "records": [
                    {"_id": 1, "timestamp": "2024-01-01T00:00:00Z", "site_id": "A", "count": 4},
                    {"_id": 2, "timestamp": "2024-01-01T06:00:00Z", "site_id": "A", "count": 5},
                    {"_id": 3, "timestamp": "2024-01-01T06:00:00Z", "site_id": "B", "count": 1}
                ],
                "_links": {"next": "/api/3/action/datastore_search?offset=1000"}
            }}),
            Some(_) => json!({"result": {"records": [], "_links": {"next": ""}}}),
        })
    }
    let base = serve(Router::new().route("/api/3/action/datastore_search", get(search))).await;

    let dir = std::env::temp_dir().join(format!("ufo-it-{}", uuid::Uuid::new_v4()));
    let mut cfg = Config::defaults("ckan");
    cfg.api.base_url = Some(base);
    cfg.source_options.insert("resource_ids".into(), "res-1".into());
    cfg.source_options.insert("columns".into(), "count".into());
    let bookmarks = Arc::new(assert_ok!(BookmarkStore::open(dir.join("bookmarks.json"))));
    let ctx = HarvesterContext::new(Arc::new(cfg), client(Credentials::None), bookmarks);

    let mut opts = RunOptions::new(dir.join("ckan.csv"));
    opts.range = Some((ts("2024-01-01T00:00:00Z"), ts("2024-01-02T00:00:00Z")));
    let summary = assert_ok!(run_source(&ctx, SourceKind::Ckan, &opts).await);

    assert!(summary.success());
    assert_eq!(summary.rows_written, 3);
    assert_eq!(summary.streams[0].bookmark, Some(ts("2024-01-01T06:00:00Z")));
    let csv = std::fs::read_to_string(dir.join("ckan.csv")).unwrap();
    assert_eq!(
        csv,
        "timestamp|sensor|count\n\
         2024-01-01T00:00:00+00:00|A|4.0\n\
         2024-01-01T06:00:00+00:00|A|5.0\n\
         2024-01-01T06:00:00+00:00|B|1.0\n"
    );
    let reopened = assert_ok!(BookmarkStore::open(dir.join("bookmarks.json")));
    assert_eq!(reopened.get("ckan:res-1"), Some(ts("2024-01-01T06:00:00Z")));
}
