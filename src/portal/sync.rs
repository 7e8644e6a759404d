//! Upsert-by-name and bulk upload against the Awesome portal.
//!
//! Each collection is listed once per run and indexed by upper-cased name.
//! A local object that matches a remote one is PATCHed with the fields that
//! differ; an unknown one is POSTed. Ids returned by the portal are kept in a
//! name→id map so later objects can reference them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::objects::{
    AqiReading, Location, NamedObject, PortalObject, Reading, ReadingType, Sensor, SensorType,
};
use crate::config::Config;
use crate::error::{HarvestError, HarvestResult};
use crate::http::{join_url, HttpClient};
use crate::models;

// ---

pub const BULK_READINGS_PATH: &str = "readings/bulk";
pub const BULK_DELETE_READINGS_PATH: &str = "readings/bulk/delete";
pub const BULK_AQI_READINGS_PATH: &str = "aqi-readings/bulk";

/// Most pages followed when listing a collection.
const MAX_LIST_PAGES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(i64),
    Updated(i64),
    UpToDate(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Updated(id) | UpsertOutcome::UpToDate(id) => *id,
        }
    }
}

/// Result of a bulk upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub batches: usize,
    pub uploaded: usize,
    /// The portal reported an empty batch and the upload stopped there.
    pub ended_empty: bool,
}

pub struct PortalClient {
    client: Arc<dyn HttpClient>,
    base_url: String,
    chunk_size: usize,
    /// edge → NAME → last known remote object.
    remote: HashMap<&'static str, HashMap<String, Value>>,
}

impl PortalClient {
    pub fn new(client: Arc<dyn HttpClient>, base_url: impl Into<String>, chunk_size: usize) -> Self {
        PortalClient {
            client,
            base_url: base_url.into(),
            chunk_size: chunk_size.max(1),
            remote: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &Config, client: Arc<dyn HttpClient>) -> HarvestResult<Self> {
        // ---
        let base_url = cfg
            .portal
            .base_url
            .clone()
            .ok_or_else(|| HarvestError::Config("[portal] base_url must be set".into()))?;
        Ok(PortalClient::new(client, base_url, cfg.portal.bulk_readings_chunk_size))
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Every remote object of a collection, following `links.next` when the
    /// portal pages its answer.
    pub async fn list(&self, edge: &str) -> HarvestResult<Vec<Value>> {
        // ---
        let mut items = Vec::new();
        let mut next = Some(self.url(edge));
        let mut pages = 0;
        while let Some(url) = next.take() {
            pages += 1;
            let page = self.client.get_json(&url, &[]).await?;
            match page {
                Value::Array(list) => items.extend(list),
                Value::Object(ref obj) => {
                    if let Some(Value::Array(list)) = obj.get("data") {
                        items.extend(list.iter().cloned());
                    }
                    next = page
                        .pointer("/links/next")
                        .and_then(Value::as_str)
                        .filter(|s| !s.trim().is_empty())
                        .map(String::from);
                }
                _ => return Err(HarvestError::Decode(format!("unexpected listing for {}", edge))),
            }
            if pages >= MAX_LIST_PAGES {
                warn!("Stopped listing {} after {} pages", edge, pages);
                break;
            }
        }
        debug!("Listed {} {}", items.len(), edge);
        Ok(items)
    }

    async fn index(&mut self, edge: &'static str) -> HarvestResult<&mut HashMap<String, Value>> {
        // ---
        if !self.remote.contains_key(edge) {
            let listed: HashMap<String, Value> = self
                .list(edge)
                .await?
                .into_iter()
                .filter_map(|obj| {
                    let name = obj.get("name").and_then(Value::as_str)?.to_uppercase();
                    Some((name, obj))
                })
                .collect();
            info!("Indexed {} remote {}", listed.len(), edge);
            self.remote.insert(edge, listed);
        }
        Ok(self.remote.entry(edge).or_default())
    }

    /// Id of a named object seen or created during this run.
    pub fn id_of(&self, edge: &str, name: &str) -> Option<i64> {
        self.remote
            .get(edge)?
            .get(&name.to_uppercase())
            .and_then(object_id)
    }

    /// Id of a named remote object, listing the collection on first use.
    pub async fn lookup(&mut self, edge: &'static str, name: &str) -> HarvestResult<Option<i64>> {
        // ---
        let key = name.to_uppercase();
        Ok(self.index(edge).await?.get(&key).and_then(object_id))
    }

    /// Create or update `object` by name.
    pub async fn upsert<T>(&mut self, object: &T) -> HarvestResult<UpsertOutcome>
    where
        T: NamedObject + Sync + ?Sized,
    {
        // ---
        let edge = object.edge();
        let key = object.name().to_uppercase();
        let local = object.to_json();
        let existing = self.index(edge).await?.get(&key).cloned();

        let outcome = match existing {
            Some(remote) => {
                let id = object_id(&remote)
                    .ok_or_else(|| HarvestError::Decode(format!("{} '{}' has no id", edge, key)))?;
                let changes = diff(&local, &remote);
                if changes.is_empty() {
                    debug!("{} '{}' up to date", edge, key);
                    UpsertOutcome::UpToDate(id)
                } else {
                    let body = Value::Object(changes);
                    let url = self.url(&format!("{}/{}", edge, id));
                    let echo = self.client.patch_json(&url, &body).await?;
                    info!("Updated {} '{}' ({})", edge, key, id);
                    self.remember(edge, &key, merge(remote, &body, &echo));
                    UpsertOutcome::Updated(id)
                }
            }
            None => {
                let echo = self.client.post_json(&self.url(edge), &local).await?;
                let created = unwrap_data(echo);
                let id = object_id(&created)
                    .ok_or_else(|| HarvestError::Decode(format!("create {} '{}' returned no id", edge, key)))?;
                info!("Created {} '{}' ({})", edge, key, id);
                self.remember(edge, &key, merge(Value::Object(Map::new()), &local, &created));
                UpsertOutcome::Created(id)
            }
        };
        Ok(outcome)
    }

    fn remember(&mut self, edge: &'static str, key: &str, object: Value) {
        self.remote.entry(edge).or_default().insert(key.to_string(), object);
    }

    pub async fn delete(&mut self, edge: &'static str, id: i64) -> HarvestResult<()> {
        // ---
        self.client.delete(&self.url(&format!("{}/{}", edge, id))).await?;
        if let Some(index) = self.remote.get_mut(edge) {
            index.retain(|_, obj| object_id(obj) != Some(id));
        }
        info!("Deleted {} {}", edge, id);
        Ok(())
    }

    /// Upsert a site as a location.
    pub async fn sync_site(&mut self, site: &models::Site) -> HarvestResult<UpsertOutcome> {
        self.upsert(&Location::from(site)).await
    }

    /// Upsert a sensor, its type and its location link.
    pub async fn sync_sensor(&mut self, sensor: &models::Sensor) -> HarvestResult<UpsertOutcome> {
        // ---
        let sensor_type_id = if sensor.family.is_empty() {
            None
        } else {
            let sensor_type = SensorType {
                name: sensor.family.clone(),
                description: None,
                sensor_category_id: None,
            };
            Some(self.upsert(&sensor_type).await?.id())
        };
        let location_id = sensor
            .site_id
            .as_deref()
            .and_then(|site| self.id_of(Location::EDGE, site));
        let portal_sensor = Sensor {
            name: sensor.id.clone(),
            active: true,
            location_id,
            sensor_type_id,
        };
        self.upsert(&portal_sensor).await
    }

    /// Map normalized readings onto portal ids. Readings whose sensor or type
    /// is unknown to the portal are skipped.
    pub async fn portal_readings(&mut self, readings: &[models::Reading]) -> HarvestResult<Vec<Reading>> {
        // ---
        self.index(Sensor::EDGE).await?;
        self.index(ReadingType::EDGE).await?;
        let mut skipped = 0;
        let out: Vec<Reading> = readings
            .iter()
            .filter_map(|r| {
                let value = r.value?;
                let mapped = self
                    .id_of(Sensor::EDGE, &r.sensor_id)
                    .zip(self.id_of(ReadingType::EDGE, &r.observed_property))
                    .map(|(sensor_id, reading_type_id)| Reading {
                        sensor_id,
                        reading_type_id,
                        value,
                        created: r.timestamp,
                    });
                if mapped.is_none() {
                    skipped += 1;
                }
                mapped
            })
            .collect();
        if skipped > 0 {
            warn!("Skipped {} readings without a portal sensor or reading type", skipped);
        }
        Ok(out)
    }

    /// POST `items` to a bulk endpoint in chunks. `on_batch` runs after each
    /// acknowledged chunk and may persist progress. An empty-batch answer
    /// ends the upload cleanly.
    pub async fn upload_bulk<T, F>(&self, path: &str, items: &[T], mut on_batch: F) -> HarvestResult<BulkOutcome>
    where
        T: PortalObject + Sync,
        F: FnMut(&[T]) -> HarvestResult<()> + Send,
    {
        // ---
        let url = self.url(path);
        let mut outcome = BulkOutcome::default();
        for batch in items.chunks(self.chunk_size) {
            let body = Value::Array(batch.iter().map(PortalObject::to_json).collect());
            match self.client.post_json(&url, &body).await.map_err(empty_batch) {
                Ok(_) => {
                    outcome.batches += 1;
                    outcome.uploaded += batch.len();
                    on_batch(batch)?;
                    debug!("Uploaded batch {} ({} items) to {}", outcome.batches, batch.len(), path);
                }
                Err(HarvestError::EmptyBatch(reason)) => {
                    info!("Portal reported an empty batch, stopping upload: {}", reason);
                    outcome.ended_empty = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        info!("Uploaded {} items in {} batches to {}", outcome.uploaded, outcome.batches, path);
        Ok(outcome)
    }

    pub async fn upload_readings<F>(&self, readings: &[Reading], on_batch: F) -> HarvestResult<BulkOutcome>
    where
        F: FnMut(&[Reading]) -> HarvestResult<()> + Send,
    {
        self.upload_bulk(BULK_READINGS_PATH, readings, on_batch).await
    }

    pub async fn upload_aqi_readings(&self, readings: &[AqiReading]) -> HarvestResult<BulkOutcome> {
        self.upload_bulk(BULK_AQI_READINGS_PATH, readings, |_| Ok(())).await
    }

    /// Delete readings of `sensor_ids` in `[from, to]`.
    pub async fn delete_readings(
        &self,
        sensor_ids: &[i64],
        from: models::Timestamp,
        to: models::Timestamp,
    ) -> HarvestResult<Value> {
        // ---
        let body = serde_json::json!({
            "sensor_ids": sensor_ids,
            "from": models::format_timestamp(&from),
            "to": models::format_timestamp(&to),
        });
        let echo = self.client.post_json(&self.url(BULK_DELETE_READINGS_PATH), &body).await?;
        info!("Deleted readings of {} sensors between {} and {}", sensor_ids.len(), from, to);
        Ok(echo)
    }
}

impl From<&models::Site> for Location {
    fn from(site: &models::Site) -> Self {
        Location {
            name: site.id.clone(),
            lat: site.latitude,
            lon: site.longitude,
            elevation: site.altitude,
        }
    }
}

/// Turn a 400/422 whose body mentions "empty" into [`HarvestError::EmptyBatch`].
fn empty_batch(e: HarvestError) -> HarvestError {
    match e {
        HarvestError::Client { status: 400 | 422, ref body, .. } if body.to_lowercase().contains("empty") => {
            HarvestError::EmptyBatch(body.clone())
        }
        other => other,
    }
}

/// `{"data": {...}}` envelopes carry the object one level down.
fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut obj) if obj.get("data").is_some_and(Value::is_object) => {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn object_id(obj: &Value) -> Option<i64> {
    match obj.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Local fields whose value differs from the remote object. Unknown (null)
/// local fields never overwrite what the portal holds.
fn diff(local: &Value, remote: &Value) -> Map<String, Value> {
    // ---
    let mut changes = Map::new();
    let Some(fields) = local.as_object() else {
        return changes;
    };
    for (key, value) in fields {
        if value.is_null() {
            continue;
        }
        let theirs = remote.get(key).unwrap_or(&Value::Null);
        if !same(value, theirs) {
            changes.insert(key.clone(), value.clone());
        }
    }
    changes
}

fn same(a: &Value, b: &Value) -> bool {
    // ---
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(x), Value::String(y)) | (Value::String(y), Value::Number(x)) => {
            y.parse::<f64>().ok() == x.as_f64()
        }
        _ => a == b,
    }
}

/// Remote object after a write: the old object, the fields sent, then the echo.
fn merge(base: Value, sent: &Value, echo: &Value) -> Value {
    // ---
    let mut merged = match base {
        Value::Object(obj) => obj,
        _ => Map::new(),
    };
    for source in [sent, &unwrap_data(echo.clone())] {
        if let Some(obj) = source.as_object() {
            for (k, v) in obj {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::http::mock::{Method, MockHttpClient, MockReply};
    use crate::models::parse_timestamp;
    use serde_json::json;
    use std::sync::Mutex;

    const BASE: &str = "https://portal.test/api";

    fn location() -> Location {
        Location {
            name: "S0001".into(),
            lat: 53.38,
            lon: -1.47,
            elevation: Some(100.0),
        }
    }

    fn portal(mock: &MockHttpClient, chunk: usize) -> PortalClient {
        PortalClient::new(Arc::new(mock.clone()), BASE, chunk)
    }

    #[tokio::test]
    async fn test_upsert_creates_then_matches() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("/api/locations", MockReply::Json(json!([])));
        mock.on_post(
            "/api/locations",
            MockReply::Json(json!({"id": 42, "name": "S0001", "lat": 53.38, "lon": -1.47, "elevation": 100})),
        );
        let mut first = portal(&mock, 100);
        assert_eq!(first.upsert(&location()).await.unwrap(), UpsertOutcome::Created(42));
        assert_eq!(first.id_of("locations", "s0001"), Some(42));
        assert_eq!(mock.requests_of(Method::Post).len(), 1);

        // A second run sees the server echo and issues neither POST nor PATCH.
        let mock = MockHttpClient::new();
        mock.on_get(
            "/api/locations",
            MockReply::Json(json!({"data": [{"id": 42, "name": "S0001", "lat": "53.38", "lon": -1.47, "elevation": 100}]})),
        );
        let mut second = portal(&mock, 100);
        assert_eq!(second.upsert(&location()).await.unwrap(), UpsertOutcome::UpToDate(42));
        assert!(mock.requests_of(Method::Post).is_empty());
        assert!(mock.requests_of(Method::Patch).is_empty());
        assert_eq!(second.id_of("locations", "S0001"), Some(42));
    }

    #[tokio::test]
    async fn test_upsert_patches_changed_fields_only() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get(
            "/api/locations",
            MockReply::Json(json!([{"id": 7, "name": "S0001", "lat": 53.38, "lon": -1.47, "elevation": 90}])),
        );
        mock.on_patch("/api/locations/7", MockReply::Json(json!({"id": 7})));
        let mut client = portal(&mock, 100);
        assert_eq!(client.upsert(&location()).await.unwrap(), UpsertOutcome::Updated(7));
        let patches = mock.requests_of(Method::Patch);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].body, Some(json!({"elevation": 100.0})));
        // The collection is listed once per run.
        client.upsert(&location()).await.unwrap();
        assert_eq!(mock.requests_of(Method::Get).len(), 1);
        assert_eq!(mock.requests_of(Method::Patch).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_local_field_keeps_remote_value() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get(
            "/api/locations",
            MockReply::Json(json!([{"id": 7, "name": "S0001", "lat": 53.38, "lon": -1.47, "elevation": 100}])),
        );
        mock.on_patch("/api/locations/7", MockReply::Json(json!({"id": 7})));
        let mut client = portal(&mock, 100);
        let unknown = Location {
            elevation: None,
            ..location()
        };
        assert_eq!(client.upsert(&unknown).await.unwrap(), UpsertOutcome::UpToDate(7));
        assert!(mock.requests_of(Method::Patch).is_empty());
    }

    #[tokio::test]
    async fn test_delete_drops_cached_id() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("/api/locations", MockReply::Json(json!([{"id": 7, "name": "S0001"}])));
        mock.on_delete("/api/locations/7", MockReply::Json(json!({})));
        let mut client = portal(&mock, 100);
        client.index(Location::EDGE).await.unwrap();
        client.delete(Location::EDGE, 7).await.unwrap();
        let deletes = mock.requests_of(Method::Delete);
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].url.ends_with("/api/locations/7"));
        assert_eq!(client.id_of("locations", "S0001"), None);
    }

    fn readings(n: usize) -> Vec<Reading> {
        (0..n)
            .map(|i| Reading {
                sensor_id: 1,
                reading_type_id: 2,
                value: i as f64,
                created: parse_timestamp("2024-01-01T00:00:00Z").unwrap() + chrono::Duration::minutes(i as i64),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_bulk_upload_chunks_and_reports_batches() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_post("/api/readings/bulk", MockReply::Json(json!({"created": true})));
        let client = portal(&mock, 2);
        let seen = Mutex::new(Vec::new());
        let outcome = client
            .upload_readings(&readings(5), |batch| {
                seen.lock().unwrap().push(batch.len());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(outcome, BulkOutcome { batches: 3, uploaded: 5, ended_empty: false });
        assert_eq!(*seen.lock().unwrap(), vec![2, 2, 1]);
        let posts = mock.requests_of(Method::Post);
        assert_eq!(posts[0].body.as_ref().unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_ends_upload_cleanly() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_post("/api/readings/bulk", MockReply::Json(json!({})));
        mock.on_post("/api/readings/bulk", MockReply::Status(422, "Empty batch: nothing to store".into()));
        let client = portal(&mock, 2);
        let mut committed = 0;
        let outcome = client
            .upload_readings(&readings(6), |_| {
                committed += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert!(outcome.ended_empty);
        assert_eq!(outcome.batches, 1);
        assert_eq!(committed, 1);
    }

    #[tokio::test]
    async fn test_other_bulk_errors_abort() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_post("/api/readings/bulk", MockReply::Status(422, "value must be numeric".into()));
        let client = portal(&mock, 2);
        let err = client.upload_readings(&readings(2), |_| Ok(())).await.unwrap_err();
        assert_eq!(err.status(), Some(422));
    }

    #[tokio::test]
    async fn test_sensor_links_location_and_type() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("/api/locations", MockReply::Json(json!([{"id": 5, "name": "SITE1"}])));
        mock.on_get("/api/sensor-types", MockReply::Json(json!([])));
        mock.on_post("/api/sensor-types", MockReply::Json(json!({"data": {"id": 9, "name": "AQMesh"}})));
        mock.on_get("/api/sensors", MockReply::Json(json!([])));
        mock.on_post("/api/sensors", MockReply::Json(json!({"id": 11})));
        let mut client = portal(&mock, 100);
        client.index(Location::EDGE).await.unwrap();
        let sensor = models::Sensor {
            id: "AQ1".into(),
            family: "AQMesh".into(),
            site_id: Some("site1".into()),
            ..models::Sensor::default()
        };
        assert_eq!(client.sync_sensor(&sensor).await.unwrap(), UpsertOutcome::Created(11));
        let posts = mock.requests_of(Method::Post);
        let body = posts.last().unwrap().body.clone().unwrap();
        assert_eq!(body["location_id"], 5);
        assert_eq!(body["sensor_type_id"], 9);
    }

    #[tokio::test]
    async fn test_bulk_delete_body() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_post("/api/readings/bulk/delete", MockReply::Json(json!({"deleted": 3})));
        let client = portal(&mock, 100);
        let from = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let to = parse_timestamp("2024-01-02T00:00:00Z").unwrap();
        client.delete_readings(&[1, 2], from, to).await.unwrap();
        let body = mock.requests_of(Method::Post)[0].body.clone().unwrap();
        assert_eq!(body["sensor_ids"], json!([1, 2]));
        assert_eq!(body["to"], "2024-01-02T00:00:00+00:00");
    }
}
