//! Per-stream bookmark store.
//!
//! A durable map `stream_key → last successfully emitted timestamp`. The file
//! is read once when the store is opened and rewritten atomically on every
//! commit. A `.json` path holds a JSON object; any other extension holds
//! legacy `key=value` lines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::atomic::write_atomic;
use crate::error::{HarvestError, HarvestResult};
use crate::models::{format_timestamp, parse_timestamp, Timestamp};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkFormat {
    Json,
    KeyValue,
}

impl BookmarkFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => BookmarkFormat::Json,
            _ => BookmarkFormat::KeyValue,
        }
    }
}

#[derive(Debug)]
pub struct BookmarkStore {
    path: PathBuf,
    format: BookmarkFormat,
    entries: Mutex<BTreeMap<String, Timestamp>>,
}

impl BookmarkStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> HarvestResult<Self> {
        // ---
        let path = path.into();
        let format = BookmarkFormat::for_path(&path);
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => decode(&text, format)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} bookmarks from {}", entries.len(), path.display());
        Ok(BookmarkStore {
            path,
            format,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Timestamp> {
        self.lock().get(key).copied()
    }

    /// Bookmark of `key`, or `default` when the stream has none yet.
    pub fn cursor(&self, key: &str, default: Timestamp) -> Timestamp {
        self.get(key).unwrap_or(default)
    }

    /// Advance `key` to `ts` and persist. A timestamp at or before the current
    /// bookmark leaves the store untouched.
    pub fn commit(&self, key: &str, ts: Timestamp) -> HarvestResult<bool> {
        // ---
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|current| *current >= ts) {
            return Ok(false);
        }
        let previous = entries.insert(key.to_string(), ts);
        if let Err(e) = write_atomic(&self.path, encode(&entries, self.format)?.as_bytes()) {
            match previous {
                Some(p) => entries.insert(key.to_string(), p),
                None => entries.remove(key),
            };
            return Err(e.into());
        }
        debug!("Bookmark {} -> {}", key, format_timestamp(&ts));
        Ok(true)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Timestamp> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Timestamp>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn decode(text: &str, format: BookmarkFormat) -> HarvestResult<BTreeMap<String, Timestamp>> {
    // ---
    let pairs: Vec<(String, String)> = match format {
        BookmarkFormat::Json => {
            if text.trim().is_empty() {
                return Ok(BTreeMap::new());
            }
            let raw: BTreeMap<String, String> = serde_json::from_str(text)?;
            raw.into_iter().collect()
        }
        BookmarkFormat::KeyValue => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                l.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .ok_or_else(|| HarvestError::Parse(format!("bad bookmark line '{}'", l)))
            })
            .collect::<HarvestResult<_>>()?,
    };
    pairs
        .into_iter()
        .map(|(k, v)| {
            parse_timestamp(&v)
                .map(|ts| (k.clone(), ts))
                .ok_or_else(|| HarvestError::Parse(format!("bad bookmark for {}: '{}'", k, v)))
        })
        .collect()
}

fn encode(entries: &BTreeMap<String, Timestamp>, format: BookmarkFormat) -> HarvestResult<String> {
    // ---
    match format {
        BookmarkFormat::Json => {
            let raw: BTreeMap<&str, String> = entries
                .iter()
                .map(|(k, v)| (k.as_str(), format_timestamp(v)))
                .collect();
            let mut text = serde_json::to_string_pretty(&raw)?;
            text.push('\n');
            Ok(text)
        }
        BookmarkFormat::KeyValue => Ok(entries
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, format_timestamp(v)))
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use uuid::Uuid;

    fn temp_path(ext: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ufo-bookmarks-{}.{}", Uuid::new_v4(), ext))
    }

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_and_uses_default() {
        // ---
        let store = BookmarkStore::open(temp_path("json")).unwrap();
        let default = ts("2020-01-01T00:00:00Z");
        assert_eq!(store.get("flood"), None);
        assert_eq!(store.cursor("flood", default), default);
    }

    #[test]
    fn test_commit_persists_and_reloads() {
        // ---
        let path = temp_path("json");
        let store = BookmarkStore::open(&path).unwrap();
        assert!(store.commit("sos/SP1", ts("2024-01-01T12:00:00Z")).unwrap());
        let reopened = BookmarkStore::open(&path).unwrap();
        assert_eq!(reopened.get("sos/SP1"), Some(ts("2024-01-01T12:00:00Z")));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"sos/SP1\": \"2024-01-01T12:00:00+00:00\""));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_never_moves_backwards() {
        // ---
        let path = temp_path("txt");
        let store = BookmarkStore::open(&path).unwrap();
        store.commit("k", ts("2024-01-01T12:00:00Z")).unwrap();
        assert!(!store.commit("k", ts("2024-01-01T10:00:00Z")).unwrap());
        assert_eq!(store.get("k"), Some(ts("2024-01-01T12:00:00Z")));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "k=2024-01-01T12:00:00+00:00\n"
        );
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_key_value_format_reads_legacy_lines() {
        // ---
        let entries = decode("# cursor\na=2024-01-01T00:00:00Z\n\nb = 2024-02-01 00:00:00\n", BookmarkFormat::KeyValue).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["b"], ts("2024-02-01T00:00:00Z"));
        assert!(decode("nonsense", BookmarkFormat::KeyValue).is_err());
    }
}
