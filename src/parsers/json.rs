//! JSON helpers that keep the integer/float distinction of measurements.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{HarvestError, HarvestResult};
use crate::models::FieldValue;

// ---

/// Flatten an object into lower-cased dotted keys (`{"a":{"B":1}}` → `a.b`).
/// Arrays are kept whole as JSON text.
pub fn flatten(value: &Value) -> BTreeMap<String, FieldValue> {
    let mut out = BTreeMap::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, FieldValue>) {
    // ---
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.to_lowercase()
                } else {
                    format!("{}.{}", prefix, k.to_lowercase())
                };
                flatten_into(&key, v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), FieldValue::from_json(other));
        }
    }
}

/// String form of a scalar field, `None` when absent or null.
pub fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Required string field.
pub fn require_str(value: &Value, key: &str) -> HarvestResult<String> {
    str_field(value, key).ok_or_else(|| HarvestError::Parse(format!("missing field '{}'", key)))
}

pub fn f64_field(value: &Value, key: &str) -> Option<f64> {
    FieldValue::from_json(value.get(key)?).as_f64()
}

/// Array at `pointer`, empty when absent.
pub fn array_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// One line of newline-delimited JSON. Blank lines yield `None`.
pub fn parse_ndjson_line(line: &str) -> HarvestResult<Option<Value>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}
