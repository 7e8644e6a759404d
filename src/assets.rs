//! Asset descriptors for sites and sensors.
//!
//! ```text
//! begin.asset
//! id=S0001
//! altitude=
//! detector=name:NO2|unit:ug/m3|epsilon:0.01
//! end.asset
//!
//! ```
//!
//! Keys keep their emission order, absent values are written as `key=`, and
//! the block ends with one blank line. Line breaks and backslashes inside
//! values are escaped (`\n`, `\r`, `\\`); map entries also escape `|` and `:`.
//! Files land in `<root>/<class-plural>/<id>.txt` and are replaced atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::atomic::write_atomic;
use crate::error::{HarvestError, HarvestResult};
use crate::models::{format_value, Detector, Sensor, Site};

// ---

const BEGIN: &str = "begin.asset";
const END: &str = "end.asset";

/// An ordered list of `key=value` lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Descriptor {
    lines: Vec<(String, String)>,
}

impl Descriptor {
    pub fn new() -> Self {
        Descriptor::default()
    }

    pub fn push(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.lines.push((key.to_string(), value.into()));
        self
    }

    pub fn push_opt(&mut self, key: &str, value: Option<impl Into<String>>) -> &mut Self {
        self.push(key, value.map(Into::into).unwrap_or_default())
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Every value of a multi-valued key.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.lines.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }

    pub fn serialize(&self) -> String {
        // ---
        let mut out = String::with_capacity(32 + self.lines.len() * 24);
        out.push_str(BEGIN);
        out.push('\n');
        for (k, v) in &self.lines {
            out.push_str(k);
            out.push('=');
            for c in v.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    c => out.push(c),
                }
            }
            out.push('\n');
        }
        out.push_str(END);
        out.push_str("\n\n");
        out
    }

    /// Parse a single descriptor block. Input accepted here re-serializes to
    /// the same bytes.
    pub fn parse(text: &str) -> HarvestResult<Descriptor> {
        // ---
        let body = text
            .strip_prefix("begin.asset\n")
            .and_then(|rest| rest.strip_suffix("end.asset\n\n"))
            .ok_or_else(|| HarvestError::Parse("descriptor must be wrapped in begin.asset/end.asset".into()))?;
        let mut descriptor = Descriptor::new();
        if body.is_empty() {
            return Ok(descriptor);
        }
        let body = body
            .strip_suffix('\n')
            .ok_or_else(|| HarvestError::Parse("descriptor body must end with a newline".into()))?;
        for line in body.split('\n') {
            let (k, v) = line
                .split_once('=')
                .ok_or_else(|| HarvestError::Parse(format!("descriptor line without '=': '{}'", line)))?;
            if k.is_empty() {
                return Err(HarvestError::Parse(format!("descriptor line without key: '{}'", line)));
            }
            descriptor.push(k, unescape_value(v)?);
        }
        Ok(descriptor)
    }
}

fn unescape_value(text: &str) -> HarvestResult<String> {
    // ---
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(HarvestError::Parse(format!(
                    "bad escape '\\{}' in descriptor value '{}'",
                    other.map(String::from).unwrap_or_default(),
                    text
                )))
            }
        }
    }
    Ok(out)
}

fn escape_map_part(text: &str, out: &mut String) {
    for c in text.chars() {
        if matches!(c, '\\' | '|' | ':') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// `k1:v1|k2:v2`, with `\\`, `|` and `:` escaped by a backslash.
pub fn encode_map<'a>(pairs: impl IntoIterator<Item = (&'a str, String)>) -> String {
    // ---
    let mut out = String::new();
    for (i, (k, v)) in pairs.into_iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        escape_map_part(k, &mut out);
        out.push(':');
        escape_map_part(&v, &mut out);
    }
    out
}

/// Inverse of [`encode_map`]. Entries without a `:` are skipped.
pub fn decode_map(text: &str) -> BTreeMap<String, String> {
    // ---
    let mut map = BTreeMap::new();
    let (mut key, mut value) = (String::new(), String::new());
    let mut in_value = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        let target = if in_value { &mut value } else { &mut key };
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    target.push(escaped);
                }
            }
            ':' if !in_value => in_value = true,
            '|' => {
                if in_value {
                    map.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                }
                key.clear();
                in_value = false;
            }
            c => target.push(c),
        }
    }
    if in_value {
        map.insert(key, value);
    }
    map
}

/// Something that can be written as an asset descriptor.
pub trait Asset {
    /// Directory name under the assets root (`sites`, `sensors`).
    fn class_plural(&self) -> &'static str;

    fn asset_id(&self) -> &str;

    fn descriptor(&self) -> Descriptor;
}

impl Asset for Site {
    fn class_plural(&self) -> &'static str {
        "sites"
    }

    fn asset_id(&self) -> &str {
        &self.id
    }

    fn descriptor(&self) -> Descriptor {
        // ---
        let mut d = Descriptor::new();
        d.push("id", self.id.as_str())
            .push("latitude", format_value(self.latitude))
            .push("longitude", format_value(self.longitude))
            .push_opt("altitude", self.altitude.map(format_value))
            .push_opt("address", self.address.clone())
            .push_opt("city", self.city.clone())
            .push_opt("country", self.country.clone())
            .push_opt("postcode", self.postcode.clone())
            .push_opt("firstdate", self.first_date.map(|d| d.format("%Y-%m-%d").to_string()))
            .push("operator", encode_map(self.operator.iter().map(|(k, v)| (k.as_str(), v.clone()))))
            .push_opt("desc-url", self.desc_url.clone());
        d
    }
}

fn detector_line(detector: &Detector) -> String {
    encode_map([
        ("name", detector.name.clone()),
        ("unit", detector.unit.clone()),
        ("epsilon", format_value(detector.epsilon)),
    ])
}

impl Asset for Sensor {
    fn class_plural(&self) -> &'static str {
        "sensors"
    }

    fn asset_id(&self) -> &str {
        &self.id
    }

    fn descriptor(&self) -> Descriptor {
        // ---
        let mut d = Descriptor::new();
        d.push("id", self.id.as_str())
            .push("family", self.family.as_str())
            .push("provider", encode_map(self.provider.iter().map(|(k, v)| (k.as_str(), v.clone()))))
            .push_opt("serialnumber", self.serial_number.clone())
            .push_opt("firstdate", self.first_date.map(|d| d.format("%Y-%m-%d").to_string()))
            .push_opt("desc-url", self.desc_url.clone())
            .push_opt("site", self.site_id.clone());
        for detector in &self.detectors {
            d.push("detector", detector_line(detector));
        }
        d
    }
}

/// Writes descriptors under a root directory.
#[derive(Debug, Clone)]
pub struct AssetWriter {
    root: PathBuf,
}

impl AssetWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        AssetWriter { root: root.into() }
    }

    pub fn path_for(&self, asset: &dyn Asset) -> PathBuf {
        // ---
        let file: String = asset
            .asset_id()
            .chars()
            .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
            .collect();
        self.root.join(asset.class_plural()).join(format!("{}.txt", file))
    }

    pub fn write(&self, asset: &dyn Asset) -> HarvestResult<PathBuf> {
        // ---
        let path = self.path_for(asset);
        write_atomic(&path, asset.descriptor().serialize().as_bytes())?;
        debug!("Wrote asset {}", path.display());
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
