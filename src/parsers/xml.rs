//! Namespace-aware XML tree with `find`/`findall` queries.
//!
//! Documents are small enough (one SOS response, one Atom feed) to be held as
//! a tree. Names are resolved to `(namespace URI, local name)` while reading,
//! so queries written with the prefixes of [`NAMESPACES`] match whatever
//! prefixes the server chose.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{HarvestError, HarvestResult};
use crate::models::{parse_timestamp, Timestamp};

// ---

pub const NS_ATOM: &str = "http://www.w3.org/2005/Atom";
pub const NS_OM: &str = "http://www.opengis.net/om/2.0";
pub const NS_SWE: &str = "http://www.opengis.net/swe/2.0";
pub const NS_GML: &str = "http://www.opengis.net/gml/3.2";
pub const NS_XLINK: &str = "http://www.w3.org/1999/xlink";
pub const NS_OWS: &str = "http://www.opengis.net/ows/1.1";

/// Prefixes usable in query paths.
pub const NAMESPACES: [(&str, &str); 13] = [
    ("atom", NS_ATOM),
    ("om", NS_OM),
    ("swe", NS_SWE),
    ("gml", NS_GML),
    ("xlink", NS_XLINK),
    ("ows", NS_OWS),
    ("ef", "http://inspire.ec.europa.eu/schemas/ef/3.0"),
    ("base", "http://inspire.ec.europa.eu/schemas/base/3.3"),
    ("aqd", "http://dd.eionet.europa.eu/schemaset/id2011850eu-1.0"),
    ("sam", "http://www.opengis.net/sampling/2.0"),
    ("sams", "http://www.opengis.net/samplingSpatial/2.0"),
    ("georss", "http://www.georss.org/georss"),
    ("inspire_dls", "http://inspire.ec.europa.eu/schemas/inspire_dls/1.0"),
];

fn namespace_uri(prefix: &str) -> Option<&'static str> {
    NAMESPACES.iter().find(|(p, _)| *p == prefix).map(|(_, uri)| *uri)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub ns: Option<String>,
    pub local: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub ns: Option<String>,
    pub local: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Element>,
    text: String,
}

/// One step of a query path.
#[derive(Debug, Clone, PartialEq)]
struct Step {
    ns: Option<&'static str>,
    local: String,
    /// `//` before the step: match at any depth.
    descendant: bool,
}

impl Element {
    /// Trimmed text content directly inside this element.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    pub fn is(&self, prefix: &str, local: &str) -> bool {
        self.local == local && self.ns.as_deref() == namespace_uri(prefix)
    }

    /// Attribute by prefixed (`xlink:href`) or plain (`blockSeparator`) name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        // ---
        let (ns, local) = match name.split_once(':') {
            Some((prefix, local)) => (namespace_uri(prefix), local),
            None => (None, name),
        };
        self.attributes
            .iter()
            .find(|a| a.local == local && a.ns.as_deref() == ns)
            .map(|a| a.value.as_str())
    }

    /// First element matching `path` (`om:result/swe:DataArray`, `.//om:OM_Observation`).
    pub fn find(&self, path: &str) -> Option<&Element> {
        self.findall(path).into_iter().next()
    }

    /// Text of the first match.
    pub fn find_text(&self, path: &str) -> Option<&str> {
        self.find(path).map(Element::text)
    }

    /// Every element matching `path`, in document order.
    pub fn findall(&self, path: &str) -> Vec<&Element> {
        // ---
        let steps = match parse_path(path) {
            Some(steps) => steps,
            None => return Vec::new(),
        };
        let mut current: Vec<&Element> = vec![self];
        for step in &steps {
            let mut next = Vec::new();
            for el in current {
                if step.descendant {
                    el.collect_descendants(step, &mut next);
                } else {
                    next.extend(el.children.iter().filter(|c| step.matches(c)));
                }
            }
            current = next;
        }
        current
    }

    fn collect_descendants<'a>(&'a self, step: &Step, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if step.matches(child) {
                out.push(child);
            }
            child.collect_descendants(step, out);
        }
    }
}

impl Step {
    fn matches(&self, el: &Element) -> bool {
        (self.local == "*" || self.local == el.local) && (self.local == "*" || self.ns == el.ns.as_deref())
    }
}

fn parse_path(path: &str) -> Option<Vec<Step>> {
    // ---
    let mut steps = Vec::new();
    let mut descendant = false;
    let path = path.strip_prefix('.').unwrap_or(path);
    for segment in path.split('/') {
        if segment.is_empty() {
            descendant = true;
            continue;
        }
        let (ns, local) = match segment.split_once(':') {
            Some((prefix, local)) => (Some(namespace_uri(prefix)?), local),
            None => (None, segment),
        };
        steps.push(Step {
            ns,
            local: local.to_string(),
            descendant,
        });
        descendant = false;
    }
    Some(steps)
}

// ---

/// Parse a whole document into its root element.
pub fn parse_document(text: &str) -> HarvestResult<Element> {
    // ---
    let mut reader = Reader::from_str(text);
    let mut scopes: Vec<HashMap<String, String>> = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let el = open_element(&e, &mut scopes)?;
                stack.push(el);
            }
            Event::Empty(e) => {
                let el = open_element(&e, &mut scopes)?;
                scopes.pop();
                attach(el, &mut stack, &mut root);
            }
            Event::End(_) => {
                scopes.pop();
                let el = stack
                    .pop()
                    .ok_or_else(|| HarvestError::Parse("xml: unbalanced end tag".into()))?;
                attach(el, &mut stack, &mut root);
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(HarvestError::Parse("xml: document ended inside an element".into()));
    }
    root.ok_or_else(|| HarvestError::Parse("xml: empty document".into()))
}

fn attach(el: Element, stack: &mut [Element], root: &mut Option<Element>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(el),
        None => *root = Some(el),
    }
}

fn open_element(e: &BytesStart<'_>, scopes: &mut Vec<HashMap<String, String>>) -> HarvestResult<Element> {
    // ---
    let mut declared = HashMap::new();
    let mut raw_attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| HarvestError::Parse(format!("xml attribute: {}", err)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            declared.insert(String::new(), value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.insert(prefix.to_string(), value);
        } else {
            raw_attrs.push((key, value));
        }
    }
    scopes.push(declared);

    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let (ns, local) = resolve(&name, scopes, true);
    let attributes = raw_attrs
        .into_iter()
        .map(|(key, value)| {
            let (ns, local) = resolve(&key, scopes, false);
            Attribute { ns, local, value }
        })
        .collect();

    Ok(Element {
        ns,
        local,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

/// Resolve `prefix:local` against the scope stack. Unprefixed attributes have no namespace.
fn resolve(name: &str, scopes: &[HashMap<String, String>], is_element: bool) -> (Option<String>, String) {
    // ---
    let (prefix, local) = match name.split_once(':') {
        Some((p, l)) => (p, l),
        None if is_element => ("", name),
        None => return (None, name.to_string()),
    };
    let ns = scopes
        .iter()
        .rev()
        .find_map(|scope| scope.get(prefix))
        .cloned()
        .or_else(|| match prefix {
            "xml" => Some("http://www.w3.org/XML/1998/namespace".to_string()),
            _ => None,
        })
        .filter(|uri| !uri.is_empty());
    (ns, local.to_string())
}

// ---

pub fn xlink_href(el: &Element) -> Option<&str> {
    el.attr("xlink:href")
}

pub fn xlink_title(el: &Element) -> Option<&str> {
    el.attr("xlink:title")
}

/// Decode an ISO 6709 point (`+53.3811-001.4701/`, optionally with altitude).
pub fn parse_iso6709(text: &str) -> Option<(f64, f64)> {
    // ---
    let text = text.trim().trim_end_matches('/');
    let bytes = text.as_bytes();
    let signs: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'+' || **b == b'-')
        .map(|(i, _)| i)
        .collect();
    if signs.len() < 2 || signs[0] != 0 {
        return None;
    }
    let end = signs.get(2).copied().unwrap_or(text.len());
    let latitude: f64 = text[signs[0]..signs[1]].parse().ok()?;
    let longitude: f64 = text[signs[1]..end].parse().ok()?;
    Some((latitude, longitude))
}

/// Decode a `gml:pos` value (`53.38 -1.47`), latitude first.
pub fn parse_pos(text: &str) -> Option<(f64, f64)> {
    let mut parts = text.split_whitespace().map(str::parse::<f64>);
    match (parts.next(), parts.next()) {
        (Some(Ok(lat)), Some(Ok(lon))) => Some((lat, lon)),
        _ => None,
    }
}

/// `om:phenomenonTime` of an observation as `(begin, end)`. Instants give `begin == end`.
pub fn phenomenon_time(observation: &Element) -> Option<(Timestamp, Timestamp)> {
    // ---
    let pt = observation.find("om:phenomenonTime")?;
    if let Some(period) = pt.find("gml:TimePeriod") {
        let begin = parse_timestamp(period.find_text("gml:beginPosition")?)?;
        let end = parse_timestamp(period.find_text("gml:endPosition")?)?;
        return Some((begin, end));
    }
    let instant = parse_timestamp(pt.find_text("gml:TimeInstant/gml:timePosition")?)?;
    Some((instant, instant))
}

/// Separators of a `swe:TextEncoding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEncoding {
    pub block_separator: String,
    pub token_separator: String,
    pub decimal_separator: String,
}

impl Default for TextEncoding {
    fn default() -> Self {
        TextEncoding {
            block_separator: "@@".into(),
            token_separator: ",".into(),
            decimal_separator: ".".into(),
        }
    }
}

impl TextEncoding {
    pub fn from_element(el: &Element) -> HarvestResult<Self> {
        // ---
        let get = |name: &str| {
            el.attr(name)
                .map(String::from)
                .ok_or_else(|| HarvestError::Parse(format!("TextEncoding without {}", name)))
        };
        Ok(TextEncoding {
            block_separator: get("blockSeparator")?,
            token_separator: get("tokenSeparator")?,
            decimal_separator: el.attr("decimalSeparator").unwrap_or(".").to_string(),
        })
    }

    /// Split encoded values into blocks of tokens. Blank blocks are skipped.
    pub fn decode(&self, values: &str) -> Vec<Vec<String>> {
        // ---
        values
            .split(self.block_separator.as_str())
            .map(str::trim)
            .filter(|block| !block.is_empty())
            .map(|block| {
                block
                    .split(self.token_separator.as_str())
                    .map(|t| {
                        let t = t.trim();
                        if self.decimal_separator != "." {
                            t.replace(self.decimal_separator.as_str(), ".")
                        } else {
                            t.to_string()
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

/// Raise the `ows:Exception` carried by an `ows:ExceptionReport`, if any.
pub fn check_exception_report(root: &Element) -> HarvestResult<()> {
    // ---
    if !root.is("ows", "ExceptionReport") {
        return Ok(());
    }
    let exception = root.find("ows:Exception");
    let code = exception
        .and_then(|e| e.attr("exceptionCode"))
        .unwrap_or("NoApplicableCode")
        .to_string();
    let text = exception
        .and_then(|e| e.find_text("ows:ExceptionText"))
        .unwrap_or("")
        .to_string();
    Err(HarvestError::ServiceException { code, text })
}
