//! DEFRA UK-AIR Sensor Observation Service (AQD e-Reporting flavour).
//!
//! One `GetObservation` KVP request per `(window, sampling point)`. The answer
//! is a feature collection of `om:OM_Observation`s whose result is a
//! `swe:DataArray` of `StartTime,EndTime,Verification,Validity,Value` blocks.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ready, Adapter, RawStream, SourceContext};
use crate::error::{HarvestError, HarvestResult};
use crate::models::{format_timestamp, FieldValue, OutputColumns, Quality, RawReading, Timestamp};
use crate::parsers::xml::{check_exception_report, parse_document, xlink_href, Element, TextEncoding};
use crate::transform::UnitTable;

// ---

/// AQD field order used when the `DataRecord` does not name its fields.
const DEFAULT_FIELDS: [&str; 5] = ["StartTime", "EndTime", "Verification", "Validity", "Value"];

pub struct DefraSosAdapter {
    ctx: SourceContext,
}

impl DefraSosAdapter {
    pub fn new(ctx: SourceContext) -> Self {
        DefraSosAdapter { ctx }
    }

    /// KVP parameters of one `GetObservation` request.
    pub fn observation_params(feature: &str, from: Timestamp, to: Timestamp) -> Vec<(String, String)> {
        vec![
            ("service".into(), "AQD".into()),
            ("version".into(), "1.0.0".into()),
            ("request".into(), "GetObservation".into()),
            (
                "temporalFilter".into(),
                format!("om:phenomenonTime,{}/{}", format_timestamp(&from), format_timestamp(&to)),
            ),
            ("featureOfInterest".into(), feature.to_string()),
        ]
    }
}

/// `spatialFilter` KVP pair for a `(min_lat, min_lon, max_lat, max_lon)` box.
///
/// The server does not honour it; no harvesting flow sends it.
pub fn spatial_filter(bbox: (f64, f64, f64, f64)) -> (String, String) {
    (
        "spatialFilter".into(),
        format!(
            "om:featureOfInterest/*/sams:shape,{},{},{},{},http://www.opengis.net/def/crs/EPSG/0/4326",
            bbox.0, bbox.1, bbox.2, bbox.3
        ),
    )
}

#[async_trait]
impl Adapter for DefraSosAdapter {
    fn name(&self) -> &'static str {
        "defra-sos"
    }

    fn output_columns(&self) -> OutputColumns {
        OutputColumns::new(
            "sensor",
            &["AQ_NO2", "AQ_NO", "AQ_NOX", "AQ_O3", "AQ_SO2", "AQ_PM10", "AQ_PM25", "AQ_CO", "AQ_C6H6"],
        )
    }

    fn units(&self) -> Option<UnitTable> {
        Some(UnitTable::defra_aqd())
    }

    async fn streams(&self) -> HarvestResult<Vec<String>> {
        // ---
        if self.ctx.cfg.harvester.features.is_empty() {
            return Err(HarvestError::Config(
                "defra-sos needs [harvester] features (sampling point URIs)".into(),
            ));
        }
        Ok(self.ctx.cfg.harvester.features.clone())
    }

    async fn fetch_window(&self, stream: &str, from: Timestamp, to: Timestamp) -> HarvestResult<RawStream> {
        // ---
        let params = DefraSosAdapter::observation_params(stream, from, to);
        let borrowed: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let text = self.ctx.client.get_text(&self.ctx.base_url, &borrowed).await?;
        let readings = parse_observations(&text)?;
        info!("{} readings from {} for {}", readings.len(), self.name(), stream);
        Ok(ready(readings))
    }
}

/// Every reading of an SOS observation document.
///
/// Fails with [`HarvestError::ServiceException`] on an exception report and
/// with [`HarvestError::Parse`] when an observation's block count differs
/// from its declared `elementCount`.
pub fn parse_observations(text: &str) -> HarvestResult<Vec<RawReading>> {
    // ---
    let root = parse_document(text)?;
    check_exception_report(&root)?;

    let mut out = Vec::new();
    for observation in root.findall(".//om:OM_Observation") {
        out.extend(parse_observation(observation)?);
    }
    Ok(out)
}

fn parse_observation(obs: &Element) -> HarvestResult<Vec<RawReading>> {
    // ---
    let property = obs
        .find("om:observedProperty")
        .and_then(xlink_href)
        .ok_or_else(|| HarvestError::Parse("observation without om:observedProperty".into()))?
        .to_string();
    let feature = obs.find("om:featureOfInterest").and_then(xlink_href).map(String::from);
    let sampling_point = named_parameter(obs, "SamplingPoint")
        .or_else(|| feature.as_deref().map(local_id))
        .ok_or_else(|| HarvestError::Parse("observation without sampling point".into()))?
        .to_string();
    let station = named_parameter(obs, "Station").map(String::from);

    let array = obs
        .find("om:result/swe:DataArray")
        .ok_or_else(|| HarvestError::Parse(format!("observation of {} without swe:DataArray", sampling_point)))?;
    let declared: usize = array
        .find_text("swe:elementCount/swe:Count/swe:value")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| HarvestError::Parse(format!("{}: missing or invalid elementCount", sampling_point)))?;
    let encoding = match array.find("swe:encoding/swe:TextEncoding") {
        Some(el) => TextEncoding::from_element(el)?,
        None => TextEncoding::default(),
    };
    let blocks = encoding.decode(array.find_text("swe:values").unwrap_or(""));
    if blocks.len() != declared {
        return Err(HarvestError::Parse(format!(
            "{}: elementCount is {} but {} blocks were found",
            sampling_point,
            declared,
            blocks.len()
        )));
    }

    let fields: Vec<&Element> = array.findall("swe:elementType/swe:DataRecord/swe:field");
    let names: Vec<&str> = if fields.is_empty() {
        DEFAULT_FIELDS.to_vec()
    } else {
        fields.iter().map(|f| f.attr("name").unwrap_or("")).collect()
    };
    let column = |name: &str, fallback: usize| {
        names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .unwrap_or(fallback)
    };
    let (end_col, ver_col, val_col, value_col) = (
        column("EndTime", 1),
        column("Verification", 2),
        column("Validity", 3),
        column("Value", 4),
    );
    let unit = fields
        .get(value_col)
        .and_then(|f| f.find(".//swe:uom"))
        .and_then(|u| xlink_href(u).or_else(|| u.attr("code")))
        .unwrap_or("")
        .to_string();

    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks {
        let token = |i: usize| {
            block
                .get(i)
                .map(String::as_str)
                .ok_or_else(|| HarvestError::Parse(format!("{}: short block {:?}", sampling_point, block)))
        };
        let flag = |i: usize| -> HarvestResult<i32> {
            let text = token(i)?;
            text.parse()
                .map_err(|_| HarvestError::Parse(format!("{}: invalid quality flag '{}'", sampling_point, text)))
        };
        let quality = Quality {
            verification: flag(ver_col)?,
            validity: flag(val_col)?,
        };
        let mut reading = RawReading::new(
            sampling_point.clone(),
            token(end_col)?,
            property.clone(),
            FieldValue::Text(token(value_col)?.to_string()),
        )
        .with_unit(unit.clone())
        .with_quality(quality);
        if let Some(station) = &station {
            reading = reading.with_site(station.clone());
        }
        if let Some(feature) = &feature {
            reading = reading.with_feature(feature.clone());
        }
        out.push(reading);
    }
    debug!("{}: {} blocks of {}", sampling_point, out.len(), property);
    Ok(out)
}

/// Local id of an `om:parameter` whose name ends with `/<name>`.
fn named_parameter<'a>(obs: &'a Element, name: &str) -> Option<&'a str> {
    obs.findall("om:parameter/om:NamedValue")
        .into_iter()
        .find(|nv| {
            nv.find("om:name")
                .and_then(xlink_href)
                .is_some_and(|href| href.trim_end_matches('/').ends_with(&format!("/{}", name)))
        })
        .and_then(|nv| nv.find("om:value"))
        .and_then(|v| xlink_href(v).or(Some(v.text())))
        .filter(|v| !v.is_empty())
        .map(local_id)
}

fn local_id(uri: &str) -> &str {
    uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri)
}
