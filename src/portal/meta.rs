//! Portal metadata inputs: reading-type groups and AQI standards.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::objects::{AqiStandard, ReadingCategory, ReadingType};
use super::sync::PortalClient;
use crate::error::HarvestResult;

// ---

/// One entry of the reading-type-group file:
/// `{"name":"Traffic","icon_name":"car","reading_types":["TRAFF_FLOW"]}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadingTypeGroup {
    pub name: String,
    #[serde(default)]
    pub icon_name: Option<String>,
    #[serde(default)]
    pub reading_types: Vec<String>,
}

pub fn parse_reading_type_groups(text: &str) -> HarvestResult<Vec<ReadingTypeGroup>> {
    Ok(serde_json::from_str(text)?)
}

pub fn load_reading_type_groups(path: &Path) -> HarvestResult<Vec<ReadingTypeGroup>> {
    parse_reading_type_groups(&std::fs::read_to_string(path)?)
}

pub fn parse_aqi_standards(text: &str) -> HarvestResult<Vec<AqiStandard>> {
    Ok(serde_json::from_str(text)?)
}

pub fn load_aqi_standards(path: &Path) -> HarvestResult<Vec<AqiStandard>> {
    parse_aqi_standards(&std::fs::read_to_string(path)?)
}

/// Counts of objects touched by a metadata sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaSummary {
    pub categories: usize,
    pub reading_types: usize,
    pub aqi_standards: usize,
}

/// Upsert each group as a reading category and its members as reading types.
pub async fn sync_reading_type_groups(
    portal: &mut PortalClient,
    groups: &[ReadingTypeGroup],
) -> HarvestResult<MetaSummary> {
    // ---
    let mut summary = MetaSummary::default();
    for group in groups {
        let category = ReadingCategory {
            name: group.name.clone(),
            icon_name: group.icon_name.clone(),
        };
        let category_id = portal.upsert(&category).await?.id();
        summary.categories += 1;
        for name in &group.reading_types {
            let reading_type = ReadingType {
                name: name.clone(),
                unit: None,
                reading_category_id: Some(category_id),
            };
            portal.upsert(&reading_type).await?;
            summary.reading_types += 1;
        }
    }
    info!(
        "Synced {} reading categories and {} reading types",
        summary.categories, summary.reading_types
    );
    Ok(summary)
}

pub async fn sync_aqi_standards(portal: &mut PortalClient, standards: &[AqiStandard]) -> HarvestResult<usize> {
    // ---
    for standard in standards {
        portal.upsert(standard).await?;
    }
    info!("Synced {} AQI standards", standards.len());
    Ok(standards.len())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::http::mock::{Method, MockHttpClient, MockReply};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_parse_inputs() {
        // ---
        let groups = parse_reading_type_groups(
            r#"[{"name":"Traffic","icon_name":"car","reading_types":["TRAFF_FLOW","TRAFF_SPEED"]}]"#,
        )
        .unwrap();
        assert_eq!(groups[0].reading_types.len(), 2);
        let standards =
            parse_aqi_standards(r#"[{"name":"DAQI","description":"UK","breakpoints":[1,2]}]"#).unwrap();
        assert_eq!(standards[0].name, "DAQI");
        assert!(parse_aqi_standards("{").is_err());
    }

    #[tokio::test]
    async fn test_groups_link_types_to_category() {
        // ---
        let mock = MockHttpClient::new();
        mock.on_get("/reading-categories", MockReply::Json(json!([])));
        mock.on_post("/reading-categories", MockReply::Json(json!({"id": 3})));
        mock.on_get("/reading-types", MockReply::Json(json!([{"id": 8, "name": "TRAFF_FLOW", "unit": null, "reading_category_id": 3}])));
        mock.on_post("/reading-types", MockReply::Json(json!({"id": 9})));
        let mut portal = PortalClient::new(Arc::new(mock.clone()), "https://portal", 100);
        let groups = vec![ReadingTypeGroup {
            name: "Traffic".into(),
            icon_name: Some("car".into()),
            reading_types: vec!["TRAFF_FLOW".into(), "TRAFF_SPEED".into()],
        }];
        let summary = sync_reading_type_groups(&mut portal, &groups).await.unwrap();
        assert_eq!(summary.reading_types, 2);
        let posts = mock.requests_of(Method::Post);
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[1].body.as_ref().unwrap()["reading_category_id"], 3);
        assert!(mock.requests_of(Method::Patch).is_empty());
    }
}
