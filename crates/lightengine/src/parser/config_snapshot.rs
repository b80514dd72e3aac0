//! AWS Config snapshots: one document with a `configurationItems` array.

use lightengine_common::{EngineError, Result};
use serde_json::Value;

use super::fields::{format_time, json_member, parse_time, JsonKind, TimeFormat};
use super::{NormalizedRecord, ParserOptions};

const FIELDS: &[(&str, &str, JsonKind)] = &[
    ("resource_type", "resourceType", JsonKind::Text),
    ("resource_id", "resourceId", JsonKind::Text),
    ("resource_name", "resourceName", JsonKind::Text),
    ("aws_region", "awsRegion", JsonKind::Text),
    ("aws_account_id", "awsAccountId", JsonKind::Text),
    ("configuration_item_status", "configurationItemStatus", JsonKind::Text),
    ("arn", "ARN", JsonKind::Text),
    ("availability_zone", "availabilityZone", JsonKind::Text),
    ("tags", "tags", JsonKind::Json),
    ("configuration", "configuration", JsonKind::Json),
    ("relationships", "relationships", JsonKind::Json),
];

pub(super) const RECORDS_KEY: &str = "configurationItems";

pub(super) fn field_names() -> Vec<&'static str> {
    let mut names = vec!["time"];
    names.extend(FIELDS.iter().map(|(name, _, _)| *name));
    names
}

pub(super) fn parse_element(element: &Value, options: &ParserOptions) -> Result<NormalizedRecord> {
    let item = element
        .as_object()
        .ok_or_else(|| EngineError::Parse("configuration item is not an object".to_string()))?;
    let capture_time = item
        .get("configurationItemCaptureTime")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Parse("configuration item has no capture time".to_string()))?;
    let time = parse_time(capture_time, TimeFormat::Rfc3339, options)?;

    let mut record = NormalizedRecord::new();
    record.insert("time", Value::String(format_time(&time)));
    for (name, key, kind) in FIELDS {
        let value = match (*key, item.get(*key)) {
            // Delivery channels have used both spellings.
            ("ARN", None) => json_member(item, "arn", *kind),
            _ => json_member(item, key, *kind),
        };
        record.insert(name, value);
    }
    Ok(record)
}
