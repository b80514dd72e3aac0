//! CloudTrail audit logs: one `{"Records": [...]}` document per object.

use lightengine_common::{EngineError, Result};
use serde_json::Value;

use super::fields::{format_time, json_member, parse_time, JsonKind, TimeFormat};
use super::{NormalizedRecord, ParserOptions};

const FIELDS: &[(&str, &str, JsonKind)] = &[
    ("event_version", "eventVersion", JsonKind::Text),
    ("event_source", "eventSource", JsonKind::Text),
    ("event_name", "eventName", JsonKind::Text),
    ("aws_region", "awsRegion", JsonKind::Text),
    ("source_ip_address", "sourceIPAddress", JsonKind::Text),
    ("user_agent", "userAgent", JsonKind::Text),
    ("user_identity", "userIdentity", JsonKind::Json),
    ("request_parameters", "requestParameters", JsonKind::Json),
    ("response_elements", "responseElements", JsonKind::Json),
    ("request_id", "requestID", JsonKind::Text),
    ("event_id", "eventID", JsonKind::Text),
    ("read_only", "readOnly", JsonKind::Bool),
    ("event_type", "eventType", JsonKind::Text),
    ("recipient_account_id", "recipientAccountId", JsonKind::Text),
    ("error_code", "errorCode", JsonKind::Text),
    ("error_message", "errorMessage", JsonKind::Text),
];

pub(super) const RECORDS_KEY: &str = "Records";

pub(super) fn field_names() -> Vec<&'static str> {
    let mut names = vec!["time"];
    names.extend(FIELDS.iter().map(|(name, _, _)| *name));
    names
}

pub(super) fn parse_element(element: &Value, options: &ParserOptions) -> Result<NormalizedRecord> {
    let event = element
        .as_object()
        .ok_or_else(|| EngineError::Parse("trail record is not an object".to_string()))?;
    let event_time = event
        .get("eventTime")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Parse("trail record has no eventTime".to_string()))?;
    let time = parse_time(event_time, TimeFormat::Rfc3339, options)?;

    let mut record = NormalizedRecord::new();
    record.insert("time", Value::String(format_time(&time)));
    for (name, key, kind) in FIELDS {
        record.insert(name, json_member(event, key, *kind));
    }
    Ok(record)
}
