//! WAF logs: one JSON document per line.

use lightengine_common::{EngineError, Result};
use serde_json::{Map, Value};

use super::fields::{format_time, json_member, parse_time, JsonKind, TimeFormat};
use super::{NormalizedRecord, ParserOptions};

const TOP_LEVEL: &[(&str, &str)] = &[
    ("format_version", "formatVersion"),
    ("webacl_id", "webaclId"),
    ("terminating_rule_id", "terminatingRuleId"),
    ("terminating_rule_type", "terminatingRuleType"),
    ("action", "action"),
    ("http_source_name", "httpSourceName"),
    ("http_source_id", "httpSourceId"),
];

const REQUEST: &[(&str, &str)] = &[
    ("client_ip", "clientIp"),
    ("country", "country"),
    ("uri", "uri"),
    ("args", "args"),
    ("http_version", "httpVersion"),
    ("http_method", "httpMethod"),
    ("request_id", "requestId"),
];

pub(super) fn field_names() -> Vec<&'static str> {
    let mut names = vec!["time"];
    names.extend(TOP_LEVEL.iter().map(|(name, _)| *name));
    names.extend(REQUEST.iter().map(|(name, _)| *name));
    names.extend(["host", "user_agent", "labels"]);
    names
}

pub(super) fn parse_line(line: &str, options: &ParserOptions) -> Result<Option<NormalizedRecord>> {
    let document: Value = serde_json::from_str(line)?;
    let object = document
        .as_object()
        .ok_or_else(|| EngineError::Parse("WAF record is not an object".to_string()))?;

    let timestamp = match object.get("timestamp") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => return Err(EngineError::Parse("WAF record has no timestamp".to_string())),
    };
    let time = parse_time(&timestamp, TimeFormat::EpochMillis, options)?;

    let mut record = NormalizedRecord::new();
    record.insert("time", Value::String(format_time(&time)));
    for (name, key) in TOP_LEVEL {
        record.insert(name, json_member(object, key, JsonKind::Text));
    }

    let empty = Map::new();
    let request = object
        .get("httpRequest")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    for (name, key) in REQUEST {
        record.insert(name, json_member(request, key, JsonKind::Text));
    }

    record.insert("host", Value::String(header(request, "host")));
    record.insert("user_agent", Value::String(header(request, "user-agent")));

    let labels = object
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    record.insert("labels", Value::String(labels));

    Ok(Some(record))
}

fn header(request: &Map<String, Value>, name: &str) -> String {
    request
        .get("headers")
        .and_then(Value::as_array)
        .and_then(|headers| {
            headers.iter().find(|h| {
                h.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
        })
        .and_then(|h| h.get("value"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
