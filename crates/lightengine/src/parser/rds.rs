//! RDS MySQL error logs.
//!
//! `2023-03-11T20:01:02.123456Z 12 [Warning] [MY-010068] [Server] CA certificate ca.pem is self signed.`

use lightengine_common::{EngineError, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use super::fields::{format_time, int_value, parse_time, TimeFormat};
use super::{NormalizedRecord, ParserOptions};

#[allow(clippy::unwrap_used)]
static LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?Z?)\s+(\d+)\s+\[(\w+)\]\s+(?:\[(MY-\d+)\]\s+)?(?:\[\w+\]\s+)?(.*)$",
    )
    .unwrap()
});

const FIELDS: &[&str] = &["time", "thread_id", "log_level", "error_code", "message"];

pub(super) fn field_names() -> Vec<&'static str> {
    FIELDS.to_vec()
}

pub(super) fn parse_line(line: &str, options: &ParserOptions) -> Result<Option<NormalizedRecord>> {
    let captures = LINE
        .captures(line)
        .ok_or_else(|| EngineError::Parse("not an RDS error log entry".to_string()))?;
    let group = |i: usize| captures.get(i).map(|m| m.as_str()).unwrap_or_default();

    let raw_time = group(1).replacen(' ', "T", 1);
    let time = parse_time(&raw_time, TimeFormat::Rfc3339, options)?;

    let mut record = NormalizedRecord::new();
    record.insert("time", Value::String(format_time(&time)));
    record.insert("thread_id", int_value("thread_id", group(2))?);
    record.insert("log_level", Value::String(group(3).to_string()));
    record.insert("error_code", Value::String(group(4).to_string()));
    record.insert("message", Value::String(group(5).trim_end().to_string()));
    Ok(Some(record))
}
