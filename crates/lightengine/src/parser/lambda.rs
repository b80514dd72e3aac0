//! Lambda function logs as delivered from CloudWatch Logs.
//!
//! Application lines are `time \t request-id \t LEVEL \t message`; runtime
//! platform lines (`START`, `END`, `REPORT`, `INIT_START`) carry no
//! application payload and are ignored.

use lightengine_common::{EngineError, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use super::fields::{format_time, parse_time, TimeFormat};
use super::{NormalizedRecord, ParserOptions};

#[allow(clippy::unwrap_used)]
static LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z)\t([^\t]+)\t([A-Z]+)\t(.*)$")
        .unwrap()
});

const PLATFORM_PREFIXES: &[&str] = &["START ", "END ", "REPORT ", "INIT_START ", "EXTENSION "];

pub(super) fn field_names() -> Vec<&'static str> {
    vec!["time", "request_id", "log_level", "message"]
}

pub(super) fn parse_line(line: &str, options: &ParserOptions) -> Result<Option<NormalizedRecord>> {
    if PLATFORM_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return Ok(None);
    }

    let captures = LINE
        .captures(line)
        .ok_or_else(|| EngineError::Parse("not a Lambda application log line".to_string()))?;
    let group = |i: usize| captures.get(i).map(|m| m.as_str()).unwrap_or_default();

    let time = parse_time(group(1), TimeFormat::Rfc3339, options)?;

    let mut record = NormalizedRecord::new();
    record.insert("time", Value::String(format_time(&time)));
    record.insert("request_id", Value::String(group(2).to_string()));
    record.insert("log_level", Value::String(group(3).to_string()));
    record.insert("message", Value::String(group(4).to_string()));
    Ok(Some(record))
}
