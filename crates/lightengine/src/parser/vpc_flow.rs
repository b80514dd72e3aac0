//! VPC flow logs in the default version 2 format.

use lightengine_common::Result;
use serde_json::Value;

use super::fields::{apply_fields, format_time, int, parse_time, text, FieldSpec, TimeFormat};
use super::{NormalizedRecord, ParserOptions};

const FIELDS: &[FieldSpec] = &[
    int("version"),
    text("account_id"),
    text("interface_id"),
    text("srcaddr"),
    text("dstaddr"),
    int("srcport"),
    int("dstport"),
    int("protocol"),
    int("packets"),
    int("bytes"),
    int("start"),
    int("end"),
    text("action"),
    text("log_status"),
];

pub(super) fn field_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = FIELDS.iter().map(|f| f.name).collect();
    names.push("time");
    names
}

pub(super) fn parse_line(line: &str, options: &ParserOptions) -> Result<Option<NormalizedRecord>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() == Some(&"version") {
        return Ok(None);
    }

    let mut record = NormalizedRecord::new();
    apply_fields(FIELDS, &tokens, FIELDS.len(), options, &mut record)?;

    let start = tokens.get(10).copied().unwrap_or("-");
    let start = if start == "-" { "0" } else { start };
    let time = parse_time(start, TimeFormat::EpochSeconds, options)?;
    record.insert("time", Value::String(format_time(&time)));

    Ok(Some(record))
}
