//! CloudFront standard logs (tab separated, `#Version`/`#Fields` headers).

use lightengine_common::{EngineError, Result};
use serde_json::Value;

use super::fields::{
    apply_fields, float, format_time, int, parse_time, text, FieldSpec, TimeFormat,
};
use super::{NormalizedRecord, ParserOptions};

/// Columns after the leading `date` and `time` pair.
const FIELDS: &[FieldSpec] = &[
    text("x_edge_location"),
    int("sc_bytes"),
    text("c_ip"),
    text("cs_method"),
    text("cs_host"),
    text("cs_uri_stem"),
    int("sc_status"),
    text("cs_referer"),
    text("cs_user_agent"),
    text("cs_uri_query"),
    text("cs_cookie"),
    text("x_edge_result_type"),
    text("x_edge_request_id"),
    text("x_host_header"),
    text("cs_protocol"),
    int("cs_bytes"),
    float("time_taken"),
    text("x_forwarded_for"),
    text("ssl_protocol"),
    text("ssl_cipher"),
    text("x_edge_response_result_type"),
    text("cs_protocol_version"),
    text("fle_status"),
    text("fle_encrypted_fields"),
    int("c_port"),
    float("time_to_first_byte"),
    text("x_edge_detailed_result_type"),
    text("sc_content_type"),
    int("sc_content_len"),
    int("sc_range_start"),
    int("sc_range_end"),
];

/// Files from before the 2019 field additions carry 24 columns in total.
const MIN_TOKENS: usize = 22;

pub(super) fn field_names() -> Vec<&'static str> {
    let mut names = vec!["time"];
    names.extend(FIELDS.iter().map(|f| f.name));
    names
}

pub(super) fn parse_line(line: &str, options: &ParserOptions) -> Result<Option<NormalizedRecord>> {
    if line.starts_with('#') {
        return Ok(None);
    }

    let columns: Vec<&str> = line.split('\t').collect();
    let (date, time) = match (columns.first(), columns.get(1)) {
        (Some(date), Some(time)) => (*date, *time),
        _ => {
            return Err(EngineError::Parse("missing date/time columns".to_string()))
        }
    };

    let timestamp = parse_time(
        &format!("{} {}", date, time),
        TimeFormat::Naive("%Y-%m-%d %H:%M:%S"),
        options,
    )?;

    let mut record = NormalizedRecord::new();
    record.insert("time", Value::String(format_time(&timestamp)));
    apply_fields(FIELDS, &columns[2..], MIN_TOKENS, options, &mut record)?;

    // CloudFront percent-encodes the user agent; spaces arrive as %20.
    let decoded = record
        .get_str("cs_user_agent")
        .and_then(|agent| urlencoding::decode(agent).ok())
        .map(|agent| agent.into_owned());
    if let Some(agent) = decoded {
        record.insert("cs_user_agent", Value::String(agent));
    }

    Ok(Some(record))
}
