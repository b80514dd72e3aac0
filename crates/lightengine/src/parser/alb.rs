//! Application Load Balancer access logs.
//!
//! ```text
//! https 2018-07-02T22:23:00.186641Z app/my-lb/50dc6c495c0c9188 192.168.131.39:2817 10.0.0.1:80 0.086 0.048 0.037 200 200 0 57 "GET https://www.example.com:443/ HTTP/1.1" "curl/7.46.0" ECDHE-RSA-AES128-GCM-SHA256 TLSv1.2 arn:aws:elasticloadbalancing:... "Root=1-58337281-1d84f3d73c47ec4e58577259" "www.example.com" "arn:aws:acm:..." 1 2018-07-02T22:22:48.364000Z "authenticate,forward" "-" "-" "10.0.0.1:80" "200" "-" "-"
//! ```

use lightengine_common::Result;

use super::fields::{
    apply_fields, field, float, int, names_of, text, tokenize, FieldKind, FieldSpec, TimeFormat,
};
use super::{NormalizedRecord, ParserOptions};

const FIELDS: &[FieldSpec] = &[
    text("type"),
    field("time", FieldKind::Time(TimeFormat::Rfc3339)),
    text("elb"),
    field("client", FieldKind::HostPort("client_ip", "client_port")),
    field("target", FieldKind::HostPort("target_ip", "target_port")),
    float("request_processing_time"),
    float("target_processing_time"),
    float("response_processing_time"),
    int("elb_status_code"),
    int("target_status_code"),
    int("received_bytes"),
    int("sent_bytes"),
    field("request", FieldKind::Request),
    text("user_agent"),
    text("ssl_cipher"),
    text("ssl_protocol"),
    text("target_group_arn"),
    text("trace_id"),
    text("domain_name"),
    text("chosen_cert_arn"),
    int("matched_rule_priority"),
    text("request_creation_time"),
    text("actions_executed"),
    text("redirect_url"),
    text("error_reason"),
    text("target_port_list"),
    text("target_status_code_list"),
    text("classification"),
    text("classification_reason"),
];

/// Entries written before the trace id column existed are still accepted.
const MIN_TOKENS: usize = 17;

pub(super) fn field_names() -> Vec<&'static str> {
    names_of(FIELDS)
}

pub(super) fn parse_line(line: &str, options: &ParserOptions) -> Result<Option<NormalizedRecord>> {
    let tokens = tokenize(line);
    let mut record = NormalizedRecord::new();
    apply_fields(FIELDS, &tokens, MIN_TOKENS, options, &mut record)?;
    Ok(Some(record))
}
