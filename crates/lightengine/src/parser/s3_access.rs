//! S3 server access logs.

use lightengine_common::Result;

use super::fields::{
    apply_fields, field, int, names_of, text, tokenize, FieldKind, FieldSpec, TimeFormat,
};
use super::{NormalizedRecord, ParserOptions};

const FIELDS: &[FieldSpec] = &[
    text("bucket_owner"),
    text("bucket"),
    field("time", FieldKind::Time(TimeFormat::Zoned("%d/%b/%Y:%H:%M:%S %z"))),
    text("remote_ip"),
    text("requester"),
    text("request_id"),
    text("operation"),
    text("key"),
    field("request_uri", FieldKind::Request),
    int("http_status"),
    text("error_code"),
    int("bytes_sent"),
    int("object_size"),
    int("total_time"),
    int("turn_around_time"),
    text("referrer"),
    text("user_agent"),
    text("version_id"),
    text("host_id"),
    text("signature_version"),
    text("cipher_suite"),
    text("authentication_type"),
    text("host_header"),
    text("tls_version"),
    text("access_point_arn"),
    text("acl_required"),
];

const MIN_TOKENS: usize = 18;

pub(super) fn field_names() -> Vec<&'static str> {
    names_of(FIELDS)
}

pub(super) fn parse_line(line: &str, options: &ParserOptions) -> Result<Option<NormalizedRecord>> {
    let tokens = tokenize(line);
    let mut record = NormalizedRecord::new();
    apply_fields(FIELDS, &tokens, MIN_TOKENS, options, &mut record)?;
    Ok(Some(record))
}
