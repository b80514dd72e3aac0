//! Field tables, tokenizing and value conversion shared by the parsers.

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use lightengine_common::{EngineError, Result};
use serde_json::{Map, Value};

use super::{NormalizedRecord, ParserOptions};

/// Placeholder the collectors write for an absent value.
pub const PLACEHOLDER: &str = "-";

/// How a timestamp column is encoded in the raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    /// RFC 3339 with zone, e.g. `2023-03-11T20:01:02.186641Z`
    Rfc3339,
    /// strftime pattern carrying its own zone (`%z`)
    Zoned(&'static str),
    /// strftime pattern without zone; the declared offset applies
    Naive(&'static str),
    EpochSeconds,
    EpochMillis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Int,
    Float,
    Time(TimeFormat),
    /// `ip:port`, stored as two fields
    HostPort(&'static str, &'static str),
    /// `VERB url PROTO`, stored as `request_verb`/`request_url`/`request_proto`
    Request,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

pub const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

pub const fn text(name: &'static str) -> FieldSpec {
    field(name, FieldKind::Text)
}

pub const fn int(name: &'static str) -> FieldSpec {
    field(name, FieldKind::Int)
}

pub const fn float(name: &'static str) -> FieldSpec {
    field(name, FieldKind::Float)
}

/// Output field names of a table, expanding composite kinds.
pub fn names_of(specs: &[FieldSpec]) -> Vec<&'static str> {
    let mut names = Vec::with_capacity(specs.len() + 4);
    for spec in specs {
        match spec.kind {
            FieldKind::HostPort(ip, port) => {
                names.push(ip);
                names.push(port);
            }
            FieldKind::Request => {
                names.extend(["request_verb", "request_url", "request_proto"]);
            }
            _ => names.push(spec.name),
        }
    }
    names
}

/// Split a space-delimited log line, honoring `"quoted"` and `[bracketed]`
/// tokens. Quotes and brackets are stripped; `\"` inside quotes is kept as `"`.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c == ' ' {
            chars.next();
            continue;
        }

        let mut token = String::new();
        match c {
            '"' => {
                chars.next();
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' if chars.peek() == Some(&'"') => {
                            chars.next();
                            token.push('"');
                        }
                        '"' => break,
                        _ => token.push(ch),
                    }
                }
            }
            '[' => {
                chars.next();
                for ch in chars.by_ref() {
                    if ch == ']' {
                        break;
                    }
                    token.push(ch);
                }
            }
            _ => {
                while let Some(&ch) = chars.peek() {
                    if ch == ' ' {
                        break;
                    }
                    token.push(ch);
                    chars.next();
                }
            }
        }
        tokens.push(token);
    }

    tokens
}

/// Apply a positional field table to tokens.
///
/// Lines with fewer than `min_tokens` tokens are malformed; trailing optional
/// fields that are absent take their placeholder value.
pub fn apply_fields<S: AsRef<str>>(
    specs: &[FieldSpec],
    tokens: &[S],
    min_tokens: usize,
    options: &ParserOptions,
    record: &mut NormalizedRecord,
) -> Result<()> {
    if tokens.len() < min_tokens {
        return Err(EngineError::Parse(format!(
            "expected at least {} fields, got {}",
            min_tokens,
            tokens.len()
        )));
    }

    for (index, spec) in specs.iter().enumerate() {
        let raw = tokens.get(index).map(|t| t.as_ref()).unwrap_or(PLACEHOLDER);
        apply_field(spec, raw, options, record)?;
    }
    Ok(())
}

pub fn apply_field(
    spec: &FieldSpec,
    raw: &str,
    options: &ParserOptions,
    record: &mut NormalizedRecord,
) -> Result<()> {
    match spec.kind {
        FieldKind::Text => record.insert(spec.name, text_value(raw)),
        FieldKind::Int => record.insert(spec.name, int_value(spec.name, raw)?),
        FieldKind::Float => record.insert(spec.name, float_value(spec.name, raw)?),
        FieldKind::Time(format) => {
            let time = parse_time(raw, format, options)?;
            record.insert(spec.name, Value::String(format_time(&time)));
        }
        FieldKind::HostPort(ip_name, port_name) => {
            let (ip, port) = split_host_port(raw);
            record.insert(ip_name, text_value(ip));
            record.insert(port_name, int_value(port_name, port)?);
        }
        FieldKind::Request => {
            let mut parts = raw.splitn(3, ' ');
            for name in ["request_verb", "request_url", "request_proto"] {
                record.insert(name, text_value(parts.next().unwrap_or(PLACEHOLDER)));
            }
        }
    }
    Ok(())
}

pub fn text_value(raw: &str) -> Value {
    if raw == PLACEHOLDER {
        Value::String(String::new())
    } else {
        Value::String(raw.to_string())
    }
}

pub fn int_value(name: &str, raw: &str) -> Result<Value> {
    if raw == PLACEHOLDER || raw.is_empty() {
        return Ok(Value::from(0));
    }
    raw.parse::<i64>()
        .map(Value::from)
        .map_err(|_| EngineError::Parse(format!("field {} is not an integer: {}", name, raw)))
}

pub fn float_value(name: &str, raw: &str) -> Result<Value> {
    if raw == PLACEHOLDER || raw.is_empty() {
        return Ok(Value::from(0.0));
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Value::from)
        .ok_or_else(|| EngineError::Parse(format!("field {} is not a number: {}", name, raw)))
}

/// Split `ip:port`; IPv6 addresses keep their inner colons.
fn split_host_port(raw: &str) -> (&str, &str) {
    if raw == PLACEHOLDER {
        return (PLACEHOLDER, PLACEHOLDER);
    }
    match raw.rfind(':') {
        Some(pos) => (&raw[..pos], &raw[pos + 1..]),
        None => (raw, PLACEHOLDER),
    }
}

pub fn parse_time(raw: &str, format: TimeFormat, options: &ParserOptions) -> Result<DateTime<Utc>> {
    let invalid = || EngineError::Parse(format!("invalid timestamp: {}", raw));

    match format {
        TimeFormat::Rfc3339 => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .map_err(|_| invalid())
                    .and_then(|naive| localize(naive, options))
            }),
        TimeFormat::Zoned(pattern) => DateTime::parse_from_str(raw, pattern)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| invalid()),
        TimeFormat::Naive(pattern) => NaiveDateTime::parse_from_str(raw, pattern)
            .map_err(|_| invalid())
            .and_then(|naive| localize(naive, options)),
        TimeFormat::EpochSeconds => raw
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(invalid),
        TimeFormat::EpochMillis => raw
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(invalid),
    }
}

/// Interpret a zone-less wall-clock time at the declared offset (UTC if none).
fn localize(naive: NaiveDateTime, options: &ParserOptions) -> Result<DateTime<Utc>> {
    match options.time_offset {
        Some(offset) => offset
            .from_local_datetime(&naive)
            .single()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| EngineError::Parse(format!("ambiguous local time: {}", naive))),
        None => Ok(naive.and_utc()),
    }
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an offset such as `+08:00`, `-0530` or `Z`.
pub fn parse_offset(raw: &str) -> Result<FixedOffset> {
    let invalid = || EngineError::Validation(format!("invalid UTC offset: {}", raw));
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// How a JSON member is flattened into a normalized field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    /// Strings as-is, scalars stringified, null/missing as ""
    Text,
    /// Compact JSON text of the member, "" when missing
    Json,
    Bool,
}

pub fn json_member(object: &Map<String, Value>, key: &str, kind: JsonKind) -> Value {
    let value = object.get(key).unwrap_or(&Value::Null);
    match (kind, value) {
        (JsonKind::Bool, Value::Bool(b)) => Value::Bool(*b),
        (JsonKind::Bool, Value::String(s)) => Value::Bool(s.eq_ignore_ascii_case("true")),
        (JsonKind::Bool, _) => Value::Bool(false),
        (_, Value::Null) => Value::String(String::new()),
        (JsonKind::Text, Value::String(s)) => Value::String(s.clone()),
        (_, other) => Value::String(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_quotes_and_brackets() {
        let tokens = tokenize(r#"a "b c" [d e] "" "x \"y\"" f"#);
        assert_eq!(tokens, vec!["a", "b c", "d e", "", "x \"y\"", "f"]);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(int_value("n", "-").unwrap(), Value::from(0));
        assert_eq!(float_value("n", "-").unwrap(), Value::from(0.0));
        assert_eq!(text_value("-"), Value::String(String::new()));
        assert!(int_value("n", "abc").is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("10.0.0.1:443"), ("10.0.0.1", "443"));
        assert_eq!(split_host_port("2001:db8::1:8080"), ("2001:db8::1", "8080"));
        assert_eq!(split_host_port("-"), ("-", "-"));
    }

    #[test]
    fn test_naive_time_with_offset() {
        let options = ParserOptions {
            time_offset: Some(parse_offset("+08:00").unwrap()),
        };
        let time = parse_time(
            "2023-03-11 20:01:02",
            TimeFormat::Naive("%Y-%m-%d %H:%M:%S"),
            &options,
        )
        .unwrap();
        assert_eq!(format_time(&time), "2023-03-11T12:01:02.000Z");
    }

    #[test]
    fn test_zoned_time_ignores_offset() {
        let options = ParserOptions {
            time_offset: Some(parse_offset("-05:00").unwrap()),
        };
        let time = parse_time(
            "06/Feb/2019:00:00:38 +0000",
            TimeFormat::Zoned("%d/%b/%Y:%H:%M:%S %z"),
            &options,
        )
        .unwrap();
        assert_eq!(format_time(&time), "2019-02-06T00:00:38.000Z");
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_offset("8").is_err());
    }
}
