//! Log format parsers
//!
//! Every supported log source is one [`SourceType`] variant. Line-oriented
//! sources are parsed line by line; document sources (CloudTrail, Config
//! snapshots) parse the whole object and treat each array element as a raw
//! record. A malformed line or element is logged and counted, never raised:
//! one corrupt entry must not fail the file it came from.

pub mod fields;

mod alb;
mod cloudfront;
mod cloudtrail;
mod config_snapshot;
mod lambda;
mod rds;
mod s3_access;
mod vpc_flow;
mod waf;

use chrono::FixedOffset;
use lightengine_common::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Supported log sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceType {
    Alb,
    CloudFront,
    S3Access,
    Waf,
    VpcFlow,
    Rds,
    AuditTrail,
    ConfigSnapshot,
    FunctionInvocation,
}

impl SourceType {
    pub const ALL: [SourceType; 9] = [
        SourceType::Alb,
        SourceType::CloudFront,
        SourceType::S3Access,
        SourceType::Waf,
        SourceType::VpcFlow,
        SourceType::Rds,
        SourceType::AuditTrail,
        SourceType::ConfigSnapshot,
        SourceType::FunctionInvocation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Alb => "alb",
            SourceType::CloudFront => "cloudfront",
            SourceType::S3Access => "s3",
            SourceType::Waf => "waf",
            SourceType::VpcFlow => "vpc_flow",
            SourceType::Rds => "rds",
            SourceType::AuditTrail => "cloudtrail",
            SourceType::ConfigSnapshot => "config",
            SourceType::FunctionInvocation => "lambda",
        }
    }

    /// Normalized field names in output order.
    pub fn field_names(&self) -> Vec<&'static str> {
        match self {
            SourceType::Alb => alb::field_names(),
            SourceType::CloudFront => cloudfront::field_names(),
            SourceType::S3Access => s3_access::field_names(),
            SourceType::Waf => waf::field_names(),
            SourceType::VpcFlow => vpc_flow::field_names(),
            SourceType::Rds => rds::field_names(),
            SourceType::AuditTrail => cloudtrail::field_names(),
            SourceType::ConfigSnapshot => config_snapshot::field_names(),
            SourceType::FunctionInvocation => lambda::field_names(),
        }
    }

    /// Field holding the client address, used by the geo_ip plugin.
    pub fn client_ip_field(&self) -> Option<&'static str> {
        match self {
            SourceType::Alb | SourceType::Waf => Some("client_ip"),
            SourceType::CloudFront => Some("c_ip"),
            SourceType::S3Access => Some("remote_ip"),
            SourceType::VpcFlow => Some("srcaddr"),
            SourceType::AuditTrail => Some("source_ip_address"),
            SourceType::Rds | SourceType::ConfigSnapshot | SourceType::FunctionInvocation => None,
        }
    }

    /// Field holding the client agent, used by the user_agent plugin.
    pub fn user_agent_field(&self) -> Option<&'static str> {
        match self {
            SourceType::Alb | SourceType::S3Access | SourceType::Waf | SourceType::AuditTrail => {
                Some("user_agent")
            }
            SourceType::CloudFront => Some("cs_user_agent"),
            _ => None,
        }
    }

    /// Key of the record array for whole-document sources.
    fn document_records_key(&self) -> Option<&'static str> {
        match self {
            SourceType::AuditTrail => Some(cloudtrail::RECORDS_KEY),
            SourceType::ConfigSnapshot => Some(config_snapshot::RECORDS_KEY),
            _ => None,
        }
    }

    /// Parse one raw line.
    ///
    /// `Ok(None)` marks a line that carries no record (headers, platform
    /// lines); `Err` marks a malformed line.
    pub fn parse_line(&self, line: &str, options: &ParserOptions) -> Result<Option<NormalizedRecord>> {
        match self {
            SourceType::Alb => alb::parse_line(line, options),
            SourceType::CloudFront => cloudfront::parse_line(line, options),
            SourceType::S3Access => s3_access::parse_line(line, options),
            SourceType::Waf => waf::parse_line(line, options),
            SourceType::VpcFlow => vpc_flow::parse_line(line, options),
            SourceType::Rds => rds::parse_line(line, options),
            SourceType::FunctionInvocation => lambda::parse_line(line, options),
            SourceType::AuditTrail => {
                let element: Value = serde_json::from_str(line)?;
                cloudtrail::parse_element(&element, options).map(Some)
            }
            SourceType::ConfigSnapshot => {
                let element: Value = serde_json::from_str(line)?;
                config_snapshot::parse_element(&element, options).map(Some)
            }
        }
    }

    fn parse_element(&self, element: &Value, options: &ParserOptions) -> Result<NormalizedRecord> {
        match self {
            SourceType::AuditTrail => cloudtrail::parse_element(element, options),
            SourceType::ConfigSnapshot => config_snapshot::parse_element(element, options),
            other => Err(EngineError::Parse(format!(
                "{} is not a document source",
                other
            ))),
        }
    }

    /// Parse a whole decoded object into normalized records.
    pub fn parse_object(&self, body: &str, options: &ParserOptions) -> (Vec<NormalizedRecord>, ParseReport) {
        match self.document_records_key() {
            Some(key) => self.parse_document(body, key, options),
            None => self.parse_lines(body, options),
        }
    }

    fn parse_lines(&self, body: &str, options: &ParserOptions) -> (Vec<NormalizedRecord>, ParseReport) {
        let mut records = Vec::new();
        let mut report = ParseReport::default();

        for (index, line) in body.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match self.parse_line(line, options) {
                Ok(Some(record)) => {
                    records.push(record);
                    report.parsed += 1;
                }
                Ok(None) => report.ignored += 1,
                Err(e) => {
                    warn!(source_type = %self, line = index + 1, error = %e, "Skipping malformed line");
                    report.skipped += 1;
                }
            }
        }

        debug!(source_type = %self, parsed = report.parsed, skipped = report.skipped, "Parsed object");
        (records, report)
    }

    fn parse_document(
        &self,
        body: &str,
        key: &str,
        options: &ParserOptions,
    ) -> (Vec<NormalizedRecord>, ParseReport) {
        let mut report = ParseReport::default();
        let document: Value = match serde_json::from_str(body) {
            Ok(document) => document,
            Err(e) => {
                warn!(source_type = %self, error = %e, "Skipping unreadable document");
                report.skipped += 1;
                return (Vec::new(), report);
            }
        };

        let Some(elements) = document.get(key).and_then(Value::as_array) else {
            warn!(source_type = %self, key, "Document has no record array");
            report.skipped += 1;
            return (Vec::new(), report);
        };

        let mut records = Vec::with_capacity(elements.len());
        for (index, element) in elements.iter().enumerate() {
            match self.parse_element(element, options) {
                Ok(record) => {
                    records.push(record);
                    report.parsed += 1;
                }
                Err(e) => {
                    warn!(source_type = %self, element = index, error = %e, "Skipping malformed record");
                    report.skipped += 1;
                }
            }
        }
        (records, report)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "alb" | "elb" => Ok(SourceType::Alb),
            "cloudfront" => Ok(SourceType::CloudFront),
            "s3" | "s3_access" => Ok(SourceType::S3Access),
            "waf" | "wafv2" => Ok(SourceType::Waf),
            "vpc_flow" | "vpcflow" | "vpc" => Ok(SourceType::VpcFlow),
            "rds" => Ok(SourceType::Rds),
            "cloudtrail" | "audit_trail" => Ok(SourceType::AuditTrail),
            "config" | "config_snapshot" => Ok(SourceType::ConfigSnapshot),
            "lambda" | "function_invocation" => Ok(SourceType::FunctionInvocation),
            _ => Err(EngineError::Validation(format!("unknown source type: {}", s))),
        }
    }
}

impl TryFrom<String> for SourceType {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SourceType> for String {
    fn from(value: SourceType) -> Self {
        value.as_str().to_string()
    }
}

/// Per-pipeline parsing options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserOptions {
    /// Offset applied to timestamps that carry no zone
    pub time_offset: Option<FixedOffset>,
}

impl ParserOptions {
    pub fn with_offset(offset: Option<&str>) -> Result<Self> {
        Ok(Self {
            time_offset: offset.map(fields::parse_offset).transpose()?,
        })
    }
}

/// Counters for one parsed object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseReport {
    pub parsed: usize,
    /// Malformed lines/elements dropped
    pub skipped: usize,
    /// Lines without a record (headers, platform lines)
    pub ignored: usize,
}

impl ParseReport {
    pub fn merge(&mut self, other: ParseReport) {
        self.parsed += other.parsed;
        self.skipped += other.skipped;
        self.ignored += other.ignored;
    }
}

/// One normalized log record
///
/// Field order is the declared order of the source type. Enrichment
/// attributes are kept apart and serialized as a single trailing
/// `enrichment` object; a source field of that name is kept as
/// `_enrichment`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    fields: Map<String, Value>,
    enrichment: Option<Map<String, Value>>,
}

impl NormalizedRecord {
    pub const ENRICHMENT_KEY: &'static str = "enrichment";

    /// Name a source field called `enrichment` is stored under.
    pub const SOURCE_ENRICHMENT_KEY: &'static str = "_enrichment";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: Value) {
        let name = if name == Self::ENRICHMENT_KEY {
            Self::SOURCE_ENRICHMENT_KEY
        } else {
            name
        };
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Canonical RFC 3339 UTC time of the record
    pub fn time(&self) -> Option<&str> {
        self.get_str("time")
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn enrichment(&self) -> Option<&Map<String, Value>> {
        self.enrichment.as_ref()
    }

    pub fn set_enrichment(&mut self, attributes: Map<String, Value>) {
        self.enrichment = Some(attributes);
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        if let Some(enrichment) = &self.enrichment {
            object.insert(Self::ENRICHMENT_KEY.to_string(), Value::Object(enrichment.clone()));
        }
        Value::Object(object)
    }

    /// One JSON line, without the trailing newline
    pub fn to_json_line(&self) -> String {
        self.to_value().to_string()
    }
}
