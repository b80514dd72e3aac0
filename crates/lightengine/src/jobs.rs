//! Job documents
//!
//! Every entry point takes one JSON document. Documents are typed request
//! structs; `validate()` rejects missing or malformed required fields before
//! any I/O happens.

use crate::partition::PartitionAction;
use crate::storage::{parse_s3_uri, ObjectLocation, ReplicationTask};
use chrono::{DateTime, TimeDelta, Utc};
use lightengine_common::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Parse a job document; malformed documents are validation failures.
pub fn parse_document<T: DeserializeOwned>(content: &str) -> Result<T> {
    serde_json::from_str(content).map_err(|e| EngineError::Validation(format!("malformed job document: {}", e)))
}

/// Read raw input from a file path, or stdin for `-`.
pub fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(path).map_err(|e| EngineError::Validation(format!("cannot read {}: {}", path, e)))
    }
}

/// Read a document from a file path, or stdin for `-`.
pub fn read_document<T: DeserializeOwned>(path: &str) -> Result<T> {
    parse_document(&read_input(path)?)
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(EngineError::missing_field(field))
    } else {
        Ok(())
    }
}

/// Ledger context handed down by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExtra {
    #[serde(default)]
    pub parent_task_id: String,
    #[serde(default)]
    pub state_machine_name: String,
    #[serde(default)]
    pub state_name: String,
    #[serde(rename = "API", default)]
    pub api: String,
}

/// Partition ADD/DROP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionJob {
    #[serde(default)]
    pub execution_name: String,
    #[serde(default)]
    pub action: PartitionAction,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table_name: String,
    /// Table location, `s3://bucket/prefix/table/`
    #[serde(default)]
    pub location: String,
    /// Restricts the scan to one partition subtree.
    #[serde(default)]
    pub partition_prefix: String,
    #[serde(default)]
    pub work_group: String,
    #[serde(default)]
    pub output_location: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub extra: JobExtra,
}

impl PartitionJob {
    pub fn validate(&self) -> Result<()> {
        require("executionName", &self.execution_name)?;
        require("database", &self.database)?;
        require("tableName", &self.table_name)?;
        require("location", &self.location)?;
        require("workGroup", &self.work_group)?;
        require("outputLocation", &self.output_location)?;
        if parse_s3_uri(&self.location).is_none() {
            return Err(EngineError::Validation(format!(
                "location must be an s3:// URI, got '{}'",
                self.location
            )));
        }
        Ok(())
    }

    /// Bucket and table prefix of `location`.
    pub fn table_location(&self) -> Result<(String, String)> {
        let (bucket, prefix) = parse_s3_uri(&self.location)
            .ok_or_else(|| EngineError::Validation(format!("invalid location '{}'", self.location)))?;
        Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
    }
}

/// `now` minus a retention window, rejecting windows chrono cannot represent.
fn window_start(
    now: DateTime<Utc>,
    field: &str,
    amount: u64,
    unit: fn(i64) -> Option<TimeDelta>,
) -> Result<DateTime<Utc>> {
    i64::try_from(amount)
        .ok()
        .and_then(unit)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| EngineError::Validation(format!("{} is out of range: {}", field, amount)))
}

/// Recompaction request for one pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergerJob {
    #[serde(default)]
    pub execution_name: Option<String>,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub partition_prefix: Option<String>,
    #[serde(default)]
    pub target_size_bytes: Option<u64>,
    #[serde(default)]
    pub older_than_hours: Option<u64>,
}

impl MergerJob {
    pub fn validate(&self) -> Result<()> {
        require("pipelineId", &self.pipeline_id)?;
        if self.target_size_bytes == Some(0) {
            return Err(EngineError::Validation("targetSizeBytes must be positive".to_string()));
        }
        self.cutoff(Utc::now())?;
        Ok(())
    }

    /// Newest write time a partition may have to be merged.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.older_than_hours
            .map(|hours| window_start(now, "olderThanHours", hours, TimeDelta::try_hours))
            .transpose()
    }
}

/// Cold-storage move request for one pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiverJob {
    #[serde(default)]
    pub execution_name: Option<String>,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub older_than_days: Option<u64>,
}

impl ArchiverJob {
    pub fn validate(&self) -> Result<()> {
        require("pipelineId", &self.pipeline_id)?;
        match self.older_than_days {
            None => Err(EngineError::missing_field("olderThanDays")),
            Some(0) => Err(EngineError::Validation("olderThanDays must be positive".to_string())),
            Some(_) => self.cutoff(Utc::now()).map(|_| ()),
        }
    }

    /// Partitions older than this are archived.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let days = self
            .older_than_days
            .ok_or_else(|| EngineError::missing_field("olderThanDays"))?;
        window_start(now, "olderThanDays", days, TimeDelta::try_days)
    }
}

pub fn validate_tasks(tasks: &[ReplicationTask]) -> Result<()> {
    for (index, task) in tasks.iter().enumerate() {
        for (field, value) in [
            ("source.bucket", &task.source.bucket),
            ("source.key", &task.source.key),
            ("destination.bucket", &task.destination.bucket),
            ("destination.key", &task.destination.key),
        ] {
            require(field, value).map_err(|e| EngineError::Validation(format!("task {}: {}", index, e)))?;
        }
    }
    Ok(())
}

pub fn validate_sources(sources: &[ObjectLocation]) -> Result<()> {
    for source in sources {
        require("bucket", &source.bucket)?;
        require("key", &source.key)?;
    }
    Ok(())
}

/// One object-arrival record, key already decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub bucket: String,
    pub key: String,
    pub event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_id: Option<String>,
}

impl EventRecord {
    pub fn is_object_created(&self) -> bool {
        self.event_name.starts_with("ObjectCreated") || self.event_name.starts_with("s3:ObjectCreated")
    }
}

/// Object-arrival event in either the flat or the native notification shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEvent {
    pub records: Vec<EventRecord>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "Records", default)]
    records: Vec<RawRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRecord {
    Native {
        #[serde(rename = "eventName")]
        event_name: String,
        s3: NativeEntity,
    },
    Flat {
        bucket: String,
        key: String,
        #[serde(rename = "eventName", default)]
        event_name: String,
        #[serde(rename = "configurationId", default)]
        configuration_id: Option<String>,
    },
}

#[derive(Deserialize)]
struct NativeEntity {
    #[serde(rename = "configurationId", default)]
    configuration_id: Option<String>,
    bucket: NativeBucket,
    object: NativeObject,
}

#[derive(Deserialize)]
struct NativeBucket {
    name: String,
}

#[derive(Deserialize)]
struct NativeObject {
    key: String,
}

/// Notification keys are form-encoded: `+` is a space.
pub fn decode_event_key(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| EngineError::Validation(format!("invalid object key '{}': {}", raw, e)))
}

impl ObjectEvent {
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawEvent = parse_document(content)?;
        let records = raw
            .records
            .into_iter()
            .map(|record| {
                Ok(match record {
                    RawRecord::Native { event_name, s3 } => EventRecord {
                        bucket: s3.bucket.name,
                        key: decode_event_key(&s3.object.key)?,
                        event_name,
                        configuration_id: s3.configuration_id,
                    },
                    RawRecord::Flat {
                        bucket,
                        key,
                        event_name,
                        configuration_id,
                    } => EventRecord {
                        bucket,
                        key: decode_event_key(&key)?,
                        event_name,
                        configuration_id,
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { records })
    }

    pub fn validate(&self) -> Result<()> {
        for record in &self.records {
            require("bucket", &record.bucket)?;
            require("key", &record.key)?;
        }
        Ok(())
    }

    /// Created objects under `prefix`.
    pub fn created_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a EventRecord> + 'a {
        let prefix = prefix.trim_start_matches('/');
        self.records
            .iter()
            .filter(|record| record.is_object_created())
            .filter(move |record| record.key.starts_with(prefix))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn partition_job() -> serde_json::Value {
        serde_json::json!({
            "executionName": "exec-1",
            "database": "centralized",
            "tableName": "alb",
            "location": "s3://centralized/datalake/alb/",
            "partitionPrefix": "__ds__=2023-03-11-20-00",
            "workGroup": "primary",
            "outputLocation": "s3://centralized/athena-results/",
            "extra": {"parentTaskId": "p", "stateMachineName": "sm", "stateName": "Partition", "API": "Lambda: Invoke"}
        })
    }

    #[test]
    fn test_partition_job_defaults_to_add() {
        let job: PartitionJob = parse_document(&partition_job().to_string()).unwrap();
        job.validate().unwrap();
        assert_eq!(job.action, PartitionAction::Add);
        assert_eq!(job.extra.api, "Lambda: Invoke");
        assert_eq!(
            job.table_location().unwrap(),
            ("centralized".to_string(), "datalake/alb".to_string())
        );
    }

    #[test]
    fn test_partition_job_missing_fields() {
        let mut doc = partition_job();
        doc.as_object_mut().unwrap().remove("tableName");
        let job: PartitionJob = parse_document(&doc.to_string()).unwrap();
        let err = job.validate().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("tableName"));

        let mut doc = partition_job();
        doc["location"] = serde_json::json!("centralized/datalake");
        let job: PartitionJob = parse_document(&doc.to_string()).unwrap();
        assert!(job.validate().unwrap_err().is_validation());

        let bad_action = parse_document::<PartitionJob>(r#"{"action": "TRUNCATE"}"#);
        assert!(bad_action.unwrap_err().is_validation());
    }

    #[test]
    fn test_stage_jobs() {
        let merger: MergerJob = parse_document(r#"{"pipelineId": "p1", "olderThanHours": 2}"#).unwrap();
        merger.validate().unwrap();
        assert!(MergerJob::default().validate().is_err());

        let archiver: ArchiverJob = parse_document(r#"{"pipelineId": "p1"}"#).unwrap();
        assert!(archiver.validate().unwrap_err().to_string().contains("olderThanDays"));
    }

    #[test]
    fn test_retention_window_out_of_range() {
        for days in [200_000_000, u64::MAX] {
            let job = ArchiverJob {
                pipeline_id: "p1".to_string(),
                older_than_days: Some(days),
                ..ArchiverJob::default()
            };
            let err = job.validate().unwrap_err();
            assert!(err.is_validation());
            assert!(err.to_string().contains("olderThanDays"));
        }

        let merger = MergerJob {
            pipeline_id: "p1".to_string(),
            older_than_hours: Some(u64::MAX / 2),
            ..MergerJob::default()
        };
        assert!(merger.validate().unwrap_err().is_validation());

        let now = Utc::now();
        let week = ArchiverJob {
            pipeline_id: "p1".to_string(),
            older_than_days: Some(7),
            ..ArchiverJob::default()
        };
        assert_eq!(week.cutoff(now).unwrap(), now - TimeDelta::days(7));
        assert_eq!(MergerJob::default().cutoff(now).unwrap(), None);
    }

    #[test]
    fn test_event_shapes() {
        let flat = r#"{"Records": [{"bucket": "staging", "key": "AWSLogs/a+b%2Bc.gz", "eventName": "ObjectCreated:Put"}]}"#;
        let event = ObjectEvent::parse(flat).unwrap();
        assert_eq!(event.records[0].key, "AWSLogs/a b+c.gz");

        let native = r#"{"Records": [{
            "eventName": "ObjectCreated:Put",
            "s3": {"configurationId": "cfg", "bucket": {"name": "staging"}, "object": {"key": "AWSLogs/x%3Dy.log"}}
        }, {
            "eventName": "ObjectRemoved:Delete",
            "s3": {"bucket": {"name": "staging"}, "object": {"key": "AWSLogs/gone.log"}}
        }]}"#;
        let event = ObjectEvent::parse(native).unwrap();
        assert_eq!(event.records[0].bucket, "staging");
        assert_eq!(event.records[0].key, "AWSLogs/x=y.log");
        assert_eq!(event.records[0].configuration_id.as_deref(), Some("cfg"));

        let created: Vec<_> = event.created_under("AWSLogs/").collect();
        assert_eq!(created.len(), 1);
        assert_eq!(event.created_under("Other/").count(), 0);
    }

    #[test]
    fn test_task_validation() {
        let tasks: Vec<ReplicationTask> = parse_document(
            r#"[{"source": {"bucket": "a", "key": "k", "role": "arn:aws:iam::1:role/r"}, "destination": {"bucket": "b", "key": ""}}]"#,
        )
        .unwrap();
        assert_eq!(tasks[0].source.role.as_deref(), Some("arn:aws:iam::1:role/r"));
        assert!(validate_tasks(&tasks).unwrap_err().to_string().contains("destination.key"));
    }
}
