//! Object storage
//!
//! [`ObjectStore`] is the seam between the batch engine and the backing
//! store: [`S3ObjectStore`] talks to S3 (or any S3-compatible endpoint),
//! [`MemoryObjectStore`] keeps everything in process for tests and local runs.

pub mod batch;
pub mod config;
pub mod memory;
pub mod merge;
pub mod reconcile;
pub mod s3;

pub use batch::{
    BatchEngine, CopyOptions, CopyReport, DeleteReport, ObjectLocation, ReplicationTask, SourceObject,
    TaskFailure, Transform,
};
pub use config::StorageConfig;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lightengine_common::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    pub bucket: String,
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A bucket event notification delivered to a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNotification {
    pub id: String,
    pub queue_arn: String,
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>, content_type: Option<&str>) -> Result<()>;

    /// Delete up to one request's worth of keys. Returns the keys the store
    /// reported as not deleted; a failed request is an error.
    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<Vec<String>>;

    /// Every object under `prefix`, across all result pages.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>>;

    /// A store acting under the given role (cross-account sources).
    async fn assume_role(&self, role: &str) -> Result<Arc<dyn ObjectStore>>;

    async fn get_queue_notifications(&self, bucket: &str) -> Result<Vec<QueueNotification>>;

    /// Replace the queue notifications; other notification kinds are kept.
    async fn put_queue_notifications(&self, bucket: &str, entries: Vec<QueueNotification>) -> Result<()>;

    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>>;

    /// Write the policy document, or remove the policy with `None`.
    async fn put_bucket_policy(&self, bucket: &str, policy: Option<String>) -> Result<()>;
}

/// Parse `s3://bucket/key` into its parts.
pub fn parse_s3_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    (!bucket.is_empty()).then_some((bucket, key))
}

/// Join key segments with single slashes.
pub fn join_key<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_uri() {
        assert_eq!(parse_s3_uri("s3://bucket/a/b.gz"), Some(("bucket", "a/b.gz")));
        assert_eq!(parse_s3_uri("s3://bucket"), Some(("bucket", "")));
        assert_eq!(parse_s3_uri("s3:///key"), None);
        assert_eq!(parse_s3_uri("https://bucket/key"), None);
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(["datalake/", "/alb", "", "ds=1/"]), "datalake/alb/ds=1");
    }
}
