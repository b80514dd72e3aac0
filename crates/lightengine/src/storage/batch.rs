//! Batch copy, merge, delete and list
//!
//! Every operation takes a list of items and isolates failures per item: a
//! task that fails is logged and counted, its siblings carry on. Work fans
//! out over a bounded pool (`buffer_unordered`) and results are collected at
//! one point.

use futures::stream::{self, StreamExt};
use lightengine_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::merge;
use super::{ObjectStore, ObjectSummary};

/// Most keys a single delete request may carry.
pub const DELETE_CHUNK_SIZE: usize = 100;

pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Copy source, optionally read through an assumed role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl SourceObject {
    pub fn location(&self) -> ObjectLocation {
        ObjectLocation::new(&self.bucket, &self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub source: SourceObject,
    pub destination: ObjectLocation,
}

impl ReplicationTask {
    pub fn new(source: ObjectLocation, destination: ObjectLocation) -> Self {
        Self {
            source: SourceObject {
                bucket: source.bucket,
                key: source.key,
                role: None,
            },
            destination,
        }
    }
}

/// Rewrites an object's body between download and upload
pub trait Transform: Send + Sync {
    fn apply(&self, task: &ReplicationTask, body: Vec<u8>) -> Result<Vec<u8>>;

    fn content_type(&self) -> Option<&str> {
        None
    }
}

#[derive(Clone, Default)]
pub struct CopyOptions {
    pub delete_on_success: bool,
    pub transform: Option<Arc<dyn Transform>>,
}

impl fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOptions")
            .field("delete_on_success", &self.delete_on_success)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub task: ReplicationTask,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CopyReport {
    pub succeeded: usize,
    pub failed: usize,
    pub succeeded_tasks: Vec<ReplicationTask>,
    pub failures: Vec<TaskFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl DeleteReport {
    fn absorb(&mut self, other: DeleteReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

#[derive(Clone)]
pub struct BatchEngine {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl BatchEngine {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The store a source is read from.
    pub async fn source_store(&self, source: &SourceObject) -> Result<Arc<dyn ObjectStore>> {
        match &source.role {
            Some(role) => self.store.assume_role(role).await,
            None => Ok(Arc::clone(&self.store)),
        }
    }

    #[instrument(skip(self, tasks, options), fields(tasks = tasks.len()))]
    pub async fn copy(&self, tasks: Vec<ReplicationTask>, options: &CopyOptions) -> CopyReport {
        let mut results: Vec<(usize, ReplicationTask, Result<()>)> = stream::iter(tasks.into_iter().enumerate())
            .map(|(index, task)| async move {
                let result = self.copy_one(&task, options).await;
                (index, task, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut report = CopyReport::default();
        for (_, task, result) in results {
            match result {
                Ok(()) => {
                    report.succeeded += 1;
                    report.succeeded_tasks.push(task);
                }
                Err(e) => {
                    warn!(source = %task.source.location(), error = %e, "Copy task failed");
                    report.failed += 1;
                    report.failures.push(TaskFailure {
                        task,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(succeeded = report.succeeded, failed = report.failed, "Copy batch finished");
        report
    }

    async fn copy_one(&self, task: &ReplicationTask, options: &CopyOptions) -> Result<()> {
        let source_store = self.source_store(&task.source).await?;
        let body = source_store.get(&task.source.bucket, &task.source.key).await?;

        let (body, content_type) = match &options.transform {
            Some(transform) => (transform.apply(task, body)?, transform.content_type()),
            None => (body, None),
        };

        self.store
            .put(&task.destination.bucket, &task.destination.key, body, content_type)
            .await?;
        debug!(source = %task.source.location(), destination = %task.destination, "Copied object");

        if options.delete_on_success {
            // Clean-up failures leave the source in place and do not fail the task.
            let keys = [task.source.key.clone()];
            match source_store.delete_many(&task.source.bucket, &keys).await {
                Ok(failed) if failed.is_empty() => {}
                Ok(_) => warn!(source = %task.source.location(), "Source not deleted after copy"),
                Err(e) => warn!(source = %task.source.location(), error = %e, "Source not deleted after copy"),
            }
        }
        Ok(())
    }

    /// Concatenate every source of `tasks` into the first task's destination.
    pub async fn merge(&self, tasks: &[ReplicationTask], delete_on_success: bool) -> Result<ObjectLocation> {
        merge::merge_objects(self, tasks, delete_on_success).await
    }

    #[instrument(skip(self, sources), fields(sources = sources.len()))]
    pub async fn delete(&self, sources: Vec<ObjectLocation>) -> DeleteReport {
        let mut by_bucket: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for source in sources {
            by_bucket.entry(source.bucket).or_default().push(source.key);
        }

        let chunks: Vec<(String, Vec<String>)> = by_bucket
            .into_iter()
            .flat_map(|(bucket, keys)| {
                keys.chunks(DELETE_CHUNK_SIZE)
                    .map(|chunk| (bucket.clone(), chunk.to_vec()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let reports: Vec<DeleteReport> = stream::iter(chunks)
            .map(|(bucket, keys)| async move {
                match self.store.delete_many(&bucket, &keys).await {
                    Ok(failed) => {
                        for key in &failed {
                            warn!(bucket = %bucket, key = %key, "Object not deleted");
                        }
                        DeleteReport {
                            succeeded: keys.len() - failed.len(),
                            failed: failed.len(),
                        }
                    }
                    Err(e) => {
                        warn!(bucket = %bucket, keys = keys.len(), error = %e, "Delete request failed");
                        DeleteReport {
                            succeeded: 0,
                            failed: keys.len(),
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut total = DeleteReport::default();
        for report in reports {
            total.absorb(report);
        }
        info!(succeeded = total.succeeded, failed = total.failed, "Delete batch finished");
        total
    }

    pub async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        self.store.list(bucket, prefix).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn task(i: usize) -> ReplicationTask {
        ReplicationTask::new(
            ObjectLocation::new("staging", format!("in/{}.log", i)),
            ObjectLocation::new("lake", format!("out/{}.log", i)),
        )
    }

    struct Upper;

    impl Transform for Upper {
        fn apply(&self, _task: &ReplicationTask, body: Vec<u8>) -> Result<Vec<u8>> {
            Ok(body.to_ascii_uppercase())
        }
    }

    #[tokio::test]
    async fn test_copy_isolates_missing_source() {
        let store = MemoryObjectStore::new();
        for i in [1, 2, 4, 5] {
            store.insert("staging", &format!("in/{}.log", i), "line\n");
        }
        let engine = BatchEngine::new(Arc::new(store.clone()), 2);

        let tasks: Vec<_> = (1..=5).map(task).collect();
        let report = engine.copy(tasks, &CopyOptions::default()).await;

        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].task, task(3));
        for i in [1, 2, 4, 5] {
            assert!(store.contains("lake", &format!("out/{}.log", i)));
            assert!(store.contains("staging", &format!("in/{}.log", i)));
        }
        assert!(!store.contains("lake", "out/3.log"));
    }

    #[tokio::test]
    async fn test_copy_deletes_only_succeeded_sources() {
        let store = MemoryObjectStore::new();
        store.insert("staging", "in/1.log", "a\n");
        store.insert("staging", "in/2.log", "b\n");
        store.set_read_only("lake");

        let engine = BatchEngine::new(Arc::new(store.clone()), 4);
        let mut ok = ReplicationTask::new(
            ObjectLocation::new("staging", "in/1.log"),
            ObjectLocation::new("dest", "out/1.log"),
        );
        ok.source.role = Some("arn:aws:iam::111122223333:role/reader".to_string());
        let denied = task(2);

        let options = CopyOptions {
            delete_on_success: true,
            transform: Some(Arc::new(Upper)),
        };
        let report = engine.copy(vec![ok, denied], &options).await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(store.object("dest", "out/1.log").unwrap(), b"A\n");
        assert!(!store.contains("staging", "in/1.log"));
        assert!(store.contains("staging", "in/2.log"));
        assert_eq!(store.assumed_roles(), vec!["arn:aws:iam::111122223333:role/reader"]);
    }

    #[tokio::test]
    async fn test_delete_chunks_requests() {
        let store = MemoryObjectStore::new();
        let mut sources = Vec::new();
        for i in 0..250 {
            let key = format!("k/{}", i);
            store.insert("a", &key, "x");
            sources.push(ObjectLocation::new("a", key));
        }
        store.insert("b", "k/0", "x");
        sources.push(ObjectLocation::new("b", "k/0"));

        let engine = BatchEngine::new(Arc::new(store.clone()), 3);
        let report = engine.delete(sources).await;

        assert_eq!(report, DeleteReport { succeeded: 251, failed: 0 });
        assert_eq!(store.delete_requests(), 4);
        assert!(store.keys("a").is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_request_counts_whole_chunk() {
        let store = MemoryObjectStore::new();
        store.insert("locked", "k", "x");
        store.set_read_only("locked");
        store.insert("open", "k", "x");

        let engine = BatchEngine::new(Arc::new(store.clone()), 2);
        let sources = vec![
            ObjectLocation::new("locked", "k"),
            ObjectLocation::new("locked", "k2"),
            ObjectLocation::new("open", "k"),
        ];
        let report = engine.delete(sources).await;
        assert_eq!(report, DeleteReport { succeeded: 1, failed: 2 });
    }

    #[test]
    fn test_task_wire_names() {
        let json = r#"{"source":{"bucket":"s","key":"a.gz","role":"arn:r"},"destination":{"bucket":"d","key":"b.gz"}}"#;
        let task: ReplicationTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.source.role.as_deref(), Some("arn:r"));
        assert_eq!(serde_json::to_string(&task).unwrap(), json);
    }
}
