//! Pipeline stages
//!
//! Each stage is one stateless invocation: it opens a ledger task, does its
//! work over the bounded worker pool, and closes the task. Partition
//! registration is shared: it runs as a child task whose own children are
//! the individual DDL statements.
//!
//! ```text
//! Processor (parent)
//! └── RegisterPartitions
//!     ├── ALTER TABLE ... ADD IF NOT EXISTS PARTITION (...) ...;
//!     └── ...
//! ```

pub mod archiver;
pub mod merger;
pub mod partition;
pub mod processor;

pub use archiver::{run_archiver, ArchiverReport};
pub use merger::{run_merger, MergerReport};
pub use partition::{register_partitions, run_partition_job, RegisterRequest, RegistrationReport, StatementReport};
pub use processor::{run_processor, source_digest, ProcessorReport, ProcessorTransform};

use crate::context::EngineContext;
use crate::ledger::TaskStatus;
use crate::meta::PipelineMeta;
use crate::notify::{build_notice, NoticeRequest, DEFAULT_RECENT_TASKS};
use crate::partition::PartitionKey;
use crate::storage::ObjectSummary;
use std::collections::BTreeMap;
use tracing::warn;

/// State machine name recorded on stage tasks.
pub const STATE_MACHINE_NAME: &str = "LightEngine";

pub fn new_execution_name() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Objects of one partition under a table prefix
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionObjects {
    pub key: PartitionKey,
    pub objects: Vec<ObjectSummary>,
}

/// Group listed objects by partition; objects outside any partition are
/// left out. Partitions come back in path order, objects in key order.
pub fn group_by_partition(table_prefix: &str, objects: Vec<ObjectSummary>) -> Vec<PartitionObjects> {
    let mut grouped: BTreeMap<String, PartitionObjects> = BTreeMap::new();
    for object in objects {
        let Some(key) = PartitionKey::from_object_key(table_prefix, &object.key) else {
            continue;
        };
        grouped
            .entry(key.path())
            .or_insert_with(|| PartitionObjects {
                key,
                objects: Vec::new(),
            })
            .objects
            .push(object);
    }

    grouped
        .into_values()
        .map(|mut partition| {
            partition.objects.sort_by(|a, b| a.key.cmp(&b.key));
            partition
        })
        .collect()
}

/// Send a failure notice for a run; delivery problems are only logged.
pub async fn notify_failure(ctx: &EngineContext, meta: &PipelineMeta, execution_name: &str, status: TaskStatus) {
    if status != TaskStatus::Failed {
        return;
    }
    let request = NoticeRequest {
        pipeline_id: &meta.pipeline_id,
        execution_name,
        state_machine_name: STATE_MACHINE_NAME,
        notification: meta.notification.as_ref(),
        console_url_template: &ctx.config.console_url_template,
        recent_limit: DEFAULT_RECENT_TASKS,
    };
    let delivered = match build_notice(&ctx.ledger, request).await {
        Ok(notice) => ctx.notifier.notify(&notice).await,
        Err(e) => Err(e),
    };
    if let Err(e) = delivered {
        warn!(execution = %execution_name, error = %e, "Failure notification not delivered");
    }
}
