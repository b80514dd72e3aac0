//! Merger stage
//!
//! Compacts the small files of settled partitions into fewer larger ones.
//! Each partition's files are packed into batches no larger than the target
//! size; every batch is merged in place over its first file and recorded as
//! its own ledger task.

use super::{
    group_by_partition, new_execution_name, new_task_id, notify_failure, register_partitions, PartitionObjects,
    RegisterRequest, STATE_MACHINE_NAME,
};
use crate::context::EngineContext;
use crate::jobs::MergerJob;
use crate::ledger::{NewTask, TaskStatus};
use crate::meta::get_pipeline;
use crate::partition::{PartitionAction, PartitionKey};
use crate::storage::{join_key, ObjectLocation, ObjectSummary, ReplicationTask};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use lightengine_common::Result;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

/// Files of one partition merged into a single object
#[derive(Debug, Clone, PartialEq)]
pub struct MergeBatch {
    pub partition: PartitionKey,
    pub objects: Vec<ObjectSummary>,
}

impl MergeBatch {
    pub fn size(&self) -> u64 {
        self.objects.iter().map(|o| o.size.max(0) as u64).sum()
    }

    /// Tasks whose shared destination is the first file of the batch.
    pub fn tasks(&self) -> Vec<ReplicationTask> {
        let Some(first) = self.objects.first() else {
            return Vec::new();
        };
        let destination = ObjectLocation::new(&first.bucket, &first.key);
        self.objects
            .iter()
            .map(|o| ReplicationTask::new(ObjectLocation::new(&o.bucket, &o.key), destination.clone()))
            .collect()
    }
}

/// Pack objects first-fit in key order into bins of at most `target_size`
/// bytes. An object larger than the target gets a bin of its own.
pub fn pack_first_fit(objects: &[ObjectSummary], target_size: u64) -> Vec<Vec<ObjectSummary>> {
    let mut bins: Vec<(u64, Vec<ObjectSummary>)> = Vec::new();
    for object in objects {
        let size = object.size.max(0) as u64;
        match bins
            .iter_mut()
            .find(|(used, _)| used.saturating_add(size) <= target_size)
        {
            Some((used, bin)) => {
                *used += size;
                bin.push(object.clone());
            }
            None => bins.push((size, vec![object.clone()])),
        }
    }
    bins.into_iter().map(|(_, bin)| bin).collect()
}

/// Partitions whose newest object was written at or before `cutoff`.
fn settled(partition: &PartitionObjects, cutoff: Option<DateTime<Utc>>) -> bool {
    let Some(cutoff) = cutoff else {
        return true;
    };
    partition
        .objects
        .iter()
        .filter_map(|o| o.last_modified)
        .all(|modified| modified <= cutoff)
}

/// Batches worth merging: partitions with a single file and bins holding a
/// single file are left alone.
pub fn plan_batches(
    partitions: Vec<PartitionObjects>,
    target_size: u64,
    cutoff: Option<DateTime<Utc>>,
) -> Vec<MergeBatch> {
    partitions
        .into_iter()
        .filter(|p| p.objects.len() > 1 && settled(p, cutoff))
        .flat_map(|p| {
            let key = p.key;
            pack_first_fit(&p.objects, target_size)
                .into_iter()
                .filter(|bin| bin.len() > 1)
                .map(move |objects| MergeBatch {
                    partition: key.clone(),
                    objects,
                })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergerReport {
    pub execution_name: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub batches: usize,
    pub failed_batches: usize,
    pub merged_objects: usize,
    pub partitions: Vec<String>,
    pub failed_statements: usize,
}

/// Run the merger for one pipeline.
#[instrument(skip(ctx, job), fields(pipeline_id = %job.pipeline_id))]
pub async fn run_merger(ctx: &EngineContext, job: MergerJob) -> Result<MergerReport> {
    job.validate()?;
    let meta = get_pipeline(ctx.meta.as_ref(), &job.pipeline_id, &ctx.backoff).await?;

    let execution_name = job.execution_name.clone().unwrap_or_else(new_execution_name);
    let task_id = new_task_id();
    let target_size = job.target_size_bytes.unwrap_or(ctx.config.merge_target_size_bytes);
    let cutoff = job.cutoff(ctx.ledger.now())?;
    let table_prefix = meta.table_prefix();
    let scan_prefix = match job.partition_prefix.as_deref() {
        Some(partition) => join_key([table_prefix.as_str(), partition]),
        None => table_prefix.clone(),
    };

    ctx.ledger
        .start_task(
            NewTask::new(&execution_name, &task_id)
                .api("lightengine: merge-partitions")
                .state_machine(STATE_MACHINE_NAME)
                .state("Merger")
                .pipeline(&meta.pipeline_id)
                .data(json!({
                    "prefix": scan_prefix,
                    "targetSizeBytes": target_size,
                    "olderThanHours": job.older_than_hours,
                })),
        )
        .await?;

    let bucket = &meta.destination.location.bucket;
    let objects = ctx.store.list(bucket, &format!("{}/", scan_prefix)).await?;
    let batches = plan_batches(group_by_partition(&table_prefix, objects), target_size, cutoff);
    debug!(batches = batches.len(), "Planned merge batches");

    let merged: Vec<(PartitionKey, usize, bool)> = stream::iter(batches)
        .map(|batch| merge_batch(ctx, &execution_name, &task_id, &meta.pipeline_id, batch))
        .buffer_unordered(ctx.config.worker_concurrency)
        .collect::<Vec<Result<_>>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    let keys: Vec<PartitionKey> = merged
        .iter()
        .filter(|(_, _, ok)| *ok)
        .map(|(key, _, _)| key.clone())
        .collect();
    let registration = if keys.is_empty() {
        None
    } else {
        let request = RegisterRequest::child_of(ctx, &execution_name, &task_id, &meta.pipeline_id)
            .action(PartitionAction::Add)
            .table(meta.database_name(), meta.table_name());
        Some(register_partitions(ctx, request, keys).await?)
    };

    let (failed_batches, children) = ctx
        .ledger
        .get_subtask_status_count(&execution_name, &task_id, TaskStatus::Failed)
        .await?;
    let status = if failed_batches == 0 {
        TaskStatus::Succeeded
    } else {
        TaskStatus::Failed
    };
    let merged_objects: usize = merged.iter().filter(|(_, _, ok)| *ok).map(|(_, n, _)| n).sum();
    ctx.ledger
        .finish_task(
            &execution_name,
            &task_id,
            status,
            Some(json!({
                "batches": merged.len(),
                "failedBatches": failed_batches,
                "mergedObjects": merged_objects,
                "subtasks": children,
            })),
        )
        .await?;
    notify_failure(ctx, &meta, &execution_name, status).await;

    info!(
        execution = %execution_name,
        batches = merged.len(),
        failed = failed_batches,
        merged_objects,
        "Merger finished"
    );

    Ok(MergerReport {
        execution_name,
        task_id,
        status,
        batches: merged.len(),
        failed_batches,
        merged_objects,
        partitions: registration
            .as_ref()
            .map(|r| r.partitions.clone())
            .unwrap_or_default(),
        failed_statements: registration.as_ref().map_or(0, |r| r.failed_statements()),
    })
}

async fn merge_batch(
    ctx: &EngineContext,
    execution_name: &str,
    parent_task_id: &str,
    pipeline_id: &str,
    batch: MergeBatch,
) -> Result<(PartitionKey, usize, bool)> {
    let task_id = new_task_id();
    let tasks = batch.tasks();
    let sources: Vec<String> = tasks.iter().map(|t| t.source.location().to_string()).collect();
    ctx.ledger
        .start_task(
            NewTask::new(execution_name, &task_id)
                .parent(parent_task_id)
                .api("lightengine: merge")
                .state_machine(STATE_MACHINE_NAME)
                .state("MergeBatch")
                .pipeline(pipeline_id)
                .data(json!({
                    "partition": batch.partition.path(),
                    "sources": sources,
                    "size": batch.size(),
                })),
        )
        .await?;

    let (status, data) = match ctx.batch.merge(&tasks, true).await {
        Ok(destination) => (
            TaskStatus::Succeeded,
            json!({"partition": batch.partition.path(), "destination": destination.to_string(), "merged": tasks.len()}),
        ),
        Err(e) => {
            warn!(partition = %batch.partition.path(), error = %e, "Merge batch failed");
            (
                TaskStatus::Failed,
                json!({"partition": batch.partition.path(), "sources": sources, "error": e.to_string()}),
            )
        }
    };
    ctx.ledger
        .finish_task(execution_name, &task_id, status, Some(data))
        .await?;

    Ok((batch.partition, tasks.len(), status == TaskStatus::Succeeded))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::TaskFilter;
    use crate::meta::tests::alb_pipeline;
    use crate::stages::tests::harness;
    use chrono::{Duration, TimeZone};

    fn summary(key: &str, size: i64) -> ObjectSummary {
        ObjectSummary {
            bucket: "centralized".to_string(),
            key: key.to_string(),
            size,
            last_modified: None,
        }
    }

    fn job(pipeline_id: &str) -> MergerJob {
        MergerJob {
            execution_name: Some("merge-1".to_string()),
            pipeline_id: pipeline_id.to_string(),
            ..MergerJob::default()
        }
    }

    #[test]
    fn test_pack_first_fit() {
        let objects = vec![
            summary("a", 60),
            summary("b", 50),
            summary("c", 30),
            summary("d", 200),
            summary("e", 10),
        ];
        let bins = pack_first_fit(&objects, 100);
        let keys: Vec<Vec<&str>> = bins
            .iter()
            .map(|bin| bin.iter().map(|o| o.key.as_str()).collect())
            .collect();
        assert_eq!(keys, vec![vec!["a", "c", "e"], vec!["b"], vec!["d"]]);
    }

    #[test]
    fn test_plan_skips_single_files_and_recent_partitions() {
        let now = Utc.with_ymd_and_hms(2023, 3, 12, 0, 0, 0).unwrap();
        let old = Some(Utc.with_ymd_and_hms(2023, 3, 11, 0, 0, 0).unwrap());
        let mut recent = summary("datalake/alb/d=2/x", 1);
        recent.last_modified = Some(now);
        let mut settled_a = summary("datalake/alb/d=1/a", 1);
        settled_a.last_modified = old;
        let mut settled_b = summary("datalake/alb/d=1/b", 1);
        settled_b.last_modified = old;

        let partitions = group_by_partition(
            "datalake/alb",
            vec![
                settled_a,
                settled_b,
                recent,
                summary("datalake/alb/d=2/y", 1),
                summary("datalake/alb/d=3/only", 1),
            ],
        );
        let batches = plan_batches(partitions, 100, Some(now - Duration::hours(1)));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].partition.path(), "d=1");
        assert_eq!(batches[0].tasks()[1].destination.key, "datalake/alb/d=1/a");
    }

    #[tokio::test]
    async fn test_merger_compacts_partition() {
        let h = harness();
        h.meta.insert(alb_pipeline("p1"));
        h.catalog.create_table("centralized", "alb");
        h.store.insert("centralized", "datalake/alb/d=1/a.json", "a\n");
        h.store.insert("centralized", "datalake/alb/d=1/b.json", "b\n");
        h.store.insert("centralized", "datalake/alb/d=1/c.json", "c\n");
        h.store.insert("centralized", "datalake/alb/d=2/only.json", "z\n");

        let report = run_merger(&h.ctx, job("p1")).await.unwrap();
        assert_eq!(report.status, TaskStatus::Succeeded);
        assert_eq!(report.batches, 1);
        assert_eq!(report.merged_objects, 3);
        assert_eq!(report.partitions, vec!["d=1"]);

        assert_eq!(
            h.store.keys("centralized"),
            vec!["datalake/alb/d=1/a.json", "datalake/alb/d=2/only.json"]
        );
        let merged = String::from_utf8(h.store.object("centralized", "datalake/alb/d=1/a.json").unwrap()).unwrap();
        assert!(merged.contains('a') && merged.contains('b') && merged.contains('c'));
        assert_eq!(h.catalog.partitions("centralized", "alb"), vec!["d=1"]);

        let batches = h
            .ctx
            .ledger
            .query_item("merge-1", &TaskFilter::children_of(&report.task_id).with_status(TaskStatus::Succeeded))
            .await
            .unwrap();
        assert_eq!(batches.len(), 2);
    }

    #[tokio::test]
    async fn test_merger_with_nothing_to_do() {
        let h = harness();
        h.meta.insert(alb_pipeline("p1"));
        h.store.insert("centralized", "datalake/alb/d=1/only.json", "a\n");

        let report = run_merger(&h.ctx, job("p1")).await.unwrap();
        assert_eq!(report.status, TaskStatus::Succeeded);
        assert_eq!(report.batches, 0);
        assert!(h.catalog.history().is_empty());
    }

    #[tokio::test]
    async fn test_huge_window_is_validation_error() {
        let h = harness();
        h.meta.insert(alb_pipeline("p1"));
        let err = run_merger(
            &h.ctx,
            MergerJob {
                older_than_hours: Some(u64::MAX),
                ..job("p1")
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_validation());
        assert!(h
            .ctx
            .ledger
            .query_item("merge-1", &TaskFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_fails_run() {
        let h = harness();
        h.meta.insert(alb_pipeline("p1"));
        h.catalog.create_table("centralized", "alb");
        h.store.insert("centralized", "datalake/alb/d=1/a.json", "a\n");
        h.store.insert("centralized", "datalake/alb/d=1/b.json", "b\n");
        h.store.set_read_only("centralized");

        let report = run_merger(&h.ctx, job("p1")).await.unwrap();
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.failed_batches, 1);
        assert!(report.partitions.is_empty());
        let parent = h.ctx.ledger.get_item("merge-1", &report.task_id).await.unwrap().unwrap();
        assert_eq!(parent.status, TaskStatus::Failed);
    }
}
