//! Archiver stage
//!
//! Moves partitions whose time dimension has aged past the retention window
//! into cold storage and drops them from the catalog. A partition is only
//! dropped once every one of its objects has moved.

use super::processor::{TIME_DIMENSION, TIME_DIMENSION_FORMAT};
use super::{
    group_by_partition, new_execution_name, new_task_id, notify_failure, register_partitions, PartitionObjects,
    RegisterRequest, STATE_MACHINE_NAME,
};
use crate::context::EngineContext;
use crate::jobs::ArchiverJob;
use crate::ledger::{NewTask, TaskStatus};
use crate::meta::{get_pipeline, PipelineMeta};
use crate::partition::{PartitionAction, PartitionKey};
use crate::storage::{join_key, CopyOptions, ObjectLocation, ReplicationTask};
use chrono::{DateTime, NaiveDateTime, Utc};
use lightengine_common::Result;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

/// Start of the partition's time window, if it carries a readable one.
pub fn partition_time(key: &PartitionKey) -> Option<DateTime<Utc>> {
    let raw = key.value(TIME_DIMENSION)?;
    let value = urlencoding::decode(raw).ok()?;
    NaiveDateTime::parse_from_str(&value, TIME_DIMENSION_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Partitions strictly older than `cutoff`. Partitions without a time
/// dimension are never archived.
pub fn aged_partitions(partitions: Vec<PartitionObjects>, cutoff: DateTime<Utc>) -> Vec<PartitionObjects> {
    partitions
        .into_iter()
        .filter(|p| partition_time(&p.key).is_some_and(|time| time < cutoff))
        .collect()
}

/// Archive bucket and prefix: the pipeline's own, else the engine default.
fn archive_location(ctx: &EngineContext, meta: &PipelineMeta) -> (String, String) {
    match &meta.archive {
        Some(location) if !location.bucket.is_empty() => (location.bucket.clone(), location.prefix.clone()),
        _ => (ctx.config.archive_bucket.clone(), ctx.config.archive_prefix.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiverReport {
    pub execution_name: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub archived: usize,
    pub failed: usize,
    pub dropped: Vec<String>,
    pub failed_statements: usize,
}

/// Run the archiver for one pipeline.
#[instrument(skip(ctx, job), fields(pipeline_id = %job.pipeline_id))]
pub async fn run_archiver(ctx: &EngineContext, job: ArchiverJob) -> Result<ArchiverReport> {
    job.validate()?;
    let meta = get_pipeline(ctx.meta.as_ref(), &job.pipeline_id, &ctx.backoff).await?;
    let older_than_days = job.older_than_days.unwrap_or_default();
    let cutoff = job.cutoff(ctx.ledger.now())?;

    let execution_name = job.execution_name.clone().unwrap_or_else(new_execution_name);
    let task_id = new_task_id();
    let (archive_bucket, archive_prefix) = archive_location(ctx, &meta);

    ctx.ledger
        .start_task(
            NewTask::new(&execution_name, &task_id)
                .api("lightengine: archive")
                .state_machine(STATE_MACHINE_NAME)
                .state("Archiver")
                .pipeline(&meta.pipeline_id)
                .data(json!({
                    "olderThanDays": older_than_days,
                    "cutoff": cutoff,
                    "archive": format!("s3://{}/{}", archive_bucket, archive_prefix),
                })),
        )
        .await?;

    let table_prefix = meta.table_prefix();
    let bucket = &meta.destination.location.bucket;
    let objects = ctx.store.list(bucket, &format!("{}/", table_prefix)).await?;
    let aged = aged_partitions(group_by_partition(&table_prefix, objects), cutoff);
    debug!(partitions = aged.len(), %cutoff, "Selected aged partitions");

    let tasks: Vec<ReplicationTask> = aged
        .iter()
        .flat_map(|p| p.objects.iter())
        .map(|object| {
            let relative = object
                .key
                .strip_prefix(&table_prefix)
                .unwrap_or(&object.key)
                .trim_start_matches('/');
            ReplicationTask::new(
                ObjectLocation::new(&object.bucket, &object.key),
                ObjectLocation::new(
                    &archive_bucket,
                    join_key([archive_prefix.as_str(), meta.table_name(), relative]),
                ),
            )
        })
        .collect();

    let options = CopyOptions {
        delete_on_success: true,
        transform: None,
    };
    let copy = ctx.batch.copy(tasks, &options).await;

    let incomplete: BTreeSet<String> = copy
        .failures
        .iter()
        .filter_map(|f| PartitionKey::from_object_key(&table_prefix, &f.task.source.key))
        .map(|key| key.path())
        .collect();
    let moved: Vec<PartitionKey> = aged
        .into_iter()
        .map(|p| p.key)
        .filter(|key| !incomplete.contains(&key.path()))
        .collect();

    let registration = if moved.is_empty() {
        None
    } else {
        let request = RegisterRequest::child_of(ctx, &execution_name, &task_id, &meta.pipeline_id)
            .action(PartitionAction::Drop)
            .table(meta.database_name(), meta.table_name());
        Some(register_partitions(ctx, request, moved).await?)
    };

    let status = if copy.failed == 0 {
        TaskStatus::Succeeded
    } else {
        TaskStatus::Failed
    };
    let failures: Vec<String> = copy
        .failures
        .iter()
        .map(|f| format!("{}: {}", f.task.source.location(), f.error))
        .collect();
    ctx.ledger
        .finish_task(
            &execution_name,
            &task_id,
            status,
            Some(json!({
                "archived": copy.succeeded,
                "failed": copy.failed,
                "failures": failures,
                "incompletePartitions": incomplete,
            })),
        )
        .await?;
    notify_failure(ctx, &meta, &execution_name, status).await;

    info!(
        execution = %execution_name,
        archived = copy.succeeded,
        failed = copy.failed,
        "Archiver finished"
    );

    Ok(ArchiverReport {
        execution_name,
        task_id,
        status,
        archived: copy.succeeded,
        failed: copy.failed,
        dropped: registration
            .as_ref()
            .map(|r| r.partitions.clone())
            .unwrap_or_default(),
        failed_statements: registration.as_ref().map_or(0, |r| r.failed_statements()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::meta::tests::alb_pipeline;
    use crate::meta::LocationMeta;
    use crate::stages::tests::harness;
    use chrono::TimeZone;

    const OLD: &str = "datalake/alb/__ds__=2020-01-01-00-00/region=us-east-1/__execution_name__=e1";
    const NEW: &str = "datalake/alb/__ds__=2999-01-01-00-00/region=us-east-1/__execution_name__=e2";

    fn job(days: u64) -> ArchiverJob {
        ArchiverJob {
            execution_name: Some("archive-1".to_string()),
            pipeline_id: "p1".to_string(),
            older_than_days: Some(days),
        }
    }

    #[test]
    fn test_partition_time() {
        let key = PartitionKey::parse("__ds__=2023-03-11-20-01/region=x").unwrap();
        assert_eq!(
            partition_time(&key),
            Some(Utc.with_ymd_and_hms(2023, 3, 11, 20, 1, 0).unwrap())
        );
        assert!(partition_time(&PartitionKey::parse("region=x").unwrap()).is_none());
        assert!(partition_time(&PartitionKey::parse("__ds__=yesterday").unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_archiver_moves_and_drops_old_partitions() {
        let h = harness();
        h.meta.insert(alb_pipeline("p1"));
        h.catalog.create_table("centralized", "alb");
        h.store.insert("centralized", &format!("{}/a.json.gz", OLD), "a");
        h.store.insert("centralized", &format!("{}/b.json.gz", OLD), "b");
        h.store.insert("centralized", &format!("{}/c.json.gz", NEW), "c");

        let report = run_archiver(&h.ctx, job(30)).await.unwrap();
        assert_eq!(report.status, TaskStatus::Succeeded);
        assert_eq!(report.archived, 2);
        assert_eq!(report.dropped.len(), 1);
        assert!(report.dropped[0].starts_with("__ds__=2020-01-01-00-00"));

        assert_eq!(h.store.keys("centralized").len(), 3);
        assert!(h.store.contains(
            "centralized",
            "archive/alb/__ds__=2020-01-01-00-00/region=us-east-1/__execution_name__=e1/a.json.gz"
        ));
        assert!(!h.store.contains("centralized", &format!("{}/a.json.gz", OLD)));
        assert!(h.store.contains("centralized", &format!("{}/c.json.gz", NEW)));
        assert!(h.catalog.history().iter().any(|sql| sql.contains("DROP IF EXISTS")));
    }

    #[tokio::test]
    async fn test_pipeline_archive_location() {
        let h = harness();
        let mut meta = alb_pipeline("p1");
        meta.archive = Some(LocationMeta {
            bucket: "cold".to_string(),
            prefix: "glacier".to_string(),
        });
        h.meta.insert(meta);
        h.catalog.create_table("centralized", "alb");
        h.store.insert("centralized", &format!("{}/a.json.gz", OLD), "a");

        run_archiver(&h.ctx, job(1)).await.unwrap();
        assert_eq!(
            h.store.keys("cold"),
            vec!["glacier/alb/__ds__=2020-01-01-00-00/region=us-east-1/__execution_name__=e1/a.json.gz"]
        );
    }

    #[tokio::test]
    async fn test_incomplete_partition_is_kept() {
        let h = harness();
        let mut meta = alb_pipeline("p1");
        meta.archive = Some(LocationMeta {
            bucket: "cold".to_string(),
            prefix: "glacier".to_string(),
        });
        h.meta.insert(meta);
        h.catalog.create_table("centralized", "alb");
        h.store.insert("centralized", &format!("{}/a.json.gz", OLD), "a");
        h.store.set_read_only("cold");

        let report = run_archiver(&h.ctx, job(1)).await.unwrap();
        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.dropped.is_empty());
        assert!(h.catalog.history().is_empty());
        assert!(h.store.contains("centralized", &format!("{}/a.json.gz", OLD)));
    }

    #[tokio::test]
    async fn test_huge_retention_is_validation_error() {
        let h = harness();
        h.meta.insert(alb_pipeline("p1"));
        h.store.insert("centralized", &format!("{}/a.json.gz", OLD), "a");

        let err = run_archiver(&h.ctx, job(200_000_000)).await.unwrap_err();
        assert!(err.is_validation());
        assert!(h.store.contains("centralized", &format!("{}/a.json.gz", OLD)));
    }

    #[tokio::test]
    async fn test_missing_retention_is_validation_error() {
        let h = harness();
        let err = run_archiver(&h.ctx, ArchiverJob { older_than_days: None, ..job(1) })
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
