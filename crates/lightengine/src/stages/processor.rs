//! Processor stage
//!
//! Moves newly staged objects into the lake layout. Each object is parsed
//! and enriched on the way through, written as gzip JSON lines under the
//! run's partition, and the new partitions are registered.

use super::{new_execution_name, new_task_id, notify_failure, register_partitions, RegisterRequest, STATE_MACHINE_NAME};
use crate::context::EngineContext;
use crate::enrichment::{Enricher, EnrichmentPlugin};
use crate::jobs::ObjectEvent;
use crate::ledger::{NewTask, TaskStatus};
use crate::meta::{get_pipeline, PipelineMeta};
use crate::parser::{ParseReport, ParserOptions, SourceType};
use crate::partition::{dedupe, PartitionAction, PartitionKey, DEFAULT_PARTITION_VALUE};
use crate::storage::{join_key, CopyOptions, ObjectLocation, ReplicationTask, Transform};
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lightengine_common::{EngineError, Result};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, instrument};

/// Partition dimension filled with the run's start time.
pub const TIME_DIMENSION: &str = "__ds__";

/// Partition dimension filled with the execution name.
pub const EXECUTION_DIMENSION: &str = "__execution_name__";

pub const TIME_DIMENSION_FORMAT: &str = "%Y-%m-%d-%H-%M";

const OUTPUT_SUFFIX: &str = ".json.gz";

const SOURCE_DIGEST_BYTES: usize = 6;

/// Parse-and-enrich body rewrite used while copying staged objects
pub struct ProcessorTransform {
    source_type: SourceType,
    options: ParserOptions,
    plugins: Vec<EnrichmentPlugin>,
    enricher: Arc<Enricher>,
    report: Mutex<ParseReport>,
}

impl ProcessorTransform {
    pub fn new(
        source_type: SourceType,
        options: ParserOptions,
        plugins: Vec<EnrichmentPlugin>,
        enricher: Arc<Enricher>,
    ) -> Self {
        let plugins = enricher.select(&plugins);
        Self {
            source_type,
            options,
            plugins,
            enricher,
            report: Mutex::new(ParseReport::default()),
        }
    }

    /// Counters accumulated over every object transformed so far.
    pub fn report(&self) -> ParseReport {
        *self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transform for ProcessorTransform {
    fn apply(&self, _task: &ReplicationTask, body: Vec<u8>) -> Result<Vec<u8>> {
        let raw = if body.starts_with(&[0x1f, 0x8b]) {
            let mut decoded = Vec::new();
            MultiGzDecoder::new(body.as_slice()).read_to_end(&mut decoded)?;
            decoded
        } else {
            body
        };
        let text = String::from_utf8_lossy(&raw);

        let (mut records, report) = self.source_type.parse_object(&text, &self.options);
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(report);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for record in &mut records {
            self.enricher.enrich(self.source_type, &self.plugins, record);
            encoder.write_all(record.to_json_line().as_bytes())?;
            encoder.write_all(b"\n")?;
        }
        Ok(encoder.finish()?)
    }

    fn content_type(&self) -> Option<&str> {
        Some("application/gzip")
    }
}

/// Partition of one run: time and execution dimensions are derived, the
/// rest come from the table's fixed values. `None` for unpartitioned tables.
pub fn run_partition(meta: &PipelineMeta, started: DateTime<Utc>, execution_name: &str) -> Option<PartitionKey> {
    let table = &meta.destination.table;
    if table.partitions.is_empty() {
        return None;
    }
    let pairs = table
        .partitions
        .iter()
        .map(|dimension| {
            let value = match dimension.as_str() {
                TIME_DIMENSION => started.format(TIME_DIMENSION_FORMAT).to_string(),
                EXECUTION_DIMENSION => execution_name.to_string(),
                other => table
                    .partition_values
                    .get(other)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_PARTITION_VALUE.to_string()),
            };
            (dimension.clone(), urlencoding::encode(&value).into_owned())
        })
        .collect();
    Some(PartitionKey::new(pairs))
}

/// File name without directories and without log/compression extensions.
pub fn object_stem(key: &str) -> &str {
    let mut stem = key.rsplit('/').next().unwrap_or(key);
    loop {
        let trimmed = [".gz", ".log", ".json", ".txt"]
            .iter()
            .find_map(|ext| stem.strip_suffix(ext));
        match trimmed {
            Some(rest) if !rest.is_empty() => stem = rest,
            _ => return stem,
        }
    }
}

/// Short digest of the full source location, so staged objects sharing a
/// file name never land on the same destination key.
pub fn source_digest(bucket: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bucket.as_bytes());
    hasher.update(b"/");
    hasher.update(key.as_bytes());
    hex::encode(&hasher.finalize()[..SOURCE_DIGEST_BYTES])
}

fn destination_key(
    meta: &PipelineMeta,
    partition: Option<&PartitionKey>,
    source_bucket: &str,
    source_key: &str,
) -> String {
    let file = format!(
        "{}-{}{}",
        object_stem(source_key),
        source_digest(source_bucket, source_key),
        OUTPUT_SUFFIX
    );
    let partition_path = partition.map(PartitionKey::path).unwrap_or_default();
    join_key([
        meta.destination.location.prefix.as_str(),
        meta.table_name(),
        partition_path.as_str(),
        file.as_str(),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorReport {
    pub execution_name: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub copied: usize,
    pub failed: usize,
    pub parse: ParseReport,
    pub partitions: Vec<String>,
    pub failed_statements: usize,
}

/// Run the processor for one object-arrival event.
#[instrument(skip(ctx, event), fields(pipeline_id = %pipeline_id, records = event.records.len()))]
pub async fn run_processor(
    ctx: &EngineContext,
    pipeline_id: &str,
    event: &ObjectEvent,
    execution_name: Option<String>,
) -> Result<ProcessorReport> {
    event.validate()?;
    let meta = get_pipeline(ctx.meta.as_ref(), pipeline_id, &ctx.backoff).await?;
    let options = meta.parser_options()?;

    let execution_name = execution_name.unwrap_or_else(new_execution_name);
    let task_id = new_task_id();
    let started = ctx.ledger.now();
    let staging_prefix = if meta.staging.prefix.is_empty() {
        ctx.config.staging_prefix.clone()
    } else {
        meta.staging.prefix.clone()
    };

    ctx.ledger
        .start_task(
            NewTask::new(&execution_name, &task_id)
                .api("lightengine: process")
                .state_machine(STATE_MACHINE_NAME)
                .state("Processor")
                .pipeline(&meta.pipeline_id)
                .data(json!({"records": event.records.len(), "stagingPrefix": staging_prefix})),
        )
        .await?;

    let partition = run_partition(&meta, started, &execution_name);
    let destination_bucket = meta.destination.location.bucket.clone();
    let tasks: Vec<ReplicationTask> = event
        .created_under(&staging_prefix)
        .map(|record| {
            ReplicationTask::new(
                ObjectLocation::new(&record.bucket, &record.key),
                ObjectLocation::new(
                    &destination_bucket,
                    destination_key(&meta, partition.as_ref(), &record.bucket, &record.key),
                ),
            )
        })
        .collect();

    let transform = Arc::new(ProcessorTransform::new(
        meta.source_type(),
        options,
        meta.source.enrichment_plugins.clone(),
        Arc::clone(&ctx.enricher),
    ));
    let copy_options = CopyOptions {
        delete_on_success: ctx.config.delete_staging_on_success,
        transform: Some(transform.clone() as Arc<dyn Transform>),
    };
    let copy = ctx.batch.copy(tasks, &copy_options).await;

    let table_prefix = meta.table_prefix();
    let keys = dedupe(
        copy.succeeded_tasks
            .iter()
            .filter_map(|task| PartitionKey::from_object_key(&table_prefix, &task.destination.key)),
    );

    let registration = if keys.is_empty() {
        None
    } else {
        let request = RegisterRequest::child_of(ctx, &execution_name, &task_id, &meta.pipeline_id)
            .action(PartitionAction::Add)
            .table(meta.database_name(), meta.table_name());
        Some(register_partitions(ctx, request, keys).await?)
    };

    let status = if copy.failed == 0 {
        TaskStatus::Succeeded
    } else {
        TaskStatus::Failed
    };
    let parse = transform.report();
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
                "copied": copy.succeeded,
                "failed": copy.failed,
                "failures": failures,
                "parsed": parse.parsed,
                "skipped": parse.skipped,
            })),
        )
        .await?;
    notify_failure(ctx, &meta, &execution_name, status).await;

    info!(
        execution = %execution_name,
        copied = copy.succeeded,
        failed = copy.failed,
        parsed = parse.parsed,
        skipped = parse.skipped,
        "Processor finished"
    );

    Ok(ProcessorReport {
        execution_name,
        task_id,
        status,
        copied: copy.succeeded,
        failed: copy.failed,
        parse,
        partitions: registration
            .as_ref()
            .map(|r| r.partitions.clone())
            .unwrap_or_default(),
        failed_statements: registration.as_ref().map_or(0, |r| r.failed_statements()),
    })
}
