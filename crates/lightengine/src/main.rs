//! Light Engine - batch ingestion and partition maintenance

use clap::{Parser, Subcommand};
use lightengine::config::EngineConfig;
use lightengine::context::EngineContext;
use lightengine::enrichment::{Enricher, EnrichmentPlugin, GeoIpDatabase};
use lightengine::jobs::{
    read_document, read_input, validate_sources, validate_tasks, ArchiverJob, MergerJob, ObjectEvent,
    PartitionJob,
};
use lightengine::ledger::{TaskFilter, TaskStatus};
use lightengine::parser::{ParserOptions, SourceType};
use lightengine::stages::{run_archiver, run_merger, run_partition_job, run_processor, ProcessorTransform};
use lightengine::storage::reconcile::{read_access_statement, Reconciler};
use lightengine::storage::{
    BatchEngine, CopyOptions, ObjectLocation, ObjectStore, QueueNotification, ReplicationTask, S3ObjectStore,
    Transform,
};
use lightengine_common::logging::{init_logging, LogConfig, LogLevel};
use lightengine_common::{EngineError, Result};
use serde::Serialize;
use serde_json::Value;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "lightengine")]
#[command(author, version, about = "Batch log ingestion, compaction and partition maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process an object-arrival event for a pipeline
    Process {
        #[arg(long)]
        pipeline_id: String,

        /// Event document, or `-` for stdin
        #[arg(long)]
        event: String,

        #[arg(long)]
        execution_name: Option<String>,
    },

    /// Compact small partition files
    MergePartitions {
        #[arg(long)]
        job: String,
    },

    /// Move aged partitions to cold storage
    Archive {
        #[arg(long)]
        job: String,
    },

    /// Add or drop the partitions under a table location
    Partition {
        #[arg(long)]
        job: String,
    },

    /// Copy objects
    Replicate {
        /// JSON array of replication tasks, or `-` for stdin
        #[arg(long)]
        tasks: String,

        #[arg(long)]
        delete_on_success: bool,

        /// Enrichment plugins applied while copying (requires --source-type)
        #[arg(long, value_delimiter = ',')]
        enrich: Vec<String>,

        /// Parse sources as this log type on the way through
        #[arg(long)]
        source_type: Option<String>,
    },

    /// Concatenate objects into the first task's destination
    Merge {
        #[arg(long)]
        tasks: String,

        #[arg(long)]
        delete_on_success: bool,
    },

    /// Delete objects
    Delete {
        /// JSON array of `{bucket, key}`, or `-` for stdin
        #[arg(long)]
        sources: String,
    },

    /// Print the ledger rows of an execution as JSON lines
    Ledger {
        #[arg(long)]
        execution_name: String,

        #[arg(long)]
        parent_task_id: Option<String>,

        #[arg(long)]
        status: Option<String>,
    },

    /// Remove ledger rows past their expiration time
    PurgeLedger,

    /// Add or remove a bucket event notification
    ReconcileNotification {
        #[arg(long)]
        bucket: String,

        #[arg(long)]
        id: String,

        #[arg(long, required_unless_present = "remove")]
        queue_arn: Option<String>,

        #[arg(long)]
        prefix: Option<String>,

        #[arg(long)]
        suffix: Option<String>,

        #[arg(long)]
        remove: bool,
    },

    /// Add or remove a bucket policy statement
    ReconcilePolicy {
        #[arg(long)]
        bucket: String,

        /// Policy statement document carrying a `Sid`
        #[arg(long, required_unless_present = "principal", conflicts_with = "principal")]
        statement: Option<String>,

        /// Grant this principal read and delete access under `--prefix`
        #[arg(long, requires = "prefix")]
        principal: Option<String>,

        #[arg(long)]
        prefix: Option<String>,

        #[arg(long, default_value = "LightEngineReadAccess")]
        sid: String,

        #[arg(long)]
        remove: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("lightengine")
        .filter_directives("aws_config=warn,aws_smithy_runtime=warn,sqlx=warn,hyper=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI keeps working without logging
    let _ = init_logging(&log_config);

    let code = match execute(cli.command).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            if e.is_validation() {
                2
            } else {
                1
            }
        }
    };
    process::exit(code);
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn object_store(config: &EngineConfig) -> Result<Arc<dyn ObjectStore>> {
    Ok(Arc::new(S3ObjectStore::new(config.storage.clone()).await?))
}

/// Run one command; `Ok(false)` means it ran but reported failures.
///
/// Input documents are validated before configuration is loaded.
async fn execute(command: Command) -> Result<bool> {
    match command {
        Command::Process {
            pipeline_id,
            event,
            execution_name,
        } => {
            let event = ObjectEvent::parse(&read_input(&event)?)?;
            event.validate()?;
            let ctx = EngineContext::from_config(EngineConfig::load()?).await?;
            let report = run_processor(&ctx, &pipeline_id, &event, execution_name).await?;
            print_json(&report)?;
            Ok(report.status == TaskStatus::Succeeded)
        }

        Command::MergePartitions { job } => {
            let job: MergerJob = read_document(&job)?;
            job.validate()?;
            let ctx = EngineContext::from_config(EngineConfig::load()?).await?;
            let report = run_merger(&ctx, job).await?;
            print_json(&report)?;
            Ok(report.status == TaskStatus::Succeeded)
        }

        Command::Archive { job } => {
            let job: ArchiverJob = read_document(&job)?;
            job.validate()?;
            let ctx = EngineContext::from_config(EngineConfig::load()?).await?;
            let report = run_archiver(&ctx, job).await?;
            print_json(&report)?;
            Ok(report.status == TaskStatus::Succeeded)
        }

        Command::Partition { job } => {
            let job: PartitionJob = read_document(&job)?;
            job.validate()?;
            let ctx = EngineContext::from_config(EngineConfig::load()?).await?;
            let report = run_partition_job(&ctx, job).await?;
            print_json(&report)?;
            Ok(true)
        }

        Command::Replicate {
            tasks,
            delete_on_success,
            enrich,
            source_type,
        } => {
            let tasks: Vec<ReplicationTask> = read_document(&tasks)?;
            validate_tasks(&tasks)?;
            let plugins = EnrichmentPlugin::parse_list(&enrich.join(","))?;
            let source_type: Option<SourceType> = source_type.map(|raw| raw.parse()).transpose()?;
            if source_type.is_none() && !plugins.is_empty() {
                return Err(EngineError::Validation("--enrich requires --source-type".to_string()));
            }
            let config = EngineConfig::load()?;
            let transform = match source_type {
                Some(source_type) => {
                    let geo_ip = match &config.geoip_database_path {
                        Some(path) => Some(Arc::new(GeoIpDatabase::open(path)?)),
                        None => None,
                    };
                    let enricher = Arc::new(Enricher::new(config.enrichment_plugins.iter().copied(), geo_ip));
                    Some(Arc::new(ProcessorTransform::new(
                        source_type,
                        ParserOptions::default(),
                        plugins,
                        enricher,
                    )) as Arc<dyn Transform>)
                }
                None => None,
            };

            let engine = BatchEngine::new(object_store(&config).await?, config.worker_concurrency);
            let options = CopyOptions {
                delete_on_success,
                transform,
            };
            let report = engine.copy(tasks, &options).await;
            print_json(&report)?;
            Ok(report.failed == 0)
        }

        Command::Merge {
            tasks,
            delete_on_success,
        } => {
            let tasks: Vec<ReplicationTask> = read_document(&tasks)?;
            validate_tasks(&tasks)?;
            let config = EngineConfig::load()?;
            let engine = BatchEngine::new(object_store(&config).await?, config.worker_concurrency);
            let destination = engine.merge(&tasks, delete_on_success).await?;
            print_json(&destination)?;
            Ok(true)
        }

        Command::Delete { sources } => {
            let sources: Vec<ObjectLocation> = read_document(&sources)?;
            validate_sources(&sources)?;
            let config = EngineConfig::load()?;
            let engine = BatchEngine::new(object_store(&config).await?, config.worker_concurrency);
            let report = engine.delete(sources).await;
            print_json(&report)?;
            Ok(report.failed == 0)
        }

        Command::Ledger {
            execution_name,
            parent_task_id,
            status,
        } => {
            let mut filter = match parent_task_id {
                Some(parent) => TaskFilter::children_of(&parent),
                None => TaskFilter::default(),
            };
            if let Some(status) = status {
                filter = filter.with_status(status.parse()?);
            }
            let ctx = EngineContext::from_config(EngineConfig::load()?).await?;
            for task in ctx.ledger.query_item(&execution_name, &filter).await? {
                println!("{}", serde_json::to_string(&task)?);
            }
            Ok(true)
        }

        Command::PurgeLedger => {
            let ctx = EngineContext::from_config(EngineConfig::load()?).await?;
            let purged = ctx.ledger.purge_expired().await?;
            info!(purged, "Ledger purged");
            print_json(&serde_json::json!({ "purged": purged }))?;
            Ok(true)
        }

        Command::ReconcileNotification {
            bucket,
            id,
            queue_arn,
            prefix,
            suffix,
            remove,
        } => {
            if !remove && queue_arn.is_none() {
                return Err(EngineError::missing_field("queue-arn"));
            }
            let config = EngineConfig::load()?;
            let reconciler = Reconciler::new(object_store(&config).await?, Default::default());
            if remove {
                reconciler.remove_notification(&bucket, &id).await?;
                info!(bucket = %bucket, id = %id, "Notification removed");
            } else {
                let queue_arn = queue_arn.ok_or_else(|| EngineError::missing_field("queue-arn"))?;
                let entry = QueueNotification {
                    id: id.clone(),
                    queue_arn,
                    events: vec!["s3:ObjectCreated:*".to_string()],
                    prefix,
                    suffix,
                };
                reconciler.ensure_notification(&bucket, entry).await?;
                info!(bucket = %bucket, id = %id, "Notification in place");
            }
            Ok(true)
        }

        Command::ReconcilePolicy {
            bucket,
            statement,
            principal,
            prefix,
            sid,
            remove,
        } => {
            let statement: Value = match (statement, principal) {
                (Some(path), _) => read_document(&path)?,
                (None, Some(principal)) => {
                    read_access_statement(&sid, &principal, &bucket, prefix.as_deref().unwrap_or_default())
                }
                (None, None) => return Err(EngineError::missing_field("statement")),
            };
            let config = EngineConfig::load()?;
            let reconciler = Reconciler::new(object_store(&config).await?, Default::default());
            if remove {
                let sid = statement
                    .get("Sid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EngineError::missing_field("Sid"))?;
                reconciler.remove_policy_statement(&bucket, sid).await?;
                info!(bucket = %bucket, sid, "Policy statement removed");
            } else {
                reconciler.ensure_policy_statement(&bucket, statement).await?;
                info!(bucket = %bucket, "Policy statement in place");
            }
            Ok(true)
        }
    }
}
