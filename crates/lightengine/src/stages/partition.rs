//! Partition registration
//!
//! Renders ADD/DROP DDL for a set of partitions, submits each statement to
//! the catalog and records one ledger task per statement. A failed
//! statement is recorded with its error and does not stop its siblings; the
//! registration itself still finishes Succeeded.

use super::{new_task_id, STATE_MACHINE_NAME};
use crate::context::EngineContext;
use crate::jobs::PartitionJob;
use crate::ledger::{NewTask, TaskStatus};
use crate::partition::{
    dedupe, execute_and_wait, render_ddl, PartitionAction, PartitionKey, QueryContext, QueryOutcome, QueryState,
};
use crate::storage::join_key;
use futures::stream::{self, StreamExt};
use lightengine_common::{EngineError, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

/// Where a registration sits in the ledger and what it applies
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub execution_name: String,
    pub task_id: String,
    pub parent_task_id: String,
    pub state_machine_name: String,
    pub state_name: String,
    pub api: String,
    pub pipeline_id: String,
    pub action: PartitionAction,
    pub database: String,
    pub table: String,
    pub context: QueryContext,
}

impl RegisterRequest {
    /// Registration as a child of a stage task.
    pub fn child_of(ctx: &EngineContext, execution_name: &str, parent_task_id: &str, pipeline_id: &str) -> Self {
        Self {
            execution_name: execution_name.to_string(),
            task_id: new_task_id(),
            parent_task_id: parent_task_id.to_string(),
            state_machine_name: STATE_MACHINE_NAME.to_string(),
            state_name: "RegisterPartitions".to_string(),
            api: "lightengine: partition".to_string(),
            pipeline_id: pipeline_id.to_string(),
            action: PartitionAction::Add,
            database: ctx.config.catalog.database.clone(),
            table: String::new(),
            context: ctx.config.catalog.context(),
        }
    }

    pub fn action(mut self, action: PartitionAction) -> Self {
        self.action = action;
        self
    }

    pub fn table(mut self, database: &str, table: &str) -> Self {
        self.database = database.to_string();
        self.context.database = database.to_string();
        self.table = table.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementReport {
    pub task_id: String,
    pub sql: String,
    pub query_id: Option<String>,
    pub state: QueryState,
    pub error: Option<String>,
}

impl StatementReport {
    pub fn succeeded(&self) -> bool {
        self.state == QueryState::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReport {
    pub execution_name: String,
    pub task_id: String,
    pub action: PartitionAction,
    pub partitions: Vec<String>,
    pub statements: Vec<StatementReport>,
}

impl RegistrationReport {
    pub fn failed_statements(&self) -> usize {
        self.statements.iter().filter(|s| !s.succeeded()).count()
    }
}

/// Apply `keys` to the catalog under a new ledger task.
#[instrument(skip(ctx, request, keys), fields(table = %request.table, action = %request.action))]
pub async fn register_partitions(
    ctx: &EngineContext,
    request: RegisterRequest,
    keys: Vec<PartitionKey>,
) -> Result<RegistrationReport> {
    let keys = dedupe(keys);
    let statements = render_ddl(
        request.action,
        &request.database,
        &request.table,
        &keys,
        ctx.config.catalog.ddl_batch_size,
    )?;
    let partitions: Vec<String> = keys.iter().map(PartitionKey::path).collect();

    ctx.ledger
        .start_task(
            NewTask::new(&request.execution_name, &request.task_id)
                .parent(&request.parent_task_id)
                .api(&request.api)
                .state_machine(&request.state_machine_name)
                .state(&request.state_name)
                .pipeline(&request.pipeline_id)
                .data(json!({
                    "action": request.action,
                    "database": request.database,
                    "table": request.table,
                    "partitions": partitions,
                })),
        )
        .await?;

    let reports: Vec<StatementReport> = stream::iter(statements)
        .map(|sql| run_statement(ctx, &request, sql))
        .buffered(ctx.config.worker_concurrency)
        .collect::<Vec<Result<StatementReport>>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    let failed = reports.iter().filter(|r| !r.succeeded()).count();
    if failed > 0 {
        warn!(failed, total = reports.len(), "Some partition statements failed");
    }
    ctx.ledger
        .finish_task(
            &request.execution_name,
            &request.task_id,
            TaskStatus::Succeeded,
            Some(json!({
                "action": request.action,
                "database": request.database,
                "table": request.table,
                "partitions": partitions,
                "statements": reports.len(),
                "failedStatements": failed,
            })),
        )
        .await?;
    info!(partitions = partitions.len(), statements = reports.len(), "Partitions registered");

    Ok(RegistrationReport {
        execution_name: request.execution_name,
        task_id: request.task_id,
        action: request.action,
        partitions,
        statements: reports,
    })
}

async fn run_statement(ctx: &EngineContext, request: &RegisterRequest, sql: String) -> Result<StatementReport> {
    let task_id = new_task_id();
    ctx.ledger
        .start_task(
            NewTask::new(&request.execution_name, &task_id)
                .parent(&request.task_id)
                .api("catalog: StartQueryExecution")
                .state_machine(&request.state_machine_name)
                .state(&request.state_name)
                .pipeline(&request.pipeline_id)
                .data(json!(sql)),
        )
        .await?;

    let outcome = execute_and_wait(
        ctx.catalog.as_ref(),
        &sql,
        &request.context,
        ctx.config.catalog.poll_interval(),
        ctx.config.catalog.timeout(),
    )
    .await
    .unwrap_or_else(|e| QueryOutcome {
        query_id: String::new(),
        state: QueryState::Failed,
        error: Some(e.to_string()),
    });

    let status = if outcome.succeeded() {
        TaskStatus::Succeeded
    } else {
        TaskStatus::Failed
    };
    ctx.ledger
        .finish_task(
            &request.execution_name,
            &task_id,
            status,
            Some(json!({
                "sql": sql,
                "queryId": outcome.query_id,
                "state": outcome.state,
                "error": outcome.error,
            })),
        )
        .await?;

    Ok(StatementReport {
        task_id,
        sql,
        query_id: (!outcome.query_id.is_empty()).then_some(outcome.query_id),
        state: outcome.state,
        error: outcome.error,
    })
}

/// Run a partition ADD/DROP job: derive the partitions present under the
/// table location and apply them.
#[instrument(skip(ctx, job), fields(execution = %job.execution_name, table = %job.table_name))]
pub async fn run_partition_job(ctx: &EngineContext, job: PartitionJob) -> Result<RegistrationReport> {
    job.validate()?;
    let (bucket, table_prefix) = job.table_location()?;
    let scan_prefix = join_key([table_prefix.as_str(), job.partition_prefix.as_str()]);

    let objects = ctx.store.list(&bucket, &format!("{}/", scan_prefix)).await?;
    if objects.is_empty() {
        return Err(EngineError::Storage(format!(
            "no objects under s3://{}/{}",
            bucket, scan_prefix
        )));
    }
    let keys: Vec<PartitionKey> = objects
        .iter()
        .filter_map(|object| PartitionKey::from_object_key(&table_prefix, &object.key))
        .collect();

    let request = RegisterRequest {
        execution_name: job.execution_name.clone(),
        task_id: job.task_id.clone().unwrap_or_else(new_task_id),
        parent_task_id: job.extra.parent_task_id.clone(),
        state_machine_name: job.extra.state_machine_name.clone(),
        state_name: job.extra.state_name.clone(),
        api: job.extra.api.clone(),
        pipeline_id: String::new(),
        action: job.action,
        database: job.database.clone(),
        table: job.table_name.clone(),
        context: QueryContext {
            database: job.database.clone(),
            work_group: job.work_group.clone(),
            output_location: job.output_location.clone(),
        },
    };
    register_partitions(ctx, request, keys).await
}
