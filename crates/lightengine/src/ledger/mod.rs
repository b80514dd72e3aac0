//! Execution lineage ledger
//!
//! Every stage step is recorded as an [`ExecutionTask`] keyed by
//! `(executionName, taskId)`. Tasks form a tree through `parentTaskId`; a
//! fan-out step creates children and the parent later aggregates their
//! statuses with [`Ledger::get_subtask_status_count`].
//!
//! [`Ledger`] owns the record lifecycle (TTL stamping, status transitions);
//! a [`LedgerStore`] only persists rows.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lightengine_common::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Default record lifetime (30 days).
pub const DEFAULT_TTL_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
    #[serde(rename = "Timed_out")]
    TimedOut,
    Aborted,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::TimedOut,
        TaskStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "Running",
            TaskStatus::Succeeded => "Succeeded",
            TaskStatus::Failed => "Failed",
            TaskStatus::TimedOut => "Timed_out",
            TaskStatus::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EngineError::Ledger(format!("unknown task status '{}'", s)))
    }
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTask {
    pub execution_name: String,
    pub task_id: String,
    #[serde(default)]
    pub parent_task_id: String,
    #[serde(rename = "API", default)]
    pub api: String,
    #[serde(default)]
    pub state_machine_name: String,
    #[serde(default)]
    pub state_name: String,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub expiration_time: DateTime<Utc>,
}

impl ExecutionTask {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.execution_name, &self.task_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    pub execution_name: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(execution_name: &str, task_id: &str) -> Self {
        Self {
            execution_name: execution_name.to_string(),
            task_id: task_id.to_string(),
        }
    }
}

/// Fields of a task about to start; the ledger fills in status and times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub execution_name: String,
    pub task_id: String,
    pub parent_task_id: String,
    pub api: String,
    pub state_machine_name: String,
    pub state_name: String,
    pub pipeline_id: String,
    pub data: serde_json::Value,
}

impl NewTask {
    pub fn new(execution_name: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            execution_name: execution_name.into(),
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = parent_task_id.into();
        self
    }

    pub fn api(mut self, api: impl Into<String>) -> Self {
        self.api = api.into();
        self
    }

    pub fn state_machine(mut self, state_machine_name: impl Into<String>) -> Self {
        self.state_machine_name = state_machine_name.into();
        self
    }

    pub fn state(mut self, state_name: impl Into<String>) -> Self {
        self.state_name = state_name.into();
        self
    }

    pub fn pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = pipeline_id.into();
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Equality predicates for [`Ledger::query_item`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub parent_task_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub state_name: Option<String>,
    pub pipeline_id: Option<String>,
}

impl TaskFilter {
    pub fn children_of(parent_task_id: &str) -> Self {
        Self {
            parent_task_id: Some(parent_task_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, task: &ExecutionTask) -> bool {
        self.parent_task_id
            .as_ref()
            .map_or(true, |p| *p == task.parent_task_id)
            && self.status.map_or(true, |s| s == task.status)
            && self.state_name.as_ref().map_or(true, |s| *s == task.state_name)
            && self.pipeline_id.as_ref().map_or(true, |p| *p == task.pipeline_id)
    }
}

/// Row persistence behind the ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert or replace a row.
    async fn put(&self, task: &ExecutionTask) -> Result<()>;

    /// Overwrite an existing row; `false` when no row has the key.
    async fn update(&self, task: &ExecutionTask) -> Result<bool>;

    /// Row by key, including expired rows.
    async fn get(&self, key: &TaskKey) -> Result<Option<ExecutionTask>>;

    async fn delete(&self, keys: &[TaskKey]) -> Result<u64>;

    /// Unexpired rows of one execution matching `filter`, ordered by start
    /// time then task id.
    async fn query(
        &self,
        execution_name: &str,
        filter: &TaskFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionTask>>;

    /// Remove rows expired at `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Ledger service
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    ttl: Duration,
    clock: fn() -> DateTime<Utc>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000)),
            clock: Utc::now,
        }
    }

    /// In-memory ledger with the default TTL.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new()), DEFAULT_TTL_SECS)
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Store a new record. `expirationTime` is always recomputed from the
    /// current time and TTL.
    #[instrument(skip(self, task), fields(execution = %task.execution_name, task = %task.task_id))]
    pub async fn put_item(&self, mut task: ExecutionTask) -> Result<ExecutionTask> {
        task.expiration_time = self.now() + self.ttl;
        self.store.put(&task).await?;
        debug!(status = %task.status, "Ledger row written");
        Ok(task)
    }

    /// Overwrite a record. The stored `expirationTime` is kept.
    #[instrument(skip(self, task), fields(execution = %task.execution_name, task = %task.task_id))]
    pub async fn update_item(&self, mut task: ExecutionTask) -> Result<ExecutionTask> {
        let existing = self.require(&task.execution_name, &task.task_id).await?;
        task.expiration_time = existing.expiration_time;
        if !self.store.update(&task).await? {
            return Err(EngineError::TaskNotFound {
                execution_name: task.execution_name,
                task_id: task.task_id,
            });
        }
        Ok(task)
    }

    /// Unexpired record by key.
    pub async fn get_item(&self, execution_name: &str, task_id: &str) -> Result<Option<ExecutionTask>> {
        let now = self.now();
        Ok(self
            .store
            .get(&TaskKey::new(execution_name, task_id))
            .await?
            .filter(|task| !task.is_expired(now)))
    }

    pub async fn delete_item(&self, execution_name: &str, task_id: &str) -> Result<bool> {
        Ok(self.store.delete(&[TaskKey::new(execution_name, task_id)]).await? > 0)
    }

    pub async fn batch_delete(&self, keys: &[TaskKey]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.store.delete(keys).await
    }

    pub async fn query_item(&self, execution_name: &str, filter: &TaskFilter) -> Result<Vec<ExecutionTask>> {
        self.store.query(execution_name, filter, self.now()).await
    }

    pub async fn query_subtasks(&self, execution_name: &str, parent_task_id: &str) -> Result<Vec<ExecutionTask>> {
        self.query_item(execution_name, &TaskFilter::children_of(parent_task_id))
            .await
    }

    /// `(children with status, all children)` of a parent task.
    pub async fn get_subtask_status_count(
        &self,
        execution_name: &str,
        parent_task_id: &str,
        status: TaskStatus,
    ) -> Result<(usize, usize)> {
        let children = self.query_subtasks(execution_name, parent_task_id).await?;
        let matching = children.iter().filter(|t| t.status == status).count();
        Ok((matching, children.len()))
    }

    /// Open a task as Running. A key that already has a record cannot be
    /// started again. Starting a root task also purges expired rows.
    pub async fn start_task(&self, new: NewTask) -> Result<ExecutionTask> {
        if new.parent_task_id.is_empty() {
            if let Err(e) = self.purge_expired().await {
                warn!(error = %e, "Failed to purge expired ledger rows");
            }
        }
        if let Some(existing) = self.get_item(&new.execution_name, &new.task_id).await? {
            return Err(EngineError::InvalidTransition {
                task_id: new.task_id,
                from: existing.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }

        let now = self.now();
        self.put_item(ExecutionTask {
            execution_name: new.execution_name,
            task_id: new.task_id,
            parent_task_id: new.parent_task_id,
            api: new.api,
            state_machine_name: new.state_machine_name,
            state_name: new.state_name,
            pipeline_id: new.pipeline_id,
            data: new.data,
            status: TaskStatus::Running,
            start_time: now,
            end_time: None,
            expiration_time: now,
        })
        .await
    }

    /// Move a Running task to a terminal status. `data` replaces the
    /// recorded data when given.
    pub async fn finish_task(
        &self,
        execution_name: &str,
        task_id: &str,
        status: TaskStatus,
        data: Option<serde_json::Value>,
    ) -> Result<ExecutionTask> {
        let mut task = self.require(execution_name, task_id).await?;
        if task.status.is_terminal() || !status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }

        task.status = status;
        task.end_time = Some(self.now());
        if let Some(data) = data {
            task.data = data;
        }
        self.update_item(task).await
    }

    /// Remove expired records; returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self.store.purge_expired(self.now()).await?;
        if purged > 0 {
            debug!(purged, "Purged expired ledger rows");
        }
        Ok(purged)
    }

    async fn require(&self, execution_name: &str, task_id: &str) -> Result<ExecutionTask> {
        self.get_item(execution_name, task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound {
                execution_name: execution_name.to_string(),
                task_id: task_id.to_string(),
            })
    }
}
