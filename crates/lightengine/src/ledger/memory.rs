//! In-process ledger store

use super::{ExecutionTask, LedgerStore, TaskFilter, TaskKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lightengine_common::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    rows: Arc<Mutex<BTreeMap<TaskKey, ExecutionTask>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<TaskKey, ExecutionTask>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn put(&self, task: &ExecutionTask) -> Result<()> {
        self.rows().insert(task.key(), task.clone());
        Ok(())
    }

    async fn update(&self, task: &ExecutionTask) -> Result<bool> {
        let mut rows = self.rows();
        match rows.get_mut(&task.key()) {
            Some(row) => {
                *row = task.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &TaskKey) -> Result<Option<ExecutionTask>> {
        Ok(self.rows().get(key).cloned())
    }

    async fn delete(&self, keys: &[TaskKey]) -> Result<u64> {
        let mut rows = self.rows();
        Ok(keys.iter().filter(|key| rows.remove(*key).is_some()).count() as u64)
    }

    async fn query(
        &self,
        execution_name: &str,
        filter: &TaskFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionTask>> {
        let mut tasks: Vec<ExecutionTask> = self
            .rows()
            .values()
            .filter(|task| task.execution_name == execution_name)
            .filter(|task| !task.is_expired(now) && filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows();
        let before = rows.len();
        rows.retain(|_, task| !task.is_expired(now));
        Ok((before - rows.len()) as u64)
    }
}
