//! Postgres ledger store over the `execution_tasks` table

use super::{ExecutionTask, LedgerStore, TaskFilter, TaskKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lightengine_common::{EngineError, Result};
use sqlx::PgPool;
use tracing::debug;

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    execution_name: String,
    task_id: String,
    parent_task_id: String,
    api: String,
    state_machine_name: String,
    state_name: String,
    pipeline_id: String,
    data: serde_json::Value,
    status: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    expiration_time: DateTime<Utc>,
}

impl TryFrom<TaskRow> for ExecutionTask {
    type Error = EngineError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(ExecutionTask {
            status: row.status.parse()?,
            execution_name: row.execution_name,
            task_id: row.task_id,
            parent_task_id: row.parent_task_id,
            api: row.api,
            state_machine_name: row.state_machine_name,
            state_name: row.state_name,
            pipeline_id: row.pipeline_id,
            data: row.data,
            start_time: row.start_time,
            end_time: row.end_time,
            expiration_time: row.expiration_time,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT execution_name, task_id, parent_task_id, api, state_machine_name, state_name,
           pipeline_id, data, status, start_time, end_time, expiration_time
    FROM execution_tasks
"#;

fn ledger_error(e: sqlx::Error) -> EngineError {
    EngineError::Ledger(e.to_string())
}

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn put(&self, task: &ExecutionTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_tasks (
                execution_name, task_id, parent_task_id, api, state_machine_name, state_name,
                pipeline_id, data, status, start_time, end_time, expiration_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (execution_name, task_id) DO UPDATE SET
                parent_task_id = EXCLUDED.parent_task_id,
                api = EXCLUDED.api,
                state_machine_name = EXCLUDED.state_machine_name,
                state_name = EXCLUDED.state_name,
                pipeline_id = EXCLUDED.pipeline_id,
                data = EXCLUDED.data,
                status = EXCLUDED.status,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                expiration_time = EXCLUDED.expiration_time
            "#,
        )
        .bind(&task.execution_name)
        .bind(&task.task_id)
        .bind(&task.parent_task_id)
        .bind(&task.api)
        .bind(&task.state_machine_name)
        .bind(&task.state_name)
        .bind(&task.pipeline_id)
        .bind(&task.data)
        .bind(task.status.as_str())
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(task.expiration_time)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;
        Ok(())
    }

    async fn update(&self, task: &ExecutionTask) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE execution_tasks SET
                parent_task_id = $3,
                api = $4,
                state_machine_name = $5,
                state_name = $6,
                pipeline_id = $7,
                data = $8,
                status = $9,
                start_time = $10,
                end_time = $11
            WHERE execution_name = $1 AND task_id = $2
            "#,
        )
        .bind(&task.execution_name)
        .bind(&task.task_id)
        .bind(&task.parent_task_id)
        .bind(&task.api)
        .bind(&task.state_machine_name)
        .bind(&task.state_name)
        .bind(&task.pipeline_id)
        .bind(&task.data)
        .bind(task.status.as_str())
        .bind(task.start_time)
        .bind(task.end_time)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: &TaskKey) -> Result<Option<ExecutionTask>> {
        let sql = format!("{} WHERE execution_name = $1 AND task_id = $2", SELECT_COLUMNS);
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(&key.execution_name)
            .bind(&key.task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_error)?
            .map(ExecutionTask::try_from)
            .transpose()
    }

    async fn delete(&self, keys: &[TaskKey]) -> Result<u64> {
        let execution_names: Vec<&str> = keys.iter().map(|k| k.execution_name.as_str()).collect();
        let task_ids: Vec<&str> = keys.iter().map(|k| k.task_id.as_str()).collect();

        let result = sqlx::query(
            r#"
            DELETE FROM execution_tasks t
            USING UNNEST($1::text[], $2::text[]) AS k(execution_name, task_id)
            WHERE t.execution_name = k.execution_name AND t.task_id = k.task_id
            "#,
        )
        .bind(&execution_names)
        .bind(&task_ids)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;
        Ok(result.rows_affected())
    }

    async fn query(
        &self,
        execution_name: &str,
        filter: &TaskFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionTask>> {
        let mut sql = format!(
            "{} WHERE execution_name = $1 AND expiration_time > $2",
            SELECT_COLUMNS
        );

        let mut bind_count = 3;
        let mut conditions = Vec::new();

        if filter.parent_task_id.is_some() {
            conditions.push(format!("parent_task_id = ${}", bind_count));
            bind_count += 1;
        }
        if filter.status.is_some() {
            conditions.push(format!("status = ${}", bind_count));
            bind_count += 1;
        }
        if filter.state_name.is_some() {
            conditions.push(format!("state_name = ${}", bind_count));
            bind_count += 1;
        }
        if filter.pipeline_id.is_some() {
            conditions.push(format!("pipeline_id = ${}", bind_count));
        }

        for condition in conditions {
            sql.push_str(" AND ");
            sql.push_str(&condition);
        }
        sql.push_str(" ORDER BY start_time, task_id");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(execution_name).bind(now);
        if let Some(parent_task_id) = &filter.parent_task_id {
            query = query.bind(parent_task_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(state_name) = &filter.state_name {
            query = query.bind(state_name);
        }
        if let Some(pipeline_id) = &filter.pipeline_id {
            query = query.bind(pipeline_id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(ledger_error)?;
        debug!(execution = %execution_name, count = rows.len(), "Queried ledger");
        rows.into_iter().map(ExecutionTask::try_from).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM execution_tasks WHERE expiration_time <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(ledger_error)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::{create_pool, migrate, DbConfig};
    use crate::ledger::{Ledger, NewTask, TaskStatus};
    use uuid::Uuid;

    async fn test_store() -> Option<PostgresLedgerStore> {
        let Some(config) = DbConfig::from_env() else {
            eprintln!("Skipping Postgres ledger test: DATABASE_URL not set");
            return None;
        };
        let pool = create_pool(&config).await.unwrap();
        migrate(&pool).await.unwrap();
        Some(PostgresLedgerStore::new(pool))
    }

    fn row(status: &str) -> TaskRow {
        TaskRow {
            execution_name: "e".to_string(),
            task_id: "t".to_string(),
            parent_task_id: String::new(),
            api: String::new(),
            state_machine_name: String::new(),
            state_name: String::new(),
            pipeline_id: String::new(),
            data: serde_json::Value::Null,
            status: status.to_string(),
            start_time: Utc::now(),
            end_time: None,
            expiration_time: Utc::now(),
        }
    }

    #[test]
    fn test_row_conversion_checks_status() {
        let task = ExecutionTask::try_from(row("Timed_out")).unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);
        assert!(matches!(
            ExecutionTask::try_from(row("Done")).unwrap_err(),
            EngineError::Ledger(_)
        ));
    }

    #[tokio::test]
    async fn test_postgres_task_lifecycle() {
        let Some(store) = test_store().await else {
            return;
        };
        let ledger = Ledger::new(std::sync::Arc::new(store), 3600);
        let execution = format!("test-{}", Uuid::new_v4());

        ledger
            .start_task(NewTask::new(&execution, "parent").state("Processor"))
            .await
            .unwrap();
        for i in 0..3 {
            ledger
                .start_task(NewTask::new(&execution, format!("child-{}", i)).parent("parent"))
                .await
                .unwrap();
        }
        ledger
            .finish_task(&execution, "child-0", TaskStatus::Failed, Some(serde_json::json!("boom")))
            .await
            .unwrap();

        let (failed, total) = ledger
            .get_subtask_status_count(&execution, "parent", TaskStatus::Failed)
            .await
            .unwrap();
        assert_eq!((failed, total), (1, 3));

        let keys: Vec<_> = ledger
            .query_item(&execution, &TaskFilter::default())
            .await
            .unwrap()
            .iter()
            .map(ExecutionTask::key)
            .collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(ledger.batch_delete(&keys).await.unwrap(), 4);
    }
}
