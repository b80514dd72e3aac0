//! Pipeline metadata
//!
//! Pipeline records are written by the pipeline management service and only
//! read here. Reads go through [`batch_get`], which retries keys a store
//! leaves unprocessed.

use crate::enrichment::EnrichmentPlugin;
use crate::parser::{ParserOptions, SourceType};
use async_trait::async_trait;
use lightengine_common::{Backoff, EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMeta {
    pub pipeline_id: String,
    pub source: SourceMeta,
    pub destination: DestinationMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationMeta>,
    #[serde(default)]
    pub scheduler: Value,
    #[serde(default)]
    pub staging: StagingMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<LocationMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMeta {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub table: SourceTableMeta,
    #[serde(default)]
    pub enrichment_plugins: Vec<EnrichmentPlugin>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceTableMeta {
    #[serde(default)]
    pub schema: Value,
    #[serde(default)]
    pub data_format: String,
    #[serde(default)]
    pub table_properties: Value,
    #[serde(default)]
    pub serialization_properties: Value,
    /// Fixed UTC offset of zone-less timestamps, e.g. `+08:00`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationMeta {
    pub location: LocationMeta,
    pub database: DatabaseMeta,
    pub table: TableMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationMeta {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMeta {
    pub name: String,
    #[serde(default)]
    pub schema: Value,
    /// Partition dimensions in path order.
    #[serde(default)]
    pub partitions: Vec<String>,
    /// Fixed values for dimensions that are not derived per run.
    #[serde(default)]
    pub partition_values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsMeta {
    pub name: String,
    #[serde(default)]
    pub schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMeta {
    pub service: String,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingMeta {
    #[serde(default)]
    pub prefix: String,
}

impl PipelineMeta {
    pub fn source_type(&self) -> SourceType {
        self.source.source_type
    }

    pub fn table_name(&self) -> &str {
        &self.destination.table.name
    }

    pub fn database_name(&self) -> &str {
        &self.destination.database.name
    }

    /// `<prefix>/<table>` under the destination bucket.
    pub fn table_prefix(&self) -> String {
        crate::storage::join_key([
            self.destination.location.prefix.as_str(),
            self.destination.table.name.as_str(),
        ])
    }

    pub fn parser_options(&self) -> Result<ParserOptions> {
        ParserOptions::with_offset(self.source.table.time_offset.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("pipelineId", &self.pipeline_id),
            ("destination.location.bucket", &self.destination.location.bucket),
            ("destination.database.name", &self.destination.database.name),
            ("destination.table.name", &self.destination.table.name),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::missing_field(field));
            }
        }
        self.parser_options()?;
        Ok(())
    }
}

/// One round of a batch read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetOutput {
    pub items: Vec<PipelineMeta>,
    /// Keys the store did not get to; retry them.
    pub unprocessed: Vec<String>,
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn batch_get_once(&self, pipeline_ids: &[String]) -> Result<BatchGetOutput>;
}

/// Read all `pipeline_ids`, retrying unprocessed keys with exponential
/// backoff. Missing ids are absent from the result.
#[instrument(skip(store, backoff), fields(ids = pipeline_ids.len()))]
pub async fn batch_get(
    store: &dyn MetaStore,
    pipeline_ids: &[String],
    backoff: &Backoff,
) -> Result<Vec<PipelineMeta>> {
    let mut items = Vec::new();
    let mut pending = pipeline_ids.to_vec();
    let mut attempt = 0;

    while !pending.is_empty() {
        if attempt >= backoff.max_attempts {
            return Err(EngineError::Consistency {
                attempts: attempt,
                message: format!("unprocessed pipeline keys: {}", pending.join(", ")),
            });
        }
        if attempt > 0 {
            debug!(attempt, pending = pending.len(), "Retrying unprocessed keys");
            backoff.sleep(attempt - 1).await;
        }

        let output = store.batch_get_once(&pending).await?;
        items.extend(output.items);
        pending = output.unprocessed;
        attempt += 1;
    }

    Ok(items)
}

/// Read one pipeline record.
pub async fn get_pipeline(store: &dyn MetaStore, pipeline_id: &str, backoff: &Backoff) -> Result<PipelineMeta> {
    let meta = batch_get(store, &[pipeline_id.to_string()], backoff)
        .await?
        .into_iter()
        .find(|m| m.pipeline_id == pipeline_id)
        .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.to_string()))?;
    meta.validate()?;
    Ok(meta)
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, PipelineMeta>,
    throttled_rounds: u32,
    rounds: u32,
}

/// Pipeline records held in process, loaded from code or a JSON file
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryMetaStore {
    pub fn new(records: impl IntoIterator<Item = PipelineMeta>) -> Self {
        let store = Self::default();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Load a JSON array of pipeline records.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let records: Vec<PipelineMeta> = serde_json::from_str(&content)?;
        debug!(path = %path.display(), count = records.len(), "Loaded pipeline records");
        Ok(Self::new(records))
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: PipelineMeta) {
        self.state().records.insert(record.pipeline_id.clone(), record);
    }

    /// Answer only half of each request for the next `rounds` reads.
    pub fn throttle(&self, rounds: u32) {
        self.state().throttled_rounds = rounds;
    }

    pub fn rounds(&self) -> u32 {
        self.state().rounds
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn batch_get_once(&self, pipeline_ids: &[String]) -> Result<BatchGetOutput> {
        let mut state = self.state();
        state.rounds += 1;

        let (requested, unprocessed) = if state.throttled_rounds > 0 {
            state.throttled_rounds -= 1;
            let split = pipeline_ids.len() / 2;
            (&pipeline_ids[..split], pipeline_ids[split..].to_vec())
        } else {
            (pipeline_ids, Vec::new())
        };

        let items = requested
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect();
        Ok(BatchGetOutput { items, unprocessed })
    }
}

/// Pipeline records in the `pipeline_meta` table
#[derive(Debug, Clone)]
pub struct PostgresMetaStore {
    pool: PgPool,
}

impl PostgresMetaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, record: &PipelineMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_meta (pipeline_id, meta, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (pipeline_id) DO UPDATE SET meta = EXCLUDED.meta, updated_at = NOW()
            "#,
        )
        .bind(&record.pipeline_id)
        .bind(serde_json::to_value(record)?)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MetaStore for PostgresMetaStore {
    async fn batch_get_once(&self, pipeline_ids: &[String]) -> Result<BatchGetOutput> {
        let rows: Vec<(String, Value)> =
            sqlx::query_as("SELECT pipeline_id, meta FROM pipeline_meta WHERE pipeline_id = ANY($1)")
                .bind(pipeline_ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for (pipeline_id, meta) in rows {
            match serde_json::from_value::<PipelineMeta>(meta) {
                Ok(mut record) => {
                    record.pipeline_id = pipeline_id;
                    items.push(record);
                }
                Err(e) => warn!(pipeline_id = %pipeline_id, error = %e, "Unreadable pipeline record"),
            }
        }
        Ok(BatchGetOutput {
            items,
            unprocessed: Vec::new(),
        })
    }
}
