//! Read-modify-write reconciliation of bucket configuration
//!
//! Bucket notification entries and policy statements are shared documents:
//! the engine owns one entry (by id or `Sid`) and must add or remove it
//! without disturbing the rest. Each attempt reads the document, applies the
//! change locally, writes it back and reads it again to verify. A write that
//! did not stick is retried after a jittered delay until the attempt budget
//! runs out.
//!
//! Only one reconciler per bucket is expected to run at a time.

use async_trait::async_trait;
use lightengine_common::{Backoff, EngineError, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{ObjectStore, QueueNotification};

pub const POLICY_VERSION: &str = "2012-10-17";

#[derive(Debug, Clone, PartialEq)]
pub enum Change<E> {
    Upsert(E),
    Remove(String),
}

impl<E> Change<E> {
    fn describe(&self) -> &'static str {
        match self {
            Change::Upsert(_) => "upsert",
            Change::Remove(_) => "remove",
        }
    }
}

/// A list-shaped configuration document with identified entries
#[async_trait]
pub trait ConfigDocument: Send + Sync {
    type Entry: Clone + PartialEq + Send + Sync;

    fn kind(&self) -> &'static str;

    fn entry_id<'a>(&self, entry: &'a Self::Entry) -> Option<&'a str>;

    async fn read(&self, store: &dyn ObjectStore, bucket: &str) -> Result<Vec<Self::Entry>>;

    async fn write(&self, store: &dyn ObjectStore, bucket: &str, entries: Vec<Self::Entry>) -> Result<()>;
}

pub struct QueueNotifications;

#[async_trait]
impl ConfigDocument for QueueNotifications {
    type Entry = QueueNotification;

    fn kind(&self) -> &'static str {
        "notification"
    }

    fn entry_id<'a>(&self, entry: &'a QueueNotification) -> Option<&'a str> {
        Some(entry.id.as_str())
    }

    async fn read(&self, store: &dyn ObjectStore, bucket: &str) -> Result<Vec<QueueNotification>> {
        store.get_queue_notifications(bucket).await
    }

    async fn write(&self, store: &dyn ObjectStore, bucket: &str, entries: Vec<QueueNotification>) -> Result<()> {
        store.put_queue_notifications(bucket, entries).await
    }
}

/// Statements of a bucket policy, identified by `Sid`
pub struct PolicyStatements;

impl PolicyStatements {
    fn parse(policy: Option<String>) -> Result<Map<String, Value>> {
        let Some(policy) = policy else {
            return Ok(Map::new());
        };
        match serde_json::from_str(&policy)? {
            Value::Object(document) => Ok(document),
            _ => Err(EngineError::Storage("bucket policy is not a JSON object".to_string())),
        }
    }
}

#[async_trait]
impl ConfigDocument for PolicyStatements {
    type Entry = Value;

    fn kind(&self) -> &'static str {
        "policy statement"
    }

    fn entry_id<'a>(&self, entry: &'a Value) -> Option<&'a str> {
        entry.get("Sid").and_then(Value::as_str)
    }

    async fn read(&self, store: &dyn ObjectStore, bucket: &str) -> Result<Vec<Value>> {
        let document = Self::parse(store.get_bucket_policy(bucket).await?)?;
        Ok(match document.get("Statement") {
            Some(Value::Array(statements)) => statements.clone(),
            Some(statement @ Value::Object(_)) => vec![statement.clone()],
            _ => Vec::new(),
        })
    }

    async fn write(&self, store: &dyn ObjectStore, bucket: &str, entries: Vec<Value>) -> Result<()> {
        if entries.is_empty() {
            return store.put_bucket_policy(bucket, None).await;
        }
        let mut document = Self::parse(store.get_bucket_policy(bucket).await?)?;
        document
            .entry("Version")
            .or_insert_with(|| Value::String(POLICY_VERSION.to_string()));
        document.insert("Statement".to_string(), Value::Array(entries));
        store
            .put_bucket_policy(bucket, Some(Value::Object(document).to_string()))
            .await
    }
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    backoff: Backoff,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, backoff: Backoff) -> Self {
        Self { store, backoff }
    }

    #[instrument(skip(self, entry), fields(id = %entry.id))]
    pub async fn ensure_notification(&self, bucket: &str, entry: QueueNotification) -> Result<()> {
        self.reconcile(&QueueNotifications, bucket, Change::Upsert(entry)).await
    }

    #[instrument(skip(self))]
    pub async fn remove_notification(&self, bucket: &str, id: &str) -> Result<()> {
        self.reconcile(&QueueNotifications, bucket, Change::Remove(id.to_string()))
            .await
    }

    #[instrument(skip(self, statement))]
    pub async fn ensure_policy_statement(&self, bucket: &str, statement: Value) -> Result<()> {
        if PolicyStatements.entry_id(&statement).is_none() {
            return Err(EngineError::missing_field("Sid"));
        }
        self.reconcile(&PolicyStatements, bucket, Change::Upsert(statement)).await
    }

    #[instrument(skip(self))]
    pub async fn remove_policy_statement(&self, bucket: &str, sid: &str) -> Result<()> {
        self.reconcile(&PolicyStatements, bucket, Change::Remove(sid.to_string()))
            .await
    }

    pub async fn reconcile<D: ConfigDocument>(
        &self,
        document: &D,
        bucket: &str,
        change: Change<D::Entry>,
    ) -> Result<()> {
        let store = self.store.as_ref();

        for attempt in 0..self.backoff.max_attempts {
            let current = document.read(store, bucket).await?;
            let desired = apply(document, &current, &change);
            if desired == current {
                debug!(kind = document.kind(), bucket, "Configuration already reconciled");
                return Ok(());
            }

            document.write(store, bucket, desired).await?;
            let observed = document.read(store, bucket).await?;
            if satisfied(document, &observed, &change) {
                info!(
                    kind = document.kind(),
                    bucket,
                    change = change.describe(),
                    attempts = attempt + 1,
                    "Configuration reconciled"
                );
                return Ok(());
            }

            warn!(
                kind = document.kind(),
                bucket,
                attempt = attempt + 1,
                "Configuration write not visible, retrying"
            );
            self.backoff.sleep_jittered(attempt).await;
        }

        Err(EngineError::Consistency {
            attempts: self.backoff.max_attempts,
            message: format!("{} {} on {} did not converge", document.kind(), change.describe(), bucket),
        })
    }
}

fn apply<D: ConfigDocument>(document: &D, current: &[D::Entry], change: &Change<D::Entry>) -> Vec<D::Entry> {
    match change {
        Change::Upsert(entry) => {
            let id = document.entry_id(entry);
            let mut entries: Vec<D::Entry> = current
                .iter()
                .filter(|e| id.is_none() || document.entry_id(e) != id)
                .cloned()
                .collect();
            // Keep the entry in place when it already exists
            match current.iter().position(|e| id.is_some() && document.entry_id(e) == id) {
                Some(position) => entries.insert(position, entry.clone()),
                None => entries.push(entry.clone()),
            }
            entries
        }
        Change::Remove(id) => current
            .iter()
            .filter(|e| document.entry_id(e) != Some(id.as_str()))
            .cloned()
            .collect(),
    }
}

fn satisfied<D: ConfigDocument>(document: &D, observed: &[D::Entry], change: &Change<D::Entry>) -> bool {
    match change {
        Change::Upsert(entry) => observed.contains(entry),
        Change::Remove(id) => !observed
            .iter()
            .any(|e| document.entry_id(e) == Some(id.as_str())),
    }
}

/// Statement allowing a principal to read and delete under a prefix.
pub fn read_access_statement(sid: &str, principal_arn: &str, bucket: &str, prefix: &str) -> Value {
    let prefix = prefix.trim_matches('/');
    json!({
        "Sid": sid,
        "Effect": "Allow",
        "Principal": { "AWS": principal_arn },
        "Action": ["s3:GetObject", "s3:DeleteObject"],
        "Resource": format!("arn:aws:s3:::{}/{}/*", bucket, prefix),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn entry(id: &str) -> QueueNotification {
        QueueNotification {
            id: id.to_string(),
            queue_arn: "arn:aws:sqs:us-east-1:111122223333:ingest".to_string(),
            events: vec!["s3:ObjectCreated:*".to_string()],
            prefix: Some("AWSLogs/".to_string()),
            suffix: None,
        }
    }

    fn reconciler(store: &MemoryObjectStore) -> Reconciler {
        Reconciler::new(Arc::new(store.clone()), Backoff::immediate(5))
    }

    #[tokio::test]
    async fn test_notification_upsert_keeps_foreign_entries() {
        let store = MemoryObjectStore::new();
        store.put_queue_notifications("b", vec![entry("other")]).await.unwrap();

        reconciler(&store).ensure_notification("b", entry("mine")).await.unwrap();
        let ids: Vec<String> = store
            .get_queue_notifications("b")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["other", "mine"]);

        // Second run is a no-op
        reconciler(&store).ensure_notification("b", entry("mine")).await.unwrap();
        assert_eq!(store.get_queue_notifications("b").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_notification_update_in_place() {
        let store = MemoryObjectStore::new();
        store
            .put_queue_notifications("b", vec![entry("mine"), entry("other")])
            .await
            .unwrap();
        let mut changed = entry("mine");
        changed.suffix = Some(".gz".to_string());

        reconciler(&store).ensure_notification("b", changed.clone()).await.unwrap();
        let entries = store.get_queue_notifications("b").await.unwrap();
        assert_eq!(entries[0], changed);
        assert_eq!(entries[1].id, "other");
    }

    #[tokio::test]
    async fn test_lost_writes_are_retried() {
        let store = MemoryObjectStore::new();
        store.lose_config_writes(2);
        reconciler(&store).ensure_notification("b", entry("mine")).await.unwrap();
        assert_eq!(store.get_queue_notifications("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_consistency_error_after_budget() {
        let store = MemoryObjectStore::new();
        store.lose_config_writes(10);
        let err = reconciler(&store)
            .ensure_notification("b", entry("mine"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Consistency { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn test_policy_statement_lifecycle() {
        let store = MemoryObjectStore::new();
        let foreign = json!({"Sid": "Foreign", "Effect": "Deny", "Principal": "*", "Action": "s3:*", "Resource": "*"});
        store
            .put_bucket_policy(
                "b",
                Some(json!({"Version": POLICY_VERSION, "Id": "P1", "Statement": [foreign]}).to_string()),
            )
            .await
            .unwrap();

        let statement = read_access_statement("LightEngine", "arn:aws:iam::1:role/r", "b", "/AWSLogs/");
        assert_eq!(statement["Resource"], "arn:aws:s3:::b/AWSLogs/*");
        reconciler(&store)
            .ensure_policy_statement("b", statement)
            .await
            .unwrap();

        let policy: Value =
            serde_json::from_str(&store.get_bucket_policy("b").await.unwrap().unwrap()).unwrap();
        assert_eq!(policy["Id"], "P1");
        assert_eq!(policy["Statement"].as_array().unwrap().len(), 2);

        reconciler(&store).remove_policy_statement("b", "LightEngine").await.unwrap();
        reconciler(&store).remove_policy_statement("b", "Foreign").await.unwrap();
        assert!(store.get_bucket_policy("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_statement_without_sid_is_rejected() {
        let store = MemoryObjectStore::new();
        let err = reconciler(&store)
            .ensure_policy_statement("b", json!({"Effect": "Allow"}))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
