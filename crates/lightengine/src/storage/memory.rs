//! In-process object store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lightengine_common::{EngineError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ObjectStore, ObjectSummary, QueueNotification};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    notifications: HashMap<String, Vec<QueueNotification>>,
    policies: HashMap<String, String>,
    read_only_buckets: HashSet<String>,
    lost_config_writes: u32,
    assumed_roles: Vec<String>,
    delete_requests: usize,
}

/// Object store backed by process memory
///
/// Clones share state. Besides plain storage it can simulate the failure
/// modes the batch engine has to tolerate: buckets that reject writes and
/// configuration writes that are acknowledged but not visible.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<State>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.insert_at(bucket, key, data, Utc::now());
    }

    pub fn insert_at(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>, last_modified: DateTime<Utc>) {
        self.state().buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.data.clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Reject puts and deletes against `bucket`.
    pub fn set_read_only(&self, bucket: &str) {
        self.state().read_only_buckets.insert(bucket.to_string());
    }

    /// Acknowledge the next `count` configuration writes without applying them.
    pub fn lose_config_writes(&self, count: u32) {
        self.state().lost_config_writes = count;
    }

    pub fn assumed_roles(&self) -> Vec<String> {
        self.state().assumed_roles.clone()
    }

    pub fn delete_requests(&self) -> usize {
        self.state().delete_requests
    }

    fn check_writable(state: &State, bucket: &str) -> Result<()> {
        if state.read_only_buckets.contains(bucket) {
            return Err(EngineError::Storage(format!("Access denied to bucket {}", bucket)));
        }
        Ok(())
    }

    /// Returns false when the write is to be silently dropped.
    fn take_config_write(state: &mut State) -> bool {
        if state.lost_config_writes > 0 {
            state.lost_config_writes -= 1;
            false
        } else {
            true
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.object(bucket, key)
            .ok_or_else(|| EngineError::Storage(format!("NoSuchKey: s3://{}/{}", bucket, key)))
    }

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>, _content_type: Option<&str>) -> Result<()> {
        Self::check_writable(&self.state(), bucket)?;
        self.insert(bucket, key, data);
        Ok(())
    }

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<Vec<String>> {
        let mut state = self.state();
        state.delete_requests += 1;
        Self::check_writable(&state, bucket)?;
        if let Some(objects) = state.buckets.get_mut(bucket) {
            for key in keys {
                objects.remove(key);
            }
        }
        Ok(Vec::new())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let state = self.state();
        let Some(objects) = state.buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                bucket: bucket.to_string(),
                key: key.clone(),
                size: object.data.len() as i64,
                last_modified: Some(object.last_modified),
            })
            .collect())
    }

    async fn assume_role(&self, role: &str) -> Result<Arc<dyn ObjectStore>> {
        self.state().assumed_roles.push(role.to_string());
        Ok(Arc::new(self.clone()))
    }

    async fn get_queue_notifications(&self, bucket: &str) -> Result<Vec<QueueNotification>> {
        Ok(self.state().notifications.get(bucket).cloned().unwrap_or_default())
    }

    async fn put_queue_notifications(&self, bucket: &str, entries: Vec<QueueNotification>) -> Result<()> {
        let mut state = self.state();
        if Self::take_config_write(&mut state) {
            state.notifications.insert(bucket.to_string(), entries);
        }
        Ok(())
    }

    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>> {
        Ok(self.state().policies.get(bucket).cloned())
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: Option<String>) -> Result<()> {
        let mut state = self.state();
        if !Self::take_config_write(&mut state) {
            return Ok(());
        }
        match policy {
            Some(policy) => {
                state.policies.insert(bucket.to_string(), policy);
            }
            None => {
                state.policies.remove(bucket);
            }
        }
        Ok(())
    }
}
