use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_config::{sts::AssumeRoleProvider, BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::{
    config::Credentials,
    error::ProvideErrorMetadata,
    primitives::ByteStream,
    types::{
        Delete, Event, FilterRule, FilterRuleName, NotificationConfiguration,
        NotificationConfigurationFilter, ObjectIdentifier, QueueConfiguration, S3KeyFilter,
    },
    Client,
};
use lightengine_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::config::StorageConfig;
use super::{ObjectStore, ObjectSummary, QueueNotification};

const SESSION_NAME: &str = "lightengine";

/// Shared AWS settings: region, optional static keys and endpoint override.
pub async fn load_sdk_config(config: &StorageConfig, endpoint: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

    if let Some((access_key, secret_key)) = config.static_credentials() {
        loader = loader.credentials_provider(Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "lightengine-storage",
        ));
    }
    if let Some(endpoint) = endpoint {
        loader = loader.endpoint_url(endpoint);
    }

    loader.load().await
}

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    sdk_config: SdkConfig,
    path_style: bool,
    role_clients: Arc<Mutex<HashMap<String, Client>>>,
}

impl S3ObjectStore {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        debug!("Initializing storage with config: {:?}", config);

        let sdk_config = load_sdk_config(&config, config.endpoint.as_deref()).await;
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(config.path_style)
                .build(),
        );

        info!(region = %config.region, endpoint = ?config.endpoint, "Storage client initialized");

        Ok(Self {
            client,
            sdk_config,
            path_style: config.path_style,
            role_clients: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn role_client(&self, role: &str) -> Client {
        let mut clients = self.role_clients.lock().await;
        if let Some(client) = clients.get(role) {
            return client.clone();
        }

        debug!(role, "Assuming role for object access");
        let provider = AssumeRoleProvider::builder(role)
            .session_name(SESSION_NAME)
            .configure(&self.sdk_config)
            .build()
            .await;
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&self.sdk_config)
                .credentials_provider(provider)
                .force_path_style(self.path_style)
                .build(),
        );
        clients.insert(role.to_string(), client.clone());
        client
    }

    async fn current_notifications(&self, bucket: &str) -> anyhow::Result<NotificationConfiguration> {
        let response = self
            .client
            .get_bucket_notification_configuration()
            .bucket(bucket)
            .send()
            .await
            .context(format!("Failed to read notification configuration of {}", bucket))?;

        Ok(NotificationConfiguration::builder()
            .set_queue_configurations(Some(response.queue_configurations().to_vec()))
            .set_topic_configurations(Some(response.topic_configurations().to_vec()))
            .set_lambda_function_configurations(Some(
                response.lambda_function_configurations().to_vec(),
            ))
            .set_event_bridge_configuration(response.event_bridge_configuration().cloned())
            .build())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading from s3://{}/{}", bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .context(format!("Failed to download s3://{}/{}", bucket, key))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), bucket, key);
        Ok(data)
    }

    #[instrument(skip(self, data))]
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>, content_type: Option<&str>) -> Result<()> {
        let size = data.len();
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request
            .send()
            .await
            .context(format!("Failed to upload s3://{}/{}", bucket, key))?;

        debug!("Uploaded {} bytes to s3://{}/{}", size, bucket, key);
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to build delete request")?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .context("Failed to build delete request")?;

        let response = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .context(format!("Failed to delete {} objects from {}", keys.len(), bucket))?;

        Ok(response
            .errors()
            .iter()
            .filter_map(|e| e.key().map(str::to_string))
            .collect())
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.context(format!("Failed to list s3://{}/{}", bucket, prefix))?;
            objects.extend(page.contents().iter().filter_map(|object| {
                Some(ObjectSummary {
                    bucket: bucket.to_string(),
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or(0),
                    last_modified: object
                        .last_modified()
                        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                })
            }));
        }

        debug!("Listed {} objects under s3://{}/{}", objects.len(), bucket, prefix);
        Ok(objects)
    }

    async fn assume_role(&self, role: &str) -> Result<Arc<dyn ObjectStore>> {
        let client = self.role_client(role).await;
        Ok(Arc::new(Self {
            client,
            sdk_config: self.sdk_config.clone(),
            path_style: self.path_style,
            role_clients: Arc::clone(&self.role_clients),
        }))
    }

    #[instrument(skip(self))]
    async fn get_queue_notifications(&self, bucket: &str) -> Result<Vec<QueueNotification>> {
        let current = self.current_notifications(bucket).await?;
        Ok(current.queue_configurations().iter().map(from_queue_configuration).collect())
    }

    #[instrument(skip(self, entries))]
    async fn put_queue_notifications(&self, bucket: &str, entries: Vec<QueueNotification>) -> Result<()> {
        let current = self.current_notifications(bucket).await?;
        let queues = entries
            .iter()
            .map(to_queue_configuration)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let configuration = NotificationConfiguration::builder()
            .set_queue_configurations(Some(queues))
            .set_topic_configurations(Some(current.topic_configurations().to_vec()))
            .set_lambda_function_configurations(Some(current.lambda_function_configurations().to_vec()))
            .set_event_bridge_configuration(current.event_bridge_configuration().cloned())
            .build();

        self.client
            .put_bucket_notification_configuration()
            .bucket(bucket)
            .notification_configuration(configuration)
            .send()
            .await
            .context(format!("Failed to write notification configuration of {}", bucket))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>> {
        match self.client.get_bucket_policy().bucket(bucket).send().await {
            Ok(response) => Ok(response.policy().map(str::to_string)),
            Err(e) if e.code() == Some("NoSuchBucketPolicy") => Ok(None),
            Err(e) => Err(anyhow!("Failed to read policy of {}: {}", bucket, e).into()),
        }
    }

    #[instrument(skip(self, policy))]
    async fn put_bucket_policy(&self, bucket: &str, policy: Option<String>) -> Result<()> {
        match policy {
            Some(policy) => {
                self.client
                    .put_bucket_policy()
                    .bucket(bucket)
                    .policy(policy)
                    .send()
                    .await
                    .context(format!("Failed to write policy of {}", bucket))?;
            }
            None => {
                self.client
                    .delete_bucket_policy()
                    .bucket(bucket)
                    .send()
                    .await
                    .context(format!("Failed to delete policy of {}", bucket))?;
            }
        }
        Ok(())
    }
}

fn from_queue_configuration(queue: &QueueConfiguration) -> QueueNotification {
    let rules = queue
        .filter()
        .and_then(|f| f.key())
        .map(|k| k.filter_rules())
        .unwrap_or_default();
    let rule = |name: FilterRuleName| {
        rules
            .iter()
            .find(|r| r.name() == Some(&name))
            .and_then(|r| r.value())
            .map(str::to_string)
    };

    QueueNotification {
        id: queue.id().unwrap_or_default().to_string(),
        queue_arn: queue.queue_arn().to_string(),
        events: queue.events().iter().map(|e| e.as_str().to_string()).collect(),
        prefix: rule(FilterRuleName::Prefix),
        suffix: rule(FilterRuleName::Suffix),
    }
}

fn to_queue_configuration(entry: &QueueNotification) -> anyhow::Result<QueueConfiguration> {
    let mut rules = Vec::new();
    if let Some(prefix) = &entry.prefix {
        rules.push(FilterRule::builder().name(FilterRuleName::Prefix).value(prefix).build());
    }
    if let Some(suffix) = &entry.suffix {
        rules.push(FilterRule::builder().name(FilterRuleName::Suffix).value(suffix).build());
    }

    let mut builder = QueueConfiguration::builder()
        .id(&entry.id)
        .queue_arn(&entry.queue_arn)
        .set_events(Some(entry.events.iter().map(|e| Event::from(e.as_str())).collect()));
    if !rules.is_empty() {
        builder = builder.filter(
            NotificationConfigurationFilter::builder()
                .key(S3KeyFilter::builder().set_filter_rules(Some(rules)).build())
                .build(),
        );
    }
    builder
        .build()
        .context(format!("Invalid queue notification {}", entry.id))
}
