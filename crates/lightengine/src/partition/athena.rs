//! Athena statement client
//!
//! `StartQueryExecution` runs a statement in the configured work group with
//! the catalog database as its context; `GetQueryExecution` reports its
//! state until it is terminal.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_athena::error::DisplayErrorContext;
use aws_sdk_athena::types::{QueryExecutionContext, QueryExecutionState, ResultConfiguration};
use aws_sdk_athena::Client;
use lightengine_common::{EngineError, Result};
use tracing::{debug, info, instrument};

use super::catalog::{QueryContext, QueryExecutor, QueryState, QueryStatus};
use crate::storage::s3::load_sdk_config;
use crate::storage::StorageConfig;

#[derive(Clone)]
pub struct AthenaClient {
    client: Client,
}

impl AthenaClient {
    pub fn from_sdk_config(sdk_config: &SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }

    /// Client sharing the storage credentials; `endpoint` overrides the
    /// regional Athena endpoint.
    pub async fn new(storage: &StorageConfig, endpoint: Option<&str>) -> Self {
        let sdk_config = load_sdk_config(storage, endpoint).await;
        info!(region = %storage.region, endpoint = ?endpoint, "Athena client initialized");
        Self::from_sdk_config(&sdk_config)
    }
}

fn query_status(state: Option<&QueryExecutionState>, reason: Option<&str>) -> QueryStatus {
    let state = match state {
        Some(QueryExecutionState::Queued) | None => QueryState::Queued,
        Some(QueryExecutionState::Running) => QueryState::Running,
        Some(QueryExecutionState::Succeeded) => QueryState::Succeeded,
        Some(QueryExecutionState::Failed) => QueryState::Failed,
        Some(QueryExecutionState::Cancelled) => QueryState::Cancelled,
        Some(_) => QueryState::Running,
    };
    QueryStatus {
        state,
        error: match state {
            QueryState::Failed | QueryState::Cancelled => Some(reason.unwrap_or("query failed").to_string()),
            _ => None,
        },
    }
}

#[async_trait]
impl QueryExecutor for AthenaClient {
    #[instrument(skip(self, sql, context), fields(work_group = %context.work_group))]
    async fn start_query(&self, sql: &str, context: &QueryContext) -> Result<String> {
        let mut request = self
            .client
            .start_query_execution()
            .query_string(sql)
            .query_execution_context(QueryExecutionContext::builder().database(&context.database).build());
        if !context.work_group.is_empty() {
            request = request.work_group(&context.work_group);
        }
        if !context.output_location.is_empty() {
            request = request.result_configuration(
                ResultConfiguration::builder()
                    .output_location(&context.output_location)
                    .build(),
            );
        }

        let response = request.send().await.map_err(|e| {
            EngineError::Catalog(format!("StartQueryExecution failed: {}", DisplayErrorContext(&e)))
        })?;
        let query_id = response
            .query_execution_id()
            .ok_or_else(|| EngineError::Catalog("StartQueryExecution returned no query id".to_string()))?
            .to_string();

        debug!(query_id = %query_id, "Query submitted");
        Ok(query_id)
    }

    #[instrument(skip(self))]
    async fn get_query_state(&self, query_id: &str) -> Result<QueryStatus> {
        let response = self
            .client
            .get_query_execution()
            .query_execution_id(query_id)
            .send()
            .await
            .map_err(|e| {
                EngineError::Catalog(format!(
                    "GetQueryExecution {} failed: {}",
                    query_id,
                    DisplayErrorContext(&e)
                ))
            })?;

        let status = response.query_execution().and_then(|q| q.status());
        Ok(query_status(
            status.and_then(|s| s.state()),
            status.and_then(|s| s.state_change_reason()),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::partition::execute_and_wait;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const AMZ_JSON: &str = "application/x-amz-json-1.1";

    fn context() -> QueryContext {
        QueryContext {
            database: "centralized".to_string(),
            work_group: "primary".to_string(),
            output_location: "s3://results/athena/".to_string(),
        }
    }

    async fn client(server: &MockServer) -> AthenaClient {
        let storage = StorageConfig {
            region: "us-east-1".to_string(),
            access_key: Some("test".to_string()),
            secret_key: Some("test".to_string()),
            ..StorageConfig::default()
        };
        AthenaClient::new(&storage, Some(&server.uri())).await
    }

    fn amz_json(body: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), AMZ_JSON)
    }

    #[test]
    fn test_query_status_mapping() {
        assert_eq!(query_status(None, None).state, QueryState::Queued);
        assert_eq!(
            query_status(Some(&QueryExecutionState::Running), None).state,
            QueryState::Running
        );
        let ok = query_status(Some(&QueryExecutionState::Succeeded), Some("ignored"));
        assert_eq!(ok.state, QueryState::Succeeded);
        assert!(ok.error.is_none());

        let failed = query_status(Some(&QueryExecutionState::Failed), Some("Table not found"));
        assert_eq!(failed.state, QueryState::Failed);
        assert_eq!(failed.error.as_deref(), Some("Table not found"));
        assert_eq!(
            query_status(Some(&QueryExecutionState::Cancelled), None).error.as_deref(),
            Some("query failed")
        );
    }

    #[tokio::test]
    async fn test_start_sends_work_group_and_output_location() {
        let server = MockServer::start().await;
        let sql = "ALTER TABLE `centralized`.`alb` ADD IF NOT EXISTS PARTITION (`d`='1');";

        Mock::given(method("POST"))
            .and(header("x-amz-target", "AmazonAthena.StartQueryExecution"))
            .and(body_partial_json(json!({
                "QueryString": sql,
                "QueryExecutionContext": {"Database": "centralized"},
                "WorkGroup": "primary",
                "ResultConfiguration": {"OutputLocation": "s3://results/athena/"}
            })))
            .respond_with(amz_json(json!({"QueryExecutionId": "q-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", "AmazonAthena.GetQueryExecution"))
            .and(body_partial_json(json!({"QueryExecutionId": "q-1"})))
            .respond_with(amz_json(json!({
                "QueryExecution": {"QueryExecutionId": "q-1", "Status": {"State": "SUCCEEDED"}}
            })))
            .mount(&server)
            .await;

        let athena = client(&server).await;
        let outcome = execute_and_wait(&athena, sql, &context(), Duration::from_millis(1), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.query_id, "q-1");
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn test_failed_query_carries_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", "AmazonAthena.StartQueryExecution"))
            .respond_with(amz_json(json!({"QueryExecutionId": "q-2"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", "AmazonAthena.GetQueryExecution"))
            .respond_with(amz_json(json!({
                "QueryExecution": {
                    "QueryExecutionId": "q-2",
                    "Status": {"State": "FAILED", "StateChangeReason": "Table not found"}
                }
            })))
            .mount(&server)
            .await;

        let athena = client(&server).await;
        let outcome = execute_and_wait(
            &athena,
            "ALTER TABLE `db`.`t` ADD IF NOT EXISTS PARTITION (`d`='1');",
            &context(),
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome.state, QueryState::Failed);
        assert_eq!(outcome.error.as_deref(), Some("Table not found"));
    }

    #[tokio::test]
    async fn test_rejected_submission_is_catalog_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_raw(
                    json!({"__type": "InvalidRequestException", "message": "bad work group"}).to_string(),
                    AMZ_JSON,
                ),
            )
            .mount(&server)
            .await;

        let athena = client(&server).await;
        let err = athena.start_query("SELECT 1", &context()).await.unwrap_err();
        assert!(matches!(err, EngineError::Catalog(_)));
    }
}
