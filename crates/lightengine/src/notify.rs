//! Failure notifications
//!
//! When a stage finishes Failed, a [`FailureNotice`] carrying the run's
//! identifiers, console links and most recent ledger rows is handed to a
//! [`Notifier`].

use crate::ledger::{ExecutionTask, Ledger, TaskFilter};
use crate::meta::NotificationMeta;
use async_trait::async_trait;
use lightengine_common::{EngineError, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

pub const DEFAULT_RECENT_TASKS: usize = 10;

pub const DEFAULT_CONSOLE_URL_TEMPLATE: &str =
    "https://console.aws.amazon.com/states/home#/executions/details/{execution}";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    pub pipeline_id: String,
    pub ingestion_id: String,
    pub state_machine_name: String,
    pub execution_name: String,
    pub console_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub recipients: Vec<String>,
    /// Newest first.
    pub recent_tasks: Vec<ExecutionTask>,
}

/// Substitute `{execution}`, `{state_machine}` and `{pipeline}`.
pub fn render_console_url(template: &str, execution_name: &str, state_machine_name: &str, pipeline_id: &str) -> String {
    template
        .replace("{execution}", &urlencoding::encode(execution_name))
        .replace("{state_machine}", &urlencoding::encode(state_machine_name))
        .replace("{pipeline}", &urlencoding::encode(pipeline_id))
}

pub struct NoticeRequest<'a> {
    pub pipeline_id: &'a str,
    pub execution_name: &'a str,
    pub state_machine_name: &'a str,
    pub notification: Option<&'a NotificationMeta>,
    pub console_url_template: &'a str,
    pub recent_limit: usize,
}

/// Collect what a failure notice reports from the ledger.
pub async fn build_notice(ledger: &Ledger, request: NoticeRequest<'_>) -> Result<FailureNotice> {
    let mut tasks = ledger
        .query_item(request.execution_name, &TaskFilter::default())
        .await?;
    tasks.reverse();
    tasks.truncate(request.recent_limit);

    Ok(FailureNotice {
        pipeline_id: request.pipeline_id.to_string(),
        ingestion_id: request.execution_name.to_string(),
        state_machine_name: request.state_machine_name.to_string(),
        execution_name: request.execution_name.to_string(),
        console_url: render_console_url(
            request.console_url_template,
            request.execution_name,
            request.state_machine_name,
            request.pipeline_id,
        ),
        service: request.notification.map(|n| n.service.clone()),
        recipients: request
            .notification
            .map(|n| n.recipients.clone())
            .unwrap_or_default(),
        recent_tasks: tasks,
    })
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &FailureNotice) -> Result<()>;
}

/// Writes notices to the log only
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        warn!(
            pipeline_id = %notice.pipeline_id,
            execution = %notice.execution_name,
            state_machine = %notice.state_machine_name,
            console_url = %notice.console_url,
            recent_tasks = notice.recent_tasks.len(),
            "Pipeline run failed"
        );
        Ok(())
    }
}

/// Posts notices as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, notice), fields(execution = %notice.execution_name))]
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .map_err(|e| EngineError::Storage(format!("notification webhook unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Storage(format!(
                "notification webhook returned {}",
                status
            )));
        }
        info!("Failure notification sent");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::{NewTask, TaskStatus};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn failed_run(ledger: &Ledger, children: usize) {
        ledger
            .start_task(NewTask::new("exec-1", "parent").state_machine("LogProcessor"))
            .await
            .unwrap();
        for i in 0..children {
            ledger
                .start_task(NewTask::new("exec-1", format!("child-{:02}", i)).parent("parent"))
                .await
                .unwrap();
        }
        ledger
            .finish_task("exec-1", "parent", TaskStatus::Failed, None)
            .await
            .unwrap();
    }

    fn request<'a>(notification: Option<&'a NotificationMeta>) -> NoticeRequest<'a> {
        NoticeRequest {
            pipeline_id: "p1",
            execution_name: "exec-1",
            state_machine_name: "LogProcessor",
            notification,
            console_url_template: DEFAULT_CONSOLE_URL_TEMPLATE,
            recent_limit: DEFAULT_RECENT_TASKS,
        }
    }

    #[test]
    fn test_console_url() {
        let url = render_console_url("https://x/{state_machine}/{execution}?p={pipeline}", "run 1", "sm", "p1");
        assert_eq!(url, "https://x/sm/run%201?p=p1");
    }

    #[tokio::test]
    async fn test_notice_keeps_most_recent_rows() {
        let ledger = Ledger::in_memory();
        failed_run(&ledger, 14).await;
        let notification = NotificationMeta {
            service: "SNS".to_string(),
            recipients: vec!["ops@example.com".to_string()],
        };

        let notice = build_notice(&ledger, request(Some(&notification))).await.unwrap();
        assert_eq!(notice.recent_tasks.len(), DEFAULT_RECENT_TASKS);
        assert_eq!(notice.ingestion_id, "exec-1");
        assert_eq!(notice.recipients, vec!["ops@example.com"]);
        assert!(notice.console_url.ends_with("/exec-1"));
        let newest = notice.recent_tasks.first().unwrap();
        let oldest = notice.recent_tasks.last().unwrap();
        assert!((newest.start_time, &newest.task_id) >= (oldest.start_time, &oldest.task_id));
    }

    #[tokio::test]
    async fn test_webhook_posts_notice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/failures"))
            .and(body_partial_json(serde_json::json!({"pipelineId": "p1", "executionName": "exec-1"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let ledger = Ledger::in_memory();
        failed_run(&ledger, 1).await;
        let notice = build_notice(&ledger, request(None)).await.unwrap();

        let notifier = WebhookNotifier::new(format!("{}/hooks/failures", server.uri()));
        notifier.notify(&notice).await.unwrap();
        LogNotifier.notify(&notice).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ledger = Ledger::in_memory();
        let notice = build_notice(&ledger, request(None)).await.unwrap();
        let err = WebhookNotifier::new(server.uri()).notify(&notice).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
