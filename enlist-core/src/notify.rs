use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::config::NotifySection;
use crate::task::{AutomationTask, TaskStatus};

type HmacSha256 = Hmac<Sha256>;

/// Hard upper bound on one delivery attempt.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the hex HMAC-SHA256 of the request body. Receivers verify
/// it with the shared signing secret before trusting the payload.
pub const SIGNATURE_HEADER: &str = "x-enlist-signature";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("webhook signing failed")]
    Signing,
}

pub type NotifyResult<T> = Result<T, NotifyError>;

/// Snapshot published when a task reaches a resting state. Carries only the
/// operator-facing summary, never credentials.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub software_id: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn from_task(task: &AutomationTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            software_id: task.software_id.clone(),
            status: task.status,
            error: task.error_message.clone(),
            occurred_at: Utc::now(),
        }
    }
}

/// Delivery is best effort. Callers log a failed notification and move on;
/// nothing in the task lifecycle waits on or retries a webhook.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TaskEvent) -> NotifyResult<()>;
}

pub struct WebhookNotifier {
    client: Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: String, secret: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url,
            secret,
        }
    }

    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &NotifySection) -> Option<Self> {
        config
            .webhook_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.signing_secret.clone()))
    }

    fn signature(secret: &str, body: &[u8]) -> NotifyResult<String> {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| NotifyError::Signing)?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TaskEvent) -> NotifyResult<()> {
        let body = serde_json::to_vec(event)?;
        let signature = match &self.secret {
            Some(secret) => Some(Self::signature(secret, &body)?),
            None => None,
        };
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        request.send().await?.error_for_status()?;
        debug!(task_id = %event.task_id, status = %event.status, "webhook delivered");
        Ok(())
    }
}

/// Stands in when no webhook is configured so callers never branch.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, event: &TaskEvent) -> NotifyResult<()> {
        debug!(task_id = %event.task_id, status = %event.status, "no notifier configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_rfc_4231_vector() {
        let signature =
            WebhookNotifier::signature("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn from_config_requires_url() {
        assert!(WebhookNotifier::from_config(&NotifySection::default()).is_none());
        let config = NotifySection {
            webhook_url: Some("https://hooks.example.test/enlist".to_string()),
            signing_secret: None,
        };
        let notifier = WebhookNotifier::from_config(&config).unwrap();
        assert!(notifier.secret.is_none());
    }

    #[test]
    fn event_serializes_status_as_snake_case() {
        let mut task = AutomationTask::new("forgecloud", 3);
        task.status = TaskStatus::RetryScheduled;
        task.error_message = Some("connection reset".to_string());
        let event = TaskEvent::from_task(&task);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "retry_scheduled");
        assert_eq!(value["software_id"], "forgecloud");
        assert_eq!(value["error"], "connection reset");
    }
}
