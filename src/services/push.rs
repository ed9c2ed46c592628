use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::PushConfig;
use crate::db::{Notice, NoticeKind};
use crate::error::{AppError, AppResult};

/// Payload handed to the push transport for one recipient.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub delivery_id: String,
    pub notice_id: String,
    pub user_id: String,
    pub kind: NoticeKind,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
}

impl PushMessage {
    pub fn for_recipient(delivery_id: &str, notice: &Notice, user_id: &str) -> Self {
        PushMessage {
            delivery_id: delivery_id.to_string(),
            notice_id: notice.id.clone(),
            user_id: user_id.to_string(),
            kind: notice.kind,
            title: notice.title.clone(),
            body: notice.body.clone(),
            url: notice.cta.as_ref().map(|c| c.url.clone()),
        }
    }
}

/// Outbound transport for push-enabled notices. An `Err` is treated as a
/// transient failure and retried with backoff by the delivery worker.
#[async_trait]
pub trait PushGateway: Send + Sync + 'static {
    async fn push(&self, message: &PushMessage) -> AppResult<()>;
}

/// Posts each message as JSON to an external push service.
pub struct WebhookPushGateway {
    client: reqwest::Client,
    url: String,
}

impl WebhookPushGateway {
    pub fn new(url: String, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl PushGateway for WebhookPushGateway {
    async fn push(&self, message: &PushMessage) -> AppResult<()> {
        let resp = self.client.post(&self.url).json(message).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::ServiceUnavailable(format!(
                "Push gateway error ({}): {}",
                status, text
            )));
        }

        tracing::debug!(
            "Pushed notice {} to user {} (delivery {})",
            message.notice_id,
            message.user_id,
            message.delivery_id
        );
        Ok(())
    }
}

/// Used when no gateway is configured: every push succeeds and is logged.
pub struct LogPushGateway;

#[async_trait]
impl PushGateway for LogPushGateway {
    async fn push(&self, message: &PushMessage) -> AppResult<()> {
        tracing::info!(
            "Push (log only): notice={} user={} title={:?}",
            message.notice_id,
            message.user_id,
            message.title
        );
        Ok(())
    }
}

pub fn gateway_from_config(config: &PushConfig) -> AppResult<Arc<dyn PushGateway>> {
    match &config.webhook_url {
        Some(url) => {
            url::Url::parse(url)
                .map_err(|e| AppError::BadRequest(format!("Invalid PUSH_WEBHOOK_URL: {}", e)))?;
            tracing::info!("Push gateway: webhook");
            Ok(Arc::new(WebhookPushGateway::new(
                url.clone(),
                Duration::from_secs(config.timeout_seconds),
            )?))
        }
        None => {
            tracing::info!("Push gateway: log only (PUSH_WEBHOOK_URL not set)");
            Ok(Arc::new(LogPushGateway))
        }
    }
}
