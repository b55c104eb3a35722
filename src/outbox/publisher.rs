use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::error::{EvidenceError, EvidenceResult};
use crate::outbox::OutboxEvent;

/// Errors from delivering one event to the notification channel.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Transport error: {0}")]
    Transport(String),

    /// The receiver answered, but not with a 2xx.
    #[error("Rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Wire form of an outbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope<'a> {
    pub event_id: &'a str,
    pub event_name: &'a str,
    pub occurred_at: DateTime<Utc>,
    pub payload: &'a Value,
}

impl<'a> From<&'a OutboxEvent> for EventEnvelope<'a> {
    fn from(event: &'a OutboxEvent) -> Self {
        Self {
            event_id: &event.event_id,
            event_name: &event.event_name,
            occurred_at: event.created_at,
            payload: &event.payload,
        }
    }
}

/// Destination for outbox events. `Ok` means the receiver acknowledged.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError>;
}

/// POSTs the JSON envelope to a webhook. Any 2xx counts as acknowledgment.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> EvidenceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| EvidenceError::Config(format!("failed to build http client: {}", err)))?;
        Ok(Self {
            http,
            url: url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        let response = self
            .http
            .post(&self.url)
            .header("Idempotency-Key", &event.event_id)
            .json(&EventEnvelope::from(event))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    PublishError::Timeout(self.timeout)
                } else {
                    PublishError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PublishError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Acknowledges every event after logging it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        let envelope = serde_json::to_string(&EventEnvelope::from(event))?;
        info!(
            event_id = %event.event_id,
            event_name = %event.event_name,
            envelope = %envelope,
            "published event"
        );
        Ok(())
    }
}
