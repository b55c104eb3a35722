//! Transactional outbox.
//!
//! Events are written by [`crate::metadata::UnitOfWork::enqueue`] in the same
//! transaction as the evidence change that produced them. The
//! [`OutboxDispatcher`] drains them later with at-least-once delivery.

pub mod dispatcher;
pub mod publisher;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::EvidenceError;
use crate::evidence::Evidence;

pub use dispatcher::{backoff_delay, DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use publisher::{EventEnvelope, EventPublisher, LogPublisher, PublishError, WebhookPublisher};

pub const EVIDENCE_UPLOADED: &str = "evidence.uploaded.v1";
pub const EVIDENCE_PROCESSED: &str = "evidence.processed.v1";
pub const EVIDENCE_DELETED: &str = "evidence.deleted.v1";
pub const EVIDENCE_LINKED: &str = "evidence.linked.v1";

/// Delivery state of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Delivered,
    /// Retries exhausted; waits for an operator requeue.
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Delivered => "delivered",
            EventStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = EvidenceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(EventStatus::Pending),
            "delivered" => Ok(EventStatus::Delivered),
            "failed" => Ok(EventStatus::Failed),
            other => Err(EvidenceError::InvalidInput(format!(
                "unknown event status: {}",
                other
            ))),
        }
    }
}

/// An event about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_id: String,
    pub event_name: String,
    /// Evidence id the event is about.
    pub aggregate_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    pub fn new(
        event_name: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_name: event_name.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Event carrying the standard evidence payload: ids plus a content-free snapshot.
    pub fn for_evidence(event_name: &str, evidence: &Evidence) -> Self {
        Self::new(
            event_name,
            evidence.evidence_id.clone(),
            json!({
                "evidence_id": evidence.evidence_id,
                "user_id": evidence.user_id,
                "case_id": evidence.case_id,
                "evidence": evidence.snapshot(),
            }),
        )
    }

    pub fn with_payload_field(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.payload {
            map.insert(key.to_string(), value);
        }
        self
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Insertion order; delivery follows it.
    pub seq: i64,
    pub event_id: String,
    pub event_name: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub status: EventStatus,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Counts per status, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub delivered: u64,
    pub failed: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}
