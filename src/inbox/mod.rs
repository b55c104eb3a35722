//! Idempotent consumption of events published by other services.
//!
//! Each handled event is recorded in the inbox table in the same transaction
//! as its side effects, so redelivery of an event id is a no-op.

pub mod consumer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use consumer::{InboxConsumer, InboxDelivery};

pub const CASE_DELETED: &str = "case.deleted.v1";
pub const USER_DELETED: &str = "auth.user.deleted.v1";

/// An event as received from the producing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Producer-assigned id, the dedup key.
    pub event_id: String,
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(event_id: impl Into<String>, event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: event_id.into(),
            event_name: event_name.into(),
            payload,
        }
    }
}

/// Marker that an inbound event was processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub event_id: String,
    pub event_name: String,
    pub processed_at: DateTime<Utc>,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum InboxOutcome {
    /// Handler ran; `affected` evidence rows were changed.
    Processed { affected: usize },
    /// Event id was already recorded.
    Duplicate,
    /// No handler for this event name.
    Ignored,
}
