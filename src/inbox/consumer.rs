use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{EvidenceError, EvidenceResult};
use crate::evidence::Evidence;
use crate::inbox::{InboundEvent, InboxOutcome, InboxRecord, CASE_DELETED, USER_DELETED};
use crate::metadata::{MetadataRepository, UnitOfWork};
use crate::outbox::{NewOutboxEvent, EVIDENCE_DELETED};

/// An inbound event plus the channel its outcome is reported on.
#[derive(Debug)]
pub struct InboxDelivery {
    pub event: InboundEvent,
    pub ack: oneshot::Sender<EvidenceResult<InboxOutcome>>,
}

impl InboxDelivery {
    pub fn new(event: InboundEvent) -> (Self, oneshot::Receiver<EvidenceResult<InboxOutcome>>) {
        let (ack, receiver) = oneshot::channel();
        (Self { event, ack }, receiver)
    }
}

fn payload_str<'a>(event: &'a InboundEvent, field: &str) -> EvidenceResult<&'a str> {
    event
        .payload
        .get(field)
        .and_then(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            EvidenceError::InvalidInput(format!(
                "{} event {} is missing payload.{}",
                event.event_name, event.event_id, field
            ))
        })
}

/// Soft-delete every row and queue one deletion event per row.
fn cascade_delete(uow: &UnitOfWork<'_>, rows: Vec<Evidence>) -> EvidenceResult<usize> {
    let now = Utc::now().trunc_subsecs(3);
    let mut affected = 0;
    for mut evidence in rows {
        if !uow.soft_delete(&evidence.evidence_id, now)? {
            continue;
        }
        evidence.deleted = true;
        evidence.deleted_at = Some(now);
        uow.enqueue(
            &NewOutboxEvent::for_evidence(EVIDENCE_DELETED, &evidence)
                .with_payload_field("reason", serde_json::json!("cascade")),
        )?;
        affected += 1;
    }
    Ok(affected)
}

/// Applies inbound events exactly once per event id.
pub struct InboxConsumer {
    repo: MetadataRepository,
    purge_signal: Option<Arc<Notify>>,
}

impl InboxConsumer {
    pub fn new(repo: MetadataRepository) -> Self {
        Self {
            repo,
            purge_signal: None,
        }
    }

    /// Wake the purge reaper after cascades that deleted something.
    pub fn with_purge_signal(mut self, signal: Arc<Notify>) -> Self {
        self.purge_signal = Some(signal);
        self
    }

    /// Handle one event. The dedup check, the side effects and the inbox
    /// record share one transaction.
    pub fn consume(&self, event: &InboundEvent) -> EvidenceResult<InboxOutcome> {
        if event.event_id.trim().is_empty() {
            return Err(EvidenceError::InvalidInput("event_id is required".to_string()));
        }

        let outcome = self.repo.transaction(|uow| {
            if uow.inbox_contains(&event.event_id)? {
                return Ok(InboxOutcome::Duplicate);
            }

            let rows = match event.event_name.as_str() {
                CASE_DELETED => uow.live_evidence_for_case(payload_str(event, "case_id")?)?,
                USER_DELETED => uow.live_evidence_for_user(payload_str(event, "user_id")?)?,
                _ => return Ok(InboxOutcome::Ignored),
            };
            let affected = cascade_delete(uow, rows)?;

            uow.insert_inbox(&InboxRecord {
                event_id: event.event_id.clone(),
                event_name: event.event_name.clone(),
                processed_at: Utc::now(),
            })?;
            Ok(InboxOutcome::Processed { affected })
        })?;

        match outcome {
            InboxOutcome::Processed { affected } => {
                info!(
                    event_id = %event.event_id,
                    event_name = %event.event_name,
                    affected,
                    "inbound event processed"
                );
                if affected > 0 {
                    if let Some(signal) = &self.purge_signal {
                        signal.notify_one();
                    }
                }
            }
            InboxOutcome::Duplicate => {
                debug!(event_id = %event.event_id, "duplicate inbound event skipped");
            }
            InboxOutcome::Ignored => {
                debug!(
                    event_id = %event.event_id,
                    event_name = %event.event_name,
                    "no handler for inbound event"
                );
            }
        }
        Ok(outcome)
    }

    /// Serve deliveries one at a time until shutdown or the channel closes.
    pub async fn run(
        &self,
        mut deliveries: mpsc::Receiver<InboxDelivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("inbox consumer started");
        loop {
            let delivery = tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let result = self.consume(&delivery.event);
            if let Err(err) = &result {
                if err.is_retryable() {
                    error!(event_id = %delivery.event.event_id, error = %err, "inbound event failed");
                } else {
                    warn!(event_id = %delivery.event.event_id, error = %err, "inbound event rejected");
                }
            }
            if delivery.ack.send(result).is_err() {
                debug!(event_id = %delivery.event.event_id, "delivery acknowledged after sender left");
            }
        }
        info!("inbox consumer stopped");
    }
}
