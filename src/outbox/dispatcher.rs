use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::EvidenceResult;
use crate::metadata::MetadataRepository;
use crate::outbox::publisher::{EventPublisher, PublishError};
use crate::runtime::sleep_or_shutdown;

/// Settings for the outbox dispatcher loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Wait between polls when the queue is drained.
    pub poll_interval: Duration,
    /// Maximum events handled per poll.
    pub batch_size: usize,
    /// Attempts before an event is marked failed.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single publish call.
    pub publish_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            max_attempts: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max)
}

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.delivered + self.retried + self.failed
    }
}

/// Drains the outbox into an [`EventPublisher`].
///
/// Delivery is at-least-once: an event is only marked delivered after the
/// publisher acknowledged it, so a crash in between redelivers it.
pub struct OutboxDispatcher {
    repo: MetadataRepository,
    publisher: Arc<dyn EventPublisher>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        repo: MetadataRepository,
        publisher: Arc<dyn EventPublisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            repo,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Deliver every due event once.
    pub async fn dispatch_once(&self) -> EvidenceResult<DispatchReport> {
        let mut report = DispatchReport::default();
        let events = self.repo.due_events(Utc::now(), self.config.batch_size)?;

        for event in events {
            let outcome = match tokio::time::timeout(
                self.config.publish_timeout,
                self.publisher.publish(&event),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PublishError::Timeout(self.config.publish_timeout)),
            };

            match outcome {
                Ok(()) => {
                    self.repo.mark_delivered(&event.event_id, Utc::now())?;
                    debug!(
                        event_id = %event.event_id,
                        event_name = %event.event_name,
                        "delivered outbox event"
                    );
                    report.delivered += 1;
                }
                Err(err) => {
                    let attempts = event.attempt_count.saturating_add(1);
                    let reason = err.to_string();
                    if attempts >= self.config.max_attempts {
                        self.repo.mark_failed(&event.event_id, attempts, &reason)?;
                        error!(
                            event_id = %event.event_id,
                            event_name = %event.event_name,
                            aggregate_id = %event.aggregate_id,
                            attempts,
                            error = %reason,
                            "outbox event exhausted its retries and was marked failed"
                        );
                        report.failed += 1;
                    } else {
                        let delay = backoff_delay(
                            attempts,
                            self.config.base_backoff,
                            self.config.max_backoff,
                        );
                        let next_attempt_at = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::days(1));
                        self.repo
                            .schedule_retry(&event.event_id, attempts, next_attempt_at, &reason)?;
                        warn!(
                            event_id = %event.event_id,
                            event_name = %event.event_name,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %reason,
                            "outbox delivery failed, will retry"
                        );
                        report.retried += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "outbox dispatcher started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let drained = match self.dispatch_once().await {
                Ok(report) => {
                    if report.total() > 0 {
                        debug!(
                            delivered = report.delivered,
                            retried = report.retried,
                            failed = report.failed,
                            "outbox pass finished"
                        );
                    }
                    report.total() < self.config.batch_size
                }
                Err(err) => {
                    error!(error = %err, "outbox dispatch pass failed");
                    true
                }
            };
            if drained && sleep_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                break;
            }
        }
        info!("outbox dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::outbox::{EventStatus, NewOutboxEvent, OutboxEvent};

    /// Publisher that fails the first `failures` calls.
    #[derive(Default)]
    struct ScriptedPublisher {
        failures: AtomicUsize,
        delivered: Mutex<Vec<String>>,
    }

    impl ScriptedPublisher {
        fn failing(times: usize) -> Self {
            Self {
                failures: AtomicUsize::new(times),
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for ScriptedPublisher {
        async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PublishError::Transport("connection refused".to_string()));
            }
            self.delivered.lock().unwrap().push(event.event_id.clone());
            Ok(())
        }
    }

    struct SlowPublisher;

    #[async_trait]
    impl EventPublisher for SlowPublisher {
        async fn publish(&self, _event: &OutboxEvent) -> Result<(), PublishError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn enqueue(repo: &MetadataRepository, aggregate: &str) -> String {
        let event = NewOutboxEvent::new("evidence.uploaded.v1", aggregate, json!({"evidence_id": aggregate}));
        let event_id = event.event_id.clone();
        repo.transaction(|uow| uow.enqueue(&event)).expect("enqueue");
        event_id
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_backoff(Duration::ZERO, Duration::ZERO)
            .with_max_attempts(3)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(10));
        assert_eq!(backoff_delay(200, base, max), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_delivers_in_creation_order() {
        let repo = MetadataRepository::in_memory().expect("repo");
        let first = enqueue(&repo, "e1");
        let second = enqueue(&repo, "e2");
        let publisher = Arc::new(ScriptedPublisher::default());
        let dispatcher = OutboxDispatcher::new(repo.clone(), publisher.clone(), fast_config());

        let report = dispatcher.dispatch_once().await.expect("dispatch");

        assert_eq!(report.delivered, 2);
        assert_eq!(publisher.delivered(), vec![first.clone(), second]);
        let stored = repo.get_event(&first).expect("get").expect("event");
        assert_eq!(stored.status, EventStatus::Delivered);
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_with_backoff() {
        let repo = MetadataRepository::in_memory().expect("repo");
        let event_id = enqueue(&repo, "e1");
        let publisher = Arc::new(ScriptedPublisher::failing(1));
        let config = fast_config().with_backoff(Duration::from_secs(60), Duration::from_secs(600));
        let dispatcher = OutboxDispatcher::new(repo.clone(), publisher, config);

        let report = dispatcher.dispatch_once().await.expect("dispatch");

        assert_eq!(report.retried, 1);
        let stored = repo.get_event(&event_id).expect("get").expect("event");
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.next_attempt_at > Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(stored.last_error.as_deref(), Some("Transport error: connection refused"));
        assert_eq!(dispatcher.dispatch_once().await.expect("dispatch").total(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_event_is_marked_failed() {
        let repo = MetadataRepository::in_memory().expect("repo");
        let event_id = enqueue(&repo, "e1");
        let publisher = Arc::new(ScriptedPublisher::failing(10));
        let dispatcher = OutboxDispatcher::new(repo.clone(), publisher, fast_config());

        let mut last = DispatchReport::default();
        for _ in 0..3 {
            last = dispatcher.dispatch_once().await.expect("dispatch");
        }

        assert_eq!(last.failed, 1);
        let stored = repo.get_event(&event_id).expect("get").expect("event");
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(dispatcher.dispatch_once().await.expect("dispatch").total(), 0);
    }

    #[tokio::test]
    async fn test_later_event_for_same_evidence_waits() {
        let repo = MetadataRepository::in_memory().expect("repo");
        let uploaded = enqueue(&repo, "e1");
        let deleted = enqueue(&repo, "e1");
        let unrelated = enqueue(&repo, "e2");
        let publisher = Arc::new(ScriptedPublisher::failing(1));
        let config = fast_config().with_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let dispatcher = OutboxDispatcher::new(repo.clone(), publisher.clone(), config);

        dispatcher.dispatch_once().await.expect("dispatch");

        assert_eq!(publisher.delivered(), vec![unrelated]);
        let held = repo.get_event(&deleted).expect("get").expect("event");
        assert_eq!(held.status, EventStatus::Pending);
        assert_eq!(held.attempt_count, 0);
        let retried = repo.get_event(&uploaded).expect("get").expect("event");
        assert_eq!(retried.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_slow_publisher_times_out() {
        let repo = MetadataRepository::in_memory().expect("repo");
        let event_id = enqueue(&repo, "e1");
        let config = fast_config().with_publish_timeout(Duration::from_millis(20));
        let dispatcher = OutboxDispatcher::new(repo.clone(), Arc::new(SlowPublisher), config);

        let report = dispatcher.dispatch_once().await.expect("dispatch");

        assert_eq!(report.retried, 1);
        let stored = repo.get_event(&event_id).expect("get").expect("event");
        assert!(stored.last_error.unwrap_or_default().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_run_drains_and_stops_on_shutdown() {
        let repo = MetadataRepository::in_memory().expect("repo");
        let event_id = enqueue(&repo, "e1");
        let publisher = Arc::new(ScriptedPublisher::default());
        let dispatcher = Arc::new(OutboxDispatcher::new(repo.clone(), publisher.clone(), fast_config()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run(stop_rx).await })
        };
        for _ in 0..100 {
            if !publisher.delivered().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop exits")
            .expect("join");

        assert_eq!(publisher.delivered(), vec![event_id]);
    }
}
