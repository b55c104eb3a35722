//! Physical removal of soft-deleted evidence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::error::EvidenceResult;
use crate::metadata::MetadataRepository;
use crate::outbox::backoff_delay;
use crate::storage::{DeleteOutcome, StorageBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Fallback poll interval; deletes also wake the reaper directly.
    pub interval: Duration,
    pub batch_size: usize,
    /// Failed attempts after which a purge is reported as an operator alert.
    pub alert_after_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 50,
            alert_after_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl ReaperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_alert_after_attempts(mut self, attempts: u32) -> Self {
        self.alert_after_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Objects removed by this pass.
    pub purged: usize,
    /// Rows whose object was already gone.
    pub already_absent: usize,
    /// Deletes that failed and were rescheduled.
    pub retried: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.purged + self.already_absent + self.retried
    }
}

pub struct PurgeReaper {
    storage: Arc<dyn StorageBackend>,
    repo: MetadataRepository,
    config: ReaperConfig,
    signal: Arc<Notify>,
}

impl PurgeReaper {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        repo: MetadataRepository,
        config: ReaperConfig,
        signal: Arc<Notify>,
    ) -> Self {
        Self {
            storage,
            repo,
            config,
            signal,
        }
    }

    /// Remove the objects of every due soft-deleted row.
    ///
    /// A row is marked purged only after the backend confirms the object is
    /// gone; failures keep the row and push its next attempt out.
    pub async fn purge_once(&self) -> EvidenceResult<PurgeReport> {
        let mut report = PurgeReport::default();
        let tasks = self.repo.due_purges(Utc::now(), self.config.batch_size)?;

        for task in tasks {
            match self.storage.delete(&task.storage_path).await {
                Ok(outcome) => {
                    self.repo.mark_purged(&task.evidence_id, Utc::now())?;
                    match outcome {
                        DeleteOutcome::Deleted => report.purged += 1,
                        DeleteOutcome::NotFound => report.already_absent += 1,
                    }
                    debug!(
                        evidence_id = %task.evidence_id,
                        locator = %task.storage_path,
                        ?outcome,
                        "evidence purged"
                    );
                }
                Err(err) => {
                    let attempts = task.purge_attempts.saturating_add(1);
                    let delay =
                        backoff_delay(attempts, self.config.base_backoff, self.config.max_backoff);
                    let next_attempt = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::days(1));
                    self.repo.schedule_purge_retry(
                        &task.evidence_id,
                        attempts,
                        next_attempt,
                        &err.to_string(),
                    )?;
                    report.retried += 1;

                    if attempts >= self.config.alert_after_attempts {
                        error!(
                            evidence_id = %task.evidence_id,
                            locator = %task.storage_path,
                            attempts,
                            error = %err,
                            "deleted evidence still present in storage"
                        );
                    } else {
                        warn!(
                            evidence_id = %task.evidence_id,
                            locator = %task.storage_path,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "purge failed, rescheduled"
                        );
                    }
                }
            }
        }
        Ok(report)
    }

    /// Purge on every delete signal and at least once per interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "purge reaper started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.purge_once().await {
                Ok(report) if report.total() > 0 => info!(
                    purged = report.purged,
                    already_absent = report.already_absent,
                    retried = report.retried,
                    "purge pass finished"
                ),
                Ok(_) => {}
                Err(err) => error!(error = %err, "purge pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.signal.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("purge reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::Map;

    use crate::error::EvidenceError;
    use crate::evidence::{Evidence, EvidenceType};
    use crate::storage::{
        stream_from_bytes, ByteStream, MemoryObjectClient, ObjectStoreBackend, PutOptions,
        PutReceipt, StoredObject,
    };

    /// Object store whose deletes can be made to fail.
    struct FlakyStore {
        inner: ObjectStoreBackend,
        failing: AtomicBool,
    }

    #[async_trait]
    impl StorageBackend for FlakyStore {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn put(
            &self,
            locator: &str,
            body: ByteStream,
            options: PutOptions,
        ) -> EvidenceResult<PutReceipt> {
            self.inner.put(locator, body, options).await
        }

        async fn get(&self, locator: &str) -> EvidenceResult<ByteStream> {
            self.inner.get(locator).await
        }

        async fn exists(&self, locator: &str) -> EvidenceResult<bool> {
            self.inner.exists(locator).await
        }

        async fn delete(&self, locator: &str) -> EvidenceResult<DeleteOutcome> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EvidenceError::storage("backend unavailable"));
            }
            self.inner.delete(locator).await
        }

        async fn list(&self) -> EvidenceResult<Vec<StoredObject>> {
            self.inner.list().await
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn flaky_store() -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: ObjectStoreBackend::new(Arc::new(MemoryObjectClient::new()), "evidence"),
            failing: AtomicBool::new(false),
        })
    }

    fn evidence(id: &str, locator: &str) -> Evidence {
        Evidence {
            evidence_id: id.to_string(),
            user_id: "u1".to_string(),
            case_id: None,
            filename: "a.txt".to_string(),
            content_type: "text/plain".to_string(),
            size_bytes: 3,
            evidence_type: EvidenceType::Document,
            storage_path: locator.to_string(),
            checksum_sha256: String::new(),
            description: None,
            metadata: Map::new(),
            uploaded_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default(),
            uploaded_by: "u1".to_string(),
            deleted: false,
            deleted_at: None,
            purged_at: None,
        }
    }

    async fn stored_and_deleted(store: &FlakyStore, repo: &MetadataRepository, id: &str) -> String {
        let locator = format!("u1/unlinked/{}_a.txt", id);
        store
            .put(&locator, stream_from_bytes(b"abc".to_vec()), PutOptions::new(1024))
            .await
            .expect("put");
        let row = evidence(id, &locator);
        repo.transaction(|uow| {
            uow.insert_evidence(&row)?;
            uow.soft_delete(id, Utc::now())?;
            Ok(())
        })
        .expect("rows");
        locator
    }

    fn reaper(store: Arc<FlakyStore>, repo: MetadataRepository) -> PurgeReaper {
        PurgeReaper::new(
            store,
            repo,
            ReaperConfig::default()
                .with_alert_after_attempts(2)
                .with_backoff(Duration::ZERO, Duration::ZERO),
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn test_purges_deleted_objects() {
        let store = flaky_store();
        let repo = MetadataRepository::in_memory().expect("repo");
        let locator = stored_and_deleted(&store, &repo, "e1").await;

        let report = reaper(store.clone(), repo.clone()).purge_once().await.expect("pass");

        assert_eq!(report.purged, 1);
        assert!(!store.exists(&locator).await.expect("exists"));
        let row = repo.get_evidence("e1").expect("get").expect("row");
        assert!(row.purged_at.is_some());
        assert!(repo.due_purges(Utc::now(), 10).expect("due").is_empty());
    }

    #[tokio::test]
    async fn test_already_missing_object_counts_as_purged() {
        let store = flaky_store();
        let repo = MetadataRepository::in_memory().expect("repo");
        let locator = stored_and_deleted(&store, &repo, "e1").await;
        store.inner.delete(&locator).await.expect("external delete");

        let report = reaper(store, repo.clone()).purge_once().await.expect("pass");

        assert_eq!(report.already_absent, 1);
        assert!(repo.get_evidence("e1").expect("get").expect("row").purged_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried_until_backend_recovers() {
        let store = flaky_store();
        let repo = MetadataRepository::in_memory().expect("repo");
        let locator = stored_and_deleted(&store, &repo, "e1").await;
        let reaper = reaper(store.clone(), repo.clone());

        store.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            let report = reaper.purge_once().await.expect("pass");
            assert_eq!(report.retried, 1);
        }
        let pending = repo.due_purges(Utc::now(), 10).expect("due");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].purge_attempts, 3);
        assert!(store.exists(&locator).await.expect("exists"));

        store.failing.store(false, Ordering::SeqCst);
        let report = reaper.purge_once().await.expect("pass");
        assert_eq!(report.purged, 1);
        assert!(!store.exists(&locator).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_run_wakes_on_signal_and_stops() {
        let store = flaky_store();
        let repo = MetadataRepository::in_memory().expect("repo");
        let signal = Arc::new(Notify::new());
        let reaper = Arc::new(PurgeReaper::new(
            store.clone(),
            repo.clone(),
            ReaperConfig::default().with_interval(Duration::from_secs(3600)),
            Arc::clone(&signal),
        ));
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn({
            let reaper = Arc::clone(&reaper);
            async move { reaper.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let locator = stored_and_deleted(&store, &repo, "e1").await;
        signal.notify_one();

        let mut purged = false;
        for _ in 0..50 {
            if !store.exists(&locator).await.expect("exists") {
                purged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(purged);

        stop.send(true).expect("stop");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper stopped")
            .expect("join");
    }
}
