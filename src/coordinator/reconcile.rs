//! Periodic comparison of stored objects against metadata rows.
//!
//! Orphans (objects no row references) older than the grace period are
//! deleted. Dangling rows (live rows whose object is missing) cannot be
//! repaired here and are only reported.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::EvidenceResult;
use crate::metadata::MetadataRepository;
use crate::runtime::sleep_or_shutdown;
use crate::storage::StorageBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Objects younger than this are never treated as orphans.
    pub grace_period: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            grace_period: Duration::from_secs(900),
        }
    }
}

impl ReconcileConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub dry_run: bool,
    pub scanned_objects: usize,
    /// Locators of orphaned objects past the grace period.
    pub orphans_found: Vec<String>,
    pub orphans_removed: usize,
    /// Live evidence ids whose object is missing.
    pub dangling_records: Vec<String>,
    pub staging_removed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphans_found.is_empty() && self.dangling_records.is_empty() && self.staging_removed == 0
    }
}

pub struct ReconciliationSweep {
    storage: Arc<dyn StorageBackend>,
    repo: MetadataRepository,
    config: ReconcileConfig,
}

impl ReconciliationSweep {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        repo: MetadataRepository,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            storage,
            repo,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// One full pass. With `dry_run` nothing is deleted.
    ///
    /// Rows are read before the listing and again after it; an object counts
    /// as orphaned only if neither read references it, so uploads committing
    /// during the sweep are never touched.
    pub async fn sweep(&self, dry_run: bool) -> EvidenceResult<ReconcileReport> {
        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - grace;
        let mut report = ReconcileReport {
            dry_run,
            ..ReconcileReport::default()
        };

        let tracked_before = self.repo.tracked_storage_paths()?;
        let live_before = self.repo.live_locators()?;
        let objects = self.storage.list().await?;
        let tracked_after = self.repo.tracked_storage_paths()?;
        report.scanned_objects = objects.len();

        for object in &objects {
            if tracked_before.contains(&object.locator) || tracked_after.contains(&object.locator) {
                continue;
            }
            if object.last_modified > cutoff {
                debug!(locator = %object.locator, "untracked object inside grace period");
                continue;
            }
            report.orphans_found.push(object.locator.clone());
            if dry_run {
                continue;
            }
            match self.storage.delete(&object.locator).await {
                Ok(_) => {
                    report.orphans_removed += 1;
                    info!(locator = %object.locator, "orphaned object removed");
                }
                Err(err) => warn!(locator = %object.locator, error = %err, "orphan removal failed"),
            }
        }

        let listed: HashSet<&str> = objects.iter().map(|object| object.locator.as_str()).collect();
        for (evidence_id, locator) in live_before {
            if listed.contains(locator.as_str()) {
                continue;
            }
            // Deleted since the first read, or written after the listing.
            let still_live = self
                .repo
                .get_evidence(&evidence_id)?
                .is_some_and(|evidence| evidence.is_live());
            if !still_live || self.storage.exists(&locator).await? {
                continue;
            }
            error!(
                evidence_id = %evidence_id,
                locator = %locator,
                "live evidence has no stored object"
            );
            report.dangling_records.push(evidence_id);
        }

        if !dry_run {
            report.staging_removed = self.storage.sweep_staging(cutoff).await?;
        }

        info!(
            dry_run,
            scanned = report.scanned_objects,
            orphans = report.orphans_found.len(),
            orphans_removed = report.orphans_removed,
            dangling = report.dangling_records.len(),
            staging_removed = report.staging_removed,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    /// Sweep every interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            grace_secs = self.config.grace_period.as_secs(),
            "reconciliation sweep scheduled"
        );
        loop {
            if sleep_or_shutdown(&mut shutdown, self.config.interval).await {
                break;
            }
            if let Err(err) = self.sweep(false).await {
                error!(error = %err, "reconciliation sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::DateTime;
    use serde_json::Map;
    use tempfile::TempDir;

    use crate::evidence::{Evidence, EvidenceType};
    use crate::storage::{
        stream_from_bytes, LocalBackend, MemoryObjectClient, ObjectStoreBackend, PutOptions,
    };

    fn row(id: &str, locator: &str) -> Evidence {
        Evidence {
            evidence_id: id.to_string(),
            user_id: "u1".to_string(),
            case_id: None,
            filename: "a.txt".to_string(),
            content_type: "text/plain".to_string(),
            size_bytes: 1,
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

    async fn put(storage: &dyn StorageBackend, locator: &str) {
        storage
            .put(locator, stream_from_bytes(b"x".to_vec()), PutOptions::new(16))
            .await
            .expect("put");
    }

    #[tokio::test]
    async fn test_sweep_removes_old_orphans_and_reports_dangling() {
        let client = Arc::new(MemoryObjectClient::new());
        let storage: Arc<dyn StorageBackend> =
            Arc::new(ObjectStoreBackend::new(client.clone(), "evidence"));
        let repo = MetadataRepository::in_memory().expect("repo");

        put(storage.as_ref(), "u1/unlinked/e1_a.txt").await;
        repo.transaction(|uow| {
            uow.insert_evidence(&row("e1", "u1/unlinked/e1_a.txt"))?;
            uow.insert_evidence(&row("e2", "u1/unlinked/e2_a.txt"))
        })
        .expect("rows");
        let old = Utc::now() - chrono::Duration::hours(2);
        client.insert_object("evidence/u1/unlinked/stray_a.txt", b"x".to_vec(), old);
        put(storage.as_ref(), "u1/unlinked/fresh_a.txt").await;

        let sweep = ReconciliationSweep::new(storage.clone(), repo, ReconcileConfig::default());
        let report = sweep.sweep(false).await.expect("sweep");

        assert_eq!(report.scanned_objects, 3);
        assert_eq!(report.orphans_found, vec!["u1/unlinked/stray_a.txt".to_string()]);
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.dangling_records, vec!["e2".to_string()]);
        assert!(!client.contains("evidence/u1/unlinked/stray_a.txt"));
        assert!(storage.exists("u1/unlinked/fresh_a.txt").await.expect("exists"));
        assert!(storage.exists("u1/unlinked/e1_a.txt").await.expect("exists"));

        let again = sweep.sweep(false).await.expect("second sweep");
        assert!(again.orphans_found.is_empty());
        assert_eq!(again.orphans_removed, 0);
        assert_eq!(again.dangling_records, vec!["e2".to_string()]);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let client = Arc::new(MemoryObjectClient::new());
        let storage: Arc<dyn StorageBackend> =
            Arc::new(ObjectStoreBackend::new(client.clone(), "evidence"));
        let repo = MetadataRepository::in_memory().expect("repo");
        let old = Utc::now() - chrono::Duration::hours(2);
        client.insert_object("evidence/u1/unlinked/stray_a.txt", b"x".to_vec(), old);

        let sweep = ReconciliationSweep::new(storage, repo, ReconcileConfig::default());
        let report = sweep.sweep(true).await.expect("sweep");

        assert!(report.dry_run);
        assert_eq!(report.orphans_found.len(), 1);
        assert_eq!(report.orphans_removed, 0);
        assert!(client.contains("evidence/u1/unlinked/stray_a.txt"));
    }

    #[tokio::test]
    async fn test_deleted_but_unpurged_objects_are_not_orphans() {
        let root = TempDir::new().expect("temp dir");
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalBackend::new(root.path()).expect("backend"));
        let repo = MetadataRepository::in_memory().expect("repo");
        put(storage.as_ref(), "u1/unlinked/e1_a.txt").await;
        repo.transaction(|uow| {
            uow.insert_evidence(&row("e1", "u1/unlinked/e1_a.txt"))?;
            uow.soft_delete("e1", Utc::now())?;
            Ok(())
        })
        .expect("rows");

        let sweep = ReconciliationSweep::new(
            storage.clone(),
            repo,
            ReconcileConfig::default().with_grace_period(Duration::ZERO),
        );
        let report = sweep.sweep(false).await.expect("sweep");

        assert!(report.is_clean());
        assert!(storage.exists("u1/unlinked/e1_a.txt").await.expect("exists"));
    }
}
