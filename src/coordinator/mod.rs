//! Keeps stored bytes, metadata rows and outbox events consistent.
//!
//! Writes always go bytes first, then one metadata transaction holding the
//! row change and its event. Deletes go the other way: the logical delete
//! commits first and the [`reaper::PurgeReaper`] removes bytes afterwards.
//! Anything left behind by a crash between the two legs is picked up by the
//! [`reconcile::ReconciliationSweep`].

pub mod reaper;
pub mod reconcile;

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EvidenceError, EvidenceResult};
use crate::evidence::{build_locator, Evidence, EvidenceFilter, UploadRequest};
use crate::guard::DependencyGuard;
use crate::metadata::MetadataRepository;
use crate::outbox::{NewOutboxEvent, EVIDENCE_DELETED, EVIDENCE_LINKED, EVIDENCE_PROCESSED, EVIDENCE_UPLOADED};
use crate::storage::{ByteStream, PutOptions, StorageBackend};

pub use reaper::{PurgeReaper, PurgeReport, ReaperConfig};
pub use reconcile::{ReconcileConfig, ReconcileReport, ReconciliationSweep};

/// Default upload ceiling: 50 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub max_upload_bytes: u64,
    /// Check the uploader with the Auth service before writing.
    pub verify_uploader: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            verify_uploader: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn with_verify_uploader(mut self, verify: bool) -> Self {
        self.verify_uploader = verify;
        self
    }
}

/// Storage and database reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub storage: bool,
    pub database: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.storage && self.database
    }
}

fn live_or_not_found(evidence: Option<Evidence>, evidence_id: &str) -> EvidenceResult<Evidence> {
    evidence
        .filter(Evidence::is_live)
        .ok_or_else(|| EvidenceError::NotFound(format!("evidence {}", evidence_id)))
}

fn ensure_owner(evidence: &Evidence, user_id: &str) -> EvidenceResult<()> {
    if evidence.user_id == user_id {
        Ok(())
    } else {
        Err(EvidenceError::Forbidden(format!(
            "evidence {} is not owned by {}",
            evidence.evidence_id, user_id
        )))
    }
}

pub struct WriteCoordinator {
    storage: Arc<dyn StorageBackend>,
    repo: MetadataRepository,
    guard: Arc<DependencyGuard>,
    config: CoordinatorConfig,
    purge_signal: Arc<Notify>,
}

impl WriteCoordinator {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        repo: MetadataRepository,
        guard: Arc<DependencyGuard>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            storage,
            repo,
            guard,
            config,
            purge_signal: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn repository(&self) -> &MetadataRepository {
        &self.repo
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Notified after every committed delete; the reaper waits on it.
    pub fn purge_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.purge_signal)
    }

    /// Store a new artifact and record it.
    ///
    /// Ownership checks run before any byte is written. On success the row
    /// and its `evidence.uploaded.v1` event are committed together.
    pub async fn upload(&self, request: UploadRequest, body: ByteStream) -> EvidenceResult<Evidence> {
        if request.user_id.trim().is_empty() {
            return Err(EvidenceError::InvalidInput("user_id is required".to_string()));
        }
        if request.filename.trim().is_empty() {
            return Err(EvidenceError::InvalidInput("filename is required".to_string()));
        }
        if let Some(declared) = request.declared_size {
            if declared > self.config.max_upload_bytes {
                return Err(EvidenceError::SizeLimitExceeded {
                    limit: self.config.max_upload_bytes,
                });
            }
        }

        if self.config.verify_uploader {
            self.guard.ensure_user_exists(&request.user_id).await?;
        }
        if let Some(case_id) = request.case_id.as_deref() {
            self.guard.ensure_case_owner(&request.user_id, case_id).await?;
        }

        let evidence_id = Uuid::new_v4().to_string();
        let locator = build_locator(
            &request.user_id,
            request.case_id.as_deref(),
            &evidence_id,
            &request.filename,
        );
        let options = PutOptions::new(self.config.max_upload_bytes)
            .with_expected_size(request.declared_size);

        let receipt = match self.storage.put(&locator, body, options).await {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(
                    evidence_id = %evidence_id,
                    locator = %locator,
                    error = %err,
                    kind = err.kind_label(),
                    "upload write failed"
                );
                if matches!(err, EvidenceError::StorageIo(_)) {
                    self.compensate(&evidence_id, &locator).await;
                }
                return Err(err);
            }
        };

        let evidence_type = request.resolved_type();
        let evidence = Evidence {
            evidence_id: evidence_id.clone(),
            user_id: request.user_id.clone(),
            case_id: request.case_id,
            filename: request.filename,
            content_type: request.content_type,
            size_bytes: receipt.committed_size,
            evidence_type,
            storage_path: locator.clone(),
            checksum_sha256: receipt.checksum_sha256,
            description: request.description,
            metadata: Map::new(),
            uploaded_at: Utc::now().trunc_subsecs(3),
            uploaded_by: request.user_id,
            deleted: false,
            deleted_at: None,
            purged_at: None,
        };

        let committed = self.repo.transaction(|uow| {
            uow.insert_evidence(&evidence)?;
            uow.enqueue(&NewOutboxEvent::for_evidence(EVIDENCE_UPLOADED, &evidence))
        });
        if let Err(err) = committed {
            error!(
                evidence_id = %evidence_id,
                locator = %locator,
                error = %err,
                "metadata commit failed after write"
            );
            self.compensate(&evidence_id, &locator).await;
            return Err(err);
        }

        info!(
            evidence_id = %evidence.evidence_id,
            user_id = %evidence.user_id,
            case_id = evidence.case_id.as_deref().unwrap_or("-"),
            size_bytes = evidence.size_bytes,
            evidence_type = %evidence.evidence_type,
            "evidence uploaded"
        );
        Ok(evidence)
    }

    /// Best effort; whatever survives is reclaimed by reconciliation.
    async fn compensate(&self, evidence_id: &str, locator: &str) {
        match self.storage.delete(locator).await {
            Ok(outcome) => info!(evidence_id, locator, ?outcome, "compensating delete done"),
            Err(err) => error!(
                evidence_id,
                locator,
                error = %err,
                "compensating delete failed, object left for reconciliation"
            ),
        }
    }

    /// Logically delete evidence owned by `user_id`. Bytes are removed later by the reaper.
    pub async fn delete(&self, evidence_id: &str, user_id: &str) -> EvidenceResult<Evidence> {
        let deleted = self.repo.transaction(|uow| {
            let mut evidence = live_or_not_found(uow.evidence_for_update(evidence_id)?, evidence_id)?;
            ensure_owner(&evidence, user_id)?;

            let now = Utc::now().trunc_subsecs(3);
            uow.soft_delete(evidence_id, now)?;
            evidence.deleted = true;
            evidence.deleted_at = Some(now);
            uow.enqueue(&NewOutboxEvent::for_evidence(EVIDENCE_DELETED, &evidence))?;
            Ok(evidence)
        })?;

        self.purge_signal.notify_one();
        info!(evidence_id, user_id, "evidence deleted");
        Ok(deleted)
    }

    /// Attach evidence to a case the caller owns. The stored object keeps its locator.
    pub async fn link_to_case(
        &self,
        evidence_id: &str,
        user_id: &str,
        case_id: &str,
    ) -> EvidenceResult<Evidence> {
        if case_id.trim().is_empty() {
            return Err(EvidenceError::InvalidInput("case_id is required".to_string()));
        }
        let current = live_or_not_found(self.repo.get_evidence(evidence_id)?, evidence_id)?;
        ensure_owner(&current, user_id)?;
        if current.case_id.as_deref() == Some(case_id) {
            return Ok(current);
        }

        self.guard.ensure_case_owner(user_id, case_id).await?;

        let linked = self.repo.transaction(|uow| {
            let mut evidence = live_or_not_found(uow.evidence_for_update(evidence_id)?, evidence_id)?;
            ensure_owner(&evidence, user_id)?;
            if evidence.case_id.as_deref() == Some(case_id) {
                return Ok(evidence);
            }

            let previous = evidence.case_id.replace(case_id.to_string());
            uow.set_case(evidence_id, case_id)?;
            uow.enqueue(
                &NewOutboxEvent::for_evidence(EVIDENCE_LINKED, &evidence)
                    .with_payload_field("previous_case_id", json!(previous)),
            )?;
            Ok(evidence)
        })?;

        info!(evidence_id, user_id, case_id, "evidence linked to case");
        Ok(linked)
    }

    /// Merge processing results into the evidence metadata and announce them.
    pub async fn record_processing(
        &self,
        evidence_id: &str,
        results: Map<String, Value>,
    ) -> EvidenceResult<Evidence> {
        let updated = self.repo.transaction(|uow| {
            let mut evidence = live_or_not_found(uow.evidence_for_update(evidence_id)?, evidence_id)?;
            evidence
                .metadata
                .extend(results.iter().map(|(key, value)| (key.clone(), value.clone())));
            uow.set_metadata(evidence_id, &evidence.metadata)?;
            uow.enqueue(
                &NewOutboxEvent::for_evidence(EVIDENCE_PROCESSED, &evidence)
                    .with_payload_field("processing", Value::Object(results.clone())),
            )?;
            Ok(evidence)
        })?;

        info!(evidence_id, fields = results.len(), "evidence processing recorded");
        Ok(updated)
    }

    /// Evidence owned by `user_id`.
    pub async fn get(&self, evidence_id: &str, user_id: &str) -> EvidenceResult<Evidence> {
        let evidence = live_or_not_found(self.repo.get_evidence(evidence_id)?, evidence_id)?;
        ensure_owner(&evidence, user_id)?;
        Ok(evidence)
    }

    /// Evidence owned by `user_id` together with its bytes.
    pub async fn download(
        &self,
        evidence_id: &str,
        user_id: &str,
    ) -> EvidenceResult<(Evidence, ByteStream)> {
        let evidence = self.get(evidence_id, user_id).await?;
        match self.storage.get(&evidence.storage_path).await {
            Ok(stream) => Ok((evidence, stream)),
            Err(EvidenceError::NotFound(_)) => {
                error!(
                    evidence_id,
                    locator = %evidence.storage_path,
                    "live evidence has no stored object"
                );
                Err(EvidenceError::NotFound(format!("evidence {}", evidence_id)))
            }
            Err(err) => Err(err),
        }
    }

    /// Live evidence of `user_id`, newest first. The filter's own user is ignored.
    pub async fn list(&self, user_id: &str, filter: EvidenceFilter) -> EvidenceResult<Vec<Evidence>> {
        let filter = EvidenceFilter {
            user_id: Some(user_id.to_string()),
            ..filter
        };
        self.repo.list_evidence(&filter)
    }

    pub async fn health(&self) -> HealthReport {
        let database = match self.repo.ping() {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "metadata store health check failed");
                false
            }
        };
        HealthReport {
            storage: self.storage.health_check().await,
            database,
        }
    }
}
