//! SQLite-backed metadata store.
//!
//! Evidence rows, outbox events and inbox records live in one database so a
//! single transaction can change all three. Mutations that must be atomic go
//! through [`MetadataRepository::transaction`]; everything else is a plain
//! read or a single-statement update used by the background loops.

mod unit_of_work;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use crate::error::{EvidenceError, EvidenceResult};
use crate::evidence::{Evidence, EvidenceFilter};
use crate::inbox::InboxRecord;
use crate::outbox::{EventStatus, OutboxEvent, OutboxStats};

pub use unit_of_work::UnitOfWork;

const EVIDENCE_COLUMNS: &str = "evidence_id, user_id, case_id, filename, content_type, \
     size_bytes, evidence_type, storage_path, checksum_sha256, description, metadata, \
     uploaded_at, uploaded_by, deleted, deleted_at, purged_at";

const OUTBOX_COLUMNS: &str = "seq, event_id, event_name, aggregate_id, payload, created_at, \
     status, attempt_count, next_attempt_at, last_error, delivered_at";

/// A soft-deleted row whose object still has to be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeTask {
    pub evidence_id: String,
    pub storage_path: String,
    pub purge_attempts: u32,
}

#[derive(Clone)]
pub struct MetadataRepository {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for MetadataRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRepository").finish_non_exhaustive()
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

fn conversion_error(
    column: usize,
    column_type: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, column_type, Box::new(err))
}

pub(crate) fn evidence_from_row(row: &Row<'_>) -> rusqlite::Result<Evidence> {
    let size_bytes: i64 = row.get(5)?;
    let evidence_type: String = row.get(6)?;
    let metadata: String = row.get(10)?;
    let deleted_at: Option<i64> = row.get(14)?;
    let purged_at: Option<i64> = row.get(15)?;

    Ok(Evidence {
        evidence_id: row.get(0)?,
        user_id: row.get(1)?,
        case_id: row.get(2)?,
        filename: row.get(3)?,
        content_type: row.get(4)?,
        size_bytes: u64::try_from(size_bytes).map_err(|err| conversion_error(5, Type::Integer, err))?,
        evidence_type: evidence_type
            .parse()
            .map_err(|err: EvidenceError| conversion_error(6, Type::Text, err))?,
        storage_path: row.get(7)?,
        checksum_sha256: row.get(8)?,
        description: row.get(9)?,
        metadata: serde_json::from_str(&metadata).map_err(|err| conversion_error(10, Type::Text, err))?,
        uploaded_at: from_millis(row.get(11)?),
        uploaded_by: row.get(12)?,
        deleted: row.get(13)?,
        deleted_at: deleted_at.map(from_millis),
        purged_at: purged_at.map(from_millis),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let payload: String = row.get(4)?;
    let status: String = row.get(6)?;
    let attempt_count: i64 = row.get(7)?;
    let delivered_at: Option<i64> = row.get(10)?;

    Ok(OutboxEvent {
        seq: row.get(0)?,
        event_id: row.get(1)?,
        event_name: row.get(2)?,
        aggregate_id: row.get(3)?,
        payload: serde_json::from_str(&payload).map_err(|err| conversion_error(4, Type::Text, err))?,
        created_at: from_millis(row.get(5)?),
        status: status
            .parse()
            .map_err(|err: EvidenceError| conversion_error(6, Type::Text, err))?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|err| conversion_error(7, Type::Integer, err))?,
        next_attempt_at: from_millis(row.get(8)?),
        last_error: row.get(9)?,
        delivered_at: delivered_at.map(from_millis),
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> EvidenceResult<Vec<T>> {
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(EvidenceError::from)
}

/// Map unique/primary key violations to `Conflict`.
pub(crate) fn map_constraint(err: rusqlite::Error, what: &str) -> EvidenceError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            EvidenceError::Conflict(format!("{}: {}", what, err))
        }
        _ => EvidenceError::Database(err),
    }
}

impl MetadataRepository {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> EvidenceResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn in_memory() -> EvidenceResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> EvidenceResult<Self> {
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn lock(&self) -> EvidenceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EvidenceError::Internal("metadata connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> EvidenceResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS evidence (
                evidence_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                case_id TEXT,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                evidence_type TEXT NOT NULL,
                storage_path TEXT NOT NULL UNIQUE,
                checksum_sha256 TEXT NOT NULL,
                description TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                uploaded_at INTEGER NOT NULL,
                uploaded_by TEXT NOT NULL,
                deleted BOOLEAN NOT NULL DEFAULT 0,
                deleted_at INTEGER,
                purged_at INTEGER,
                purge_attempts INTEGER NOT NULL DEFAULT 0,
                next_purge_at INTEGER,
                last_purge_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_evidence_user ON evidence(user_id, deleted);
            CREATE INDEX IF NOT EXISTS idx_evidence_case ON evidence(case_id, deleted);
            CREATE INDEX IF NOT EXISTS idx_evidence_purge
                ON evidence(deleted, purged_at, next_purge_at);

            CREATE TABLE IF NOT EXISTS outbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                event_name TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                delivered_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(status, next_attempt_at, seq);

            CREATE TABLE IF NOT EXISTS inbox (
                event_id TEXT PRIMARY KEY,
                event_name TEXT NOT NULL,
                processed_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Run `work` inside one write transaction.
    ///
    /// Commits when `work` returns `Ok`; any error rolls everything back.
    pub fn transaction<T, F>(&self, work: F) -> EvidenceResult<T>
    where
        F: FnOnce(&UnitOfWork<'_>) -> EvidenceResult<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = work(&UnitOfWork::new(&tx))?;
        tx.commit()?;
        Ok(result)
    }

    /// Cheap connectivity probe for health reporting.
    pub fn ping(&self) -> EvidenceResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn get_evidence(&self, evidence_id: &str) -> EvidenceResult<Option<Evidence>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM evidence WHERE evidence_id = ?1", EVIDENCE_COLUMNS);
        Ok(conn
            .query_row(&sql, params![evidence_id], evidence_from_row)
            .optional()?)
    }

    /// Live evidence matching `filter`, newest first.
    pub fn list_evidence(&self, filter: &EvidenceFilter) -> EvidenceResult<Vec<Evidence>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM evidence
             WHERE deleted = 0
               AND (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR case_id = ?2)
               AND (?3 IS NULL OR evidence_type = ?3)
             ORDER BY uploaded_at DESC, evidence_id ASC",
            EVIDENCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.user_id,
                filter.case_id,
                filter.evidence_type.map(|t| t.as_str())
            ],
            evidence_from_row,
        )?;
        collect_rows(rows)
    }

    /// Locators still owned by a row (live, or deleted but not yet purged).
    pub fn tracked_storage_paths(&self) -> EvidenceResult<HashSet<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT storage_path FROM evidence WHERE purged_at IS NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }

    /// `(evidence_id, storage_path)` for every live row.
    pub fn live_locators(&self) -> EvidenceResult<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT evidence_id, storage_path FROM evidence WHERE deleted = 0 ORDER BY evidence_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        collect_rows(rows)
    }

    // ---- outbox ----

    /// Pending events whose next attempt is due, in creation order.
    ///
    /// An event is held back while an earlier event for the same evidence is
    /// still pending, so consumers see one evidence's changes in order.
    pub fn due_events(&self, now: DateTime<Utc>, limit: usize) -> EvidenceResult<Vec<OutboxEvent>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM outbox
             WHERE status = 'pending' AND next_attempt_at <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM outbox AS earlier
                   WHERE earlier.aggregate_id = outbox.aggregate_id
                     AND earlier.seq < outbox.seq
                     AND earlier.status = 'pending'
               )
             ORDER BY seq ASC LIMIT ?2",
            OUTBOX_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![to_millis(now), limit as i64], event_from_row)?;
        collect_rows(rows)
    }

    pub fn mark_delivered(&self, event_id: &str, at: DateTime<Utc>) -> EvidenceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox SET status = 'delivered', delivered_at = ?2, last_error = NULL
             WHERE event_id = ?1",
            params![event_id, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn schedule_retry(
        &self,
        event_id: &str,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> EvidenceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox SET attempt_count = ?2, next_attempt_at = ?3, last_error = ?4
             WHERE event_id = ?1 AND status = 'pending'",
            params![event_id, attempt_count, to_millis(next_attempt_at), error],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, event_id: &str, attempt_count: u32, error: &str) -> EvidenceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox SET status = 'failed', attempt_count = ?2, last_error = ?3
             WHERE event_id = ?1",
            params![event_id, attempt_count, error],
        )?;
        Ok(())
    }

    /// Put a failed event back in the queue with a fresh attempt budget.
    pub fn requeue_failed(&self, event_id: &str) -> EvidenceResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE outbox SET status = 'pending', attempt_count = 0, next_attempt_at = ?2
             WHERE event_id = ?1 AND status = 'failed'",
            params![event_id, to_millis(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    pub fn requeue_all_failed(&self) -> EvidenceResult<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE outbox SET status = 'pending', attempt_count = 0, next_attempt_at = ?1
             WHERE status = 'failed'",
            params![to_millis(Utc::now())],
        )?;
        Ok(changed)
    }

    pub fn get_event(&self, event_id: &str) -> EvidenceResult<Option<OutboxEvent>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM outbox WHERE event_id = ?1", OUTBOX_COLUMNS);
        Ok(conn.query_row(&sql, params![event_id], event_from_row).optional()?)
    }

    /// Most recent events first, optionally restricted to one status.
    pub fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: usize,
    ) -> EvidenceResult<Vec<OutboxEvent>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM outbox WHERE (?1 IS NULL OR status = ?1) ORDER BY seq DESC LIMIT ?2",
            OUTBOX_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            event_from_row,
        )?;
        collect_rows(rows)
    }

    /// Events about one evidence id, in creation order.
    pub fn events_for_aggregate(&self, aggregate_id: &str) -> EvidenceResult<Vec<OutboxEvent>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM outbox WHERE aggregate_id = ?1 ORDER BY seq ASC",
            OUTBOX_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![aggregate_id], event_from_row)?;
        collect_rows(rows)
    }

    pub fn outbox_stats(&self) -> EvidenceResult<OutboxStats> {
        let conn = self.lock()?;
        let mut stats = OutboxStats::default();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for (status, count) in collect_rows(rows)? {
            let count = count.max(0) as u64;
            match status.parse::<EventStatus>()? {
                EventStatus::Pending => stats.pending = count,
                EventStatus::Delivered => stats.delivered = count,
                EventStatus::Failed => stats.failed = count,
            }
        }
        let oldest: Option<i64> = conn.query_row(
            "SELECT MIN(created_at) FROM outbox WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        stats.oldest_pending_at = oldest.map(from_millis);
        Ok(stats)
    }

    /// Drop delivered events created before `cutoff`. Pending and failed rows stay.
    pub fn prune_delivered_events(&self, cutoff: DateTime<Utc>) -> EvidenceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM outbox WHERE status = 'delivered' AND created_at < ?1",
            params![to_millis(cutoff)],
        )?)
    }

    // ---- inbox ----

    pub fn inbox_record(&self, event_id: &str) -> EvidenceResult<Option<InboxRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT event_id, event_name, processed_at FROM inbox WHERE event_id = ?1",
                params![event_id],
                |row| {
                    Ok(InboxRecord {
                        event_id: row.get(0)?,
                        event_name: row.get(1)?,
                        processed_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()?)
    }

    pub fn prune_inbox(&self, cutoff: DateTime<Utc>) -> EvidenceResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM inbox WHERE processed_at < ?1",
            params![to_millis(cutoff)],
        )?)
    }

    // ---- purge bookkeeping ----

    /// Soft-deleted rows whose object removal is due.
    pub fn due_purges(&self, now: DateTime<Utc>, limit: usize) -> EvidenceResult<Vec<PurgeTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT evidence_id, storage_path, purge_attempts FROM evidence
             WHERE deleted = 1 AND purged_at IS NULL
               AND (next_purge_at IS NULL OR next_purge_at <= ?1)
             ORDER BY deleted_at ASC, evidence_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_millis(now), limit as i64], |row| {
            let attempts: i64 = row.get(2)?;
            Ok(PurgeTask {
                evidence_id: row.get(0)?,
                storage_path: row.get(1)?,
                purge_attempts: u32::try_from(attempts)
                    .map_err(|err| conversion_error(2, Type::Integer, err))?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn mark_purged(&self, evidence_id: &str, at: DateTime<Utc>) -> EvidenceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE evidence SET purged_at = ?2, next_purge_at = NULL, last_purge_error = NULL
             WHERE evidence_id = ?1 AND deleted = 1",
            params![evidence_id, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn schedule_purge_retry(
        &self,
        evidence_id: &str,
        attempts: u32,
        next_purge_at: DateTime<Utc>,
        error: &str,
    ) -> EvidenceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE evidence SET purge_attempts = ?2, next_purge_at = ?3, last_purge_error = ?4
             WHERE evidence_id = ?1",
            params![evidence_id, attempts, to_millis(next_purge_at), error],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn raw_execute(&self, sql: &str) -> EvidenceResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}
