use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::EvidenceResult;
use crate::evidence::Evidence;
use crate::inbox::InboxRecord;
use crate::metadata::{collect_rows, evidence_from_row, map_constraint, to_millis, EVIDENCE_COLUMNS};
use crate::outbox::NewOutboxEvent;

/// Operations available inside [`super::MetadataRepository::transaction`].
///
/// Nothing done through a unit of work is visible to other connections until
/// the surrounding transaction commits.
pub struct UnitOfWork<'a> {
    conn: &'a Connection,
}

impl<'a> UnitOfWork<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert_evidence(&self, evidence: &Evidence) -> EvidenceResult<()> {
        self.conn
            .execute(
                "INSERT INTO evidence (evidence_id, user_id, case_id, filename, content_type,
                    size_bytes, evidence_type, storage_path, checksum_sha256, description, metadata,
                    uploaded_at, uploaded_by, deleted, deleted_at, purged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    evidence.evidence_id,
                    evidence.user_id,
                    evidence.case_id,
                    evidence.filename,
                    evidence.content_type,
                    evidence.size_bytes as i64,
                    evidence.evidence_type.as_str(),
                    evidence.storage_path,
                    evidence.checksum_sha256,
                    evidence.description,
                    serde_json::to_string(&evidence.metadata)?,
                    to_millis(evidence.uploaded_at),
                    evidence.uploaded_by,
                    evidence.deleted,
                    evidence.deleted_at.map(to_millis),
                    evidence.purged_at.map(to_millis),
                ],
            )
            .map_err(|err| map_constraint(err, "evidence already exists"))?;
        Ok(())
    }

    /// Read a row while holding the write lock of this transaction.
    pub fn evidence_for_update(&self, evidence_id: &str) -> EvidenceResult<Option<Evidence>> {
        let sql = format!("SELECT {} FROM evidence WHERE evidence_id = ?1", EVIDENCE_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![evidence_id], evidence_from_row)
            .optional()?)
    }

    pub fn set_case(&self, evidence_id: &str, case_id: &str) -> EvidenceResult<bool> {
        let changed = self.conn.execute(
            "UPDATE evidence SET case_id = ?2 WHERE evidence_id = ?1 AND deleted = 0",
            params![evidence_id, case_id],
        )?;
        Ok(changed == 1)
    }

    pub fn set_metadata(&self, evidence_id: &str, metadata: &Map<String, Value>) -> EvidenceResult<bool> {
        let changed = self.conn.execute(
            "UPDATE evidence SET metadata = ?2 WHERE evidence_id = ?1 AND deleted = 0",
            params![evidence_id, serde_json::to_string(metadata)?],
        )?;
        Ok(changed == 1)
    }

    /// Mark a live row deleted and make it due for purging. Returns false if
    /// the row was already deleted or does not exist.
    pub fn soft_delete(&self, evidence_id: &str, at: DateTime<Utc>) -> EvidenceResult<bool> {
        let changed = self.conn.execute(
            "UPDATE evidence SET deleted = 1, deleted_at = ?2, next_purge_at = ?2
             WHERE evidence_id = ?1 AND deleted = 0",
            params![evidence_id, to_millis(at)],
        )?;
        Ok(changed == 1)
    }

    pub fn live_evidence_for_case(&self, case_id: &str) -> EvidenceResult<Vec<Evidence>> {
        self.live_evidence_where("case_id", case_id)
    }

    pub fn live_evidence_for_user(&self, user_id: &str) -> EvidenceResult<Vec<Evidence>> {
        self.live_evidence_where("user_id", user_id)
    }

    fn live_evidence_where(&self, column: &str, value: &str) -> EvidenceResult<Vec<Evidence>> {
        let sql = format!(
            "SELECT {} FROM evidence WHERE {} = ?1 AND deleted = 0 ORDER BY uploaded_at ASC, evidence_id ASC",
            EVIDENCE_COLUMNS, column
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], evidence_from_row)?;
        collect_rows(rows)
    }

    pub fn enqueue(&self, event: &NewOutboxEvent) -> EvidenceResult<()> {
        let created_at = to_millis(event.created_at);
        self.conn
            .execute(
                "INSERT INTO outbox (event_id, event_name, aggregate_id, payload, created_at,
                    status, attempt_count, next_attempt_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?5)",
                params![
                    event.event_id,
                    event.event_name,
                    event.aggregate_id,
                    serde_json::to_string(&event.payload)?,
                    created_at,
                ],
            )
            .map_err(|err| map_constraint(err, "outbox event already exists"))?;
        Ok(())
    }

    pub fn inbox_contains(&self, event_id: &str) -> EvidenceResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM inbox WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_inbox(&self, record: &InboxRecord) -> EvidenceResult<()> {
        self.conn
            .execute(
                "INSERT INTO inbox (event_id, event_name, processed_at) VALUES (?1, ?2, ?3)",
                params![record.event_id, record.event_name, to_millis(record.processed_at)],
            )
            .map_err(|err| map_constraint(err, "inbox record already exists"))?;
        Ok(())
    }
}
