use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::EvidenceError;

/// Classification of an uploaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Log,
    Screenshot,
    Document,
    Metric,
    Other,
}

impl EvidenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::Log => "log",
            EvidenceType::Screenshot => "screenshot",
            EvidenceType::Document => "document",
            EvidenceType::Metric => "metric",
            EvidenceType::Other => "other",
        }
    }

    /// Infer the type from the declared filename and MIME type.
    pub fn classify(filename: &str, content_type: &str) -> Self {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let content_type = content_type.to_ascii_lowercase();

        if matches!(extension.as_str(), "log" | "txt") || content_type.contains("text") {
            EvidenceType::Log
        } else if matches!(extension.as_str(), "png" | "jpg" | "jpeg" | "gif")
            || content_type.contains("image")
        {
            EvidenceType::Screenshot
        } else if matches!(extension.as_str(), "pdf" | "doc" | "docx") || content_type.contains("pdf")
        {
            EvidenceType::Document
        } else if extension == "json" || content_type.contains("json") {
            EvidenceType::Metric
        } else {
            EvidenceType::Other
        }
    }
}

impl fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvidenceType {
    type Err = EvidenceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "log" => Ok(EvidenceType::Log),
            "screenshot" => Ok(EvidenceType::Screenshot),
            "document" => Ok(EvidenceType::Document),
            "metric" => Ok(EvidenceType::Metric),
            "other" => Ok(EvidenceType::Other),
            other => Err(EvidenceError::InvalidInput(format!(
                "unknown evidence type: {}",
                other
            ))),
        }
    }
}

/// One uploaded artifact and its tracked metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub evidence_id: String,
    /// Owner of the artifact.
    pub user_id: String,
    /// Case the artifact belongs to, if linked.
    pub case_id: Option<String>,
    pub filename: String,
    pub content_type: String,
    /// Byte length committed to the storage backend.
    pub size_bytes: u64,
    pub evidence_type: EvidenceType,
    /// Backend-relative locator.
    pub storage_path: String,
    /// Hex SHA-256 of the committed bytes.
    pub checksum_sha256: String,
    pub description: Option<String>,
    /// Free-form metadata, extended by processing steps.
    pub metadata: Map<String, Value>,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: String,
    /// Soft-delete marker.
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Set once the reaper removed the stored object.
    pub purged_at: Option<DateTime<Utc>>,
}

impl Evidence {
    /// Content-free snapshot used as event payload.
    pub fn snapshot(&self) -> Value {
        json!({
            "evidence_id": self.evidence_id,
            "user_id": self.user_id,
            "case_id": self.case_id,
            "filename": self.filename,
            "content_type": self.content_type,
            "size_bytes": self.size_bytes,
            "evidence_type": self.evidence_type,
            "storage_path": self.storage_path,
            "checksum_sha256": self.checksum_sha256,
            "description": self.description,
            "metadata": self.metadata,
            "uploaded_at": self.uploaded_at,
            "uploaded_by": self.uploaded_by,
            "deleted": self.deleted,
        })
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// Upload input handed over by the (already authenticated) caller.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub user_id: String,
    pub case_id: Option<String>,
    pub filename: String,
    pub content_type: String,
    /// Classified from filename/content type when absent.
    pub evidence_type: Option<EvidenceType>,
    pub description: Option<String>,
    /// Size the caller announced; checked against committed bytes.
    pub declared_size: Option<u64>,
}

impl UploadRequest {
    pub fn new(
        user_id: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            case_id: None,
            filename: filename.into(),
            content_type: content_type.into(),
            evidence_type: None,
            description: None,
            declared_size: None,
        }
    }

    pub fn with_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn with_evidence_type(mut self, evidence_type: EvidenceType) -> Self {
        self.evidence_type = Some(evidence_type);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn resolved_type(&self) -> EvidenceType {
        self.evidence_type
            .unwrap_or_else(|| EvidenceType::classify(&self.filename, &self.content_type))
    }
}

/// Filter for listing a user's evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceFilter {
    pub user_id: Option<String>,
    pub case_id: Option<String>,
    pub evidence_type: Option<EvidenceType>,
}

impl EvidenceFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn with_type(mut self, evidence_type: EvidenceType) -> Self {
        self.evidence_type = Some(evidence_type);
        self
    }
}
