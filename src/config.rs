//! Daemon settings.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables prefixed with `EVIDENCE_` (nested keys separated by `__`, e.g.
//! `EVIDENCE_STORAGE__KIND=s3`). Every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::coordinator::reaper::ReaperConfig;
use crate::coordinator::reconcile::ReconcileConfig;
use crate::coordinator::CoordinatorConfig;
use crate::error::{EvidenceError, EvidenceResult};
use crate::guard::BreakerConfig;
use crate::outbox::DispatcherConfig;
use crate::runtime::RetentionConfig;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "EVIDENCE";

/// Smallest part size accepted by S3 for all but the last part.
pub const MIN_S3_PART_SIZE: usize = 5 * 1024 * 1024;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub upload: UploadSettings,
    pub outbox: OutboxSettings,
    pub inbox: InboxSettings,
    pub reaper: ReaperSettings,
    pub reconcile: ReconcileSettings,
    pub breaker: BreakerSettings,
    pub services: ServicesSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the event ingress listens on.
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file holding evidence, outbox and inbox tables.
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("evidence.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    S3,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub kind: StorageKind,
    /// Root directory for the local backend.
    pub local_root: PathBuf,
    /// Key prefix for object store backends.
    pub object_prefix: String,
    pub s3: S3Settings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::Local,
            local_root: PathBuf::from("data/evidence"),
            object_prefix: "evidence".to_string(),
            s3: S3Settings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub multipart_threshold_bytes: usize,
    pub part_size_bytes: usize,
    pub request_timeout_ms: u64,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9000".to_string(),
            bucket: String::new(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            multipart_threshold_bytes: 8 * 1024 * 1024,
            part_size_bytes: 8 * 1024 * 1024,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub max_file_size_mb: u64,
    /// Confirm the uploader exists with the auth service before writing.
    pub verify_uploader: bool,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_file_size_mb: 50,
            verify_uploader: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Days delivered events are kept (0 keeps them forever).
    pub retention_days: u64,
    /// How often delivered events and inbox records are pruned.
    pub prune_interval_secs: u64,
    /// Webhook receiving outbound events; events are only logged when unset.
    pub webhook_url: Option<String>,
    pub publish_timeout_ms: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 50,
            max_attempts: 10,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            retention_days: 30,
            prune_interval_secs: 3_600,
            webhook_url: None,
            publish_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxSettings {
    /// Days inbox records are kept (0 keeps them forever).
    pub retention_days: u64,
    pub channel_capacity: usize,
}

impl Default for InboxSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_ms: u64,
    pub batch_size: usize,
    /// Failed purge attempts before an operational alert is logged.
    pub alert_after_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            batch_size: 50,
            alert_after_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub interval_secs: u64,
    /// Objects younger than this are never treated as orphans.
    pub grace_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            grace_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            call_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesSettings {
    pub case_url: String,
    pub auth_url: String,
}

impl Default for ServicesSettings {
    fn default() -> Self {
        Self {
            case_url: "http://127.0.0.1:8001".to_string(),
            auth_url: "http://127.0.0.1:8002".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (if given) and the environment, then validate.
    pub fn load(path: Option<&Path>) -> EvidenceResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| EvidenceError::Config(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> EvidenceResult<()> {
        if self.upload.max_file_size_mb == 0 {
            return Err(EvidenceError::Config(
                "upload.max_file_size_mb must be greater than 0".to_string(),
            ));
        }
        if self.storage.kind == StorageKind::S3 {
            if self.storage.s3.bucket.trim().is_empty() {
                return Err(EvidenceError::Config(
                    "storage.s3.bucket is required when storage.kind = \"s3\"".to_string(),
                ));
            }
            if self.storage.s3.part_size_bytes < MIN_S3_PART_SIZE {
                return Err(EvidenceError::Config(format!(
                    "storage.s3.part_size_bytes must be at least {}",
                    MIN_S3_PART_SIZE
                )));
            }
        }
        if self.outbox.batch_size == 0 || self.reaper.batch_size == 0 {
            return Err(EvidenceError::Config("batch sizes must be greater than 0".to_string()));
        }
        if self.outbox.max_attempts == 0 {
            return Err(EvidenceError::Config(
                "outbox.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(EvidenceError::Config(
                "breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.inbox.channel_capacity == 0 {
            return Err(EvidenceError::Config(
                "inbox.channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.upload.max_file_size_mb.saturating_mul(MIB)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_max_upload_bytes(self.max_upload_bytes())
            .with_verify_uploader(self.upload.verify_uploader)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_poll_interval(Duration::from_millis(self.outbox.poll_interval_ms))
            .with_batch_size(self.outbox.batch_size)
            .with_max_attempts(self.outbox.max_attempts)
            .with_backoff(
                Duration::from_millis(self.outbox.base_backoff_ms),
                Duration::from_millis(self.outbox.max_backoff_ms),
            )
            .with_publish_timeout(Duration::from_millis(self.outbox.publish_timeout_ms))
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig::default()
            .with_interval(Duration::from_millis(self.reaper.interval_ms))
            .with_batch_size(self.reaper.batch_size)
            .with_alert_after_attempts(self.reaper.alert_after_attempts)
            .with_backoff(
                Duration::from_millis(self.reaper.base_backoff_ms),
                Duration::from_millis(self.reaper.max_backoff_ms),
            )
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig::default()
            .with_interval(Duration::from_secs(self.reconcile.interval_secs))
            .with_grace_period(Duration::from_secs(self.reconcile.grace_secs))
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(self.breaker.failure_threshold)
            .with_cooldown(Duration::from_millis(self.breaker.cooldown_ms))
            .with_call_timeout(Duration::from_millis(self.breaker.call_timeout_ms))
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            interval: Duration::from_secs(self.outbox.prune_interval_secs.max(1)),
            outbox_retention_days: self.outbox.retention_days,
            inbox_retention_days: self.inbox.retention_days,
        }
    }
}
