//! Evidence storage and consistency engine.
//!
//! Stores uploaded artifacts in a pluggable blob backend, keeps their
//! metadata in SQLite, and announces every change through a transactional
//! outbox. Inbound deletions from other services are applied exactly once
//! through an inbox table, and calls to the Case and Auth services go through
//! per-dependency circuit breakers that fail closed.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod evidence;
pub mod guard;
pub mod inbox;
pub mod metadata;
pub mod outbox;
pub mod runtime;
pub mod server;
pub mod storage;

pub use config::Settings;
pub use coordinator::{CoordinatorConfig, WriteCoordinator};
pub use error::{EvidenceError, EvidenceResult};
pub use evidence::{Evidence, EvidenceFilter, EvidenceType, UploadRequest};
pub use metadata::MetadataRepository;
pub use runtime::{Engine, RunningEngine};
pub use storage::{ByteStream, StorageBackend};
