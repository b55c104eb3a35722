//! Shared fixtures: fake Case/Auth services, a recording publisher and an
//! engine harness over either storage backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;

use evidence_vault::config::StorageKind;
use evidence_vault::guard::{AuthService, CaseService, ServiceError};
use evidence_vault::outbox::{EventPublisher, OutboxEvent, PublishError};
use evidence_vault::storage::build_backend;
use evidence_vault::{ByteStream, Engine, MetadataRepository, Settings};

/// Case and Auth service double. `user:case` pairs listed in `owned` pass.
pub struct Directory {
    owned: Mutex<HashSet<(String, String)>>,
    pub case_reachable: AtomicBool,
    pub case_calls: AtomicUsize,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            owned: Mutex::new(HashSet::new()),
            case_reachable: AtomicBool::new(true),
            case_calls: AtomicUsize::new(0),
        }
    }

    pub fn grant(&self, user_id: &str, case_id: &str) {
        self.owned
            .lock()
            .expect("directory lock")
            .insert((user_id.to_string(), case_id.to_string()));
    }

    pub fn set_case_reachable(&self, reachable: bool) {
        self.case_reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaseService for Directory {
    async fn user_owns_case(&self, user_id: &str, case_id: &str) -> Result<bool, ServiceError> {
        self.case_calls.fetch_add(1, Ordering::SeqCst);
        if !self.case_reachable.load(Ordering::SeqCst) {
            return Err(ServiceError::Transport("connection refused".to_string()));
        }
        Ok(self
            .owned
            .lock()
            .expect("directory lock")
            .contains(&(user_id.to_string(), case_id.to_string())))
    }
}

#[async_trait]
impl AuthService for Directory {
    async fn user_exists(&self, user_id: &str) -> Result<bool, ServiceError> {
        Ok(!user_id.is_empty())
    }
}

/// Acknowledges every event and remembers `(event_name, aggregate_id)`.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, String)>>,
}

impl RecordingPublisher {
    pub fn names_for(&self, aggregate_id: &str) -> Vec<String> {
        self.published
            .lock()
            .expect("publisher lock")
            .iter()
            .filter(|(_, aggregate)| aggregate == aggregate_id)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        self.published
            .lock()
            .expect("publisher lock")
            .push((event.event_name.clone(), event.aggregate_id.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub directory: Arc<Directory>,
    pub publisher: Arc<RecordingPublisher>,
    _root: TempDir,
}

impl Harness {
    pub fn new(kind: StorageKind) -> Self {
        Self::with_settings(kind, |_| {})
    }

    pub fn with_settings(kind: StorageKind, tweak: impl FnOnce(&mut Settings)) -> Self {
        let root = TempDir::new().expect("temp dir");
        let mut settings = Settings::default();
        settings.storage.kind = kind;
        settings.storage.local_root = root.path().join("evidence");
        settings.breaker.failure_threshold = 2;
        settings.breaker.call_timeout_ms = 500;
        tweak(&mut settings);

        let storage = build_backend(&settings.storage).expect("backend");
        let repo = MetadataRepository::in_memory().expect("repo");
        let directory = Arc::new(Directory::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let engine = Engine::assemble(
            settings,
            storage,
            repo,
            directory.clone(),
            directory.clone(),
            publisher.clone(),
        );
        Self {
            engine,
            directory,
            publisher,
            _root: root,
        }
    }

    /// Run dispatch passes until nothing is due; returns events delivered.
    pub async fn drain_outbox(&self) -> usize {
        let mut delivered = 0;
        loop {
            let report = self
                .engine
                .dispatcher()
                .dispatch_once()
                .await
                .expect("dispatch");
            if report.total() == 0 {
                return delivered;
            }
            delivered += report.delivered;
        }
    }
}

/// Deterministic, non-repeating-looking content.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn chunked(data: &[u8], chunk_size: usize) -> ByteStream {
    let chunks: Vec<std::io::Result<Vec<u8>>> =
        data.chunks(chunk_size).map(|chunk| Ok(chunk.to_vec())).collect();
    stream::iter(chunks).boxed()
}
