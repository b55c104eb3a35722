//! Wiring of the engine components and their background loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Settings;
use crate::coordinator::{PurgeReaper, ReconciliationSweep, WriteCoordinator};
use crate::error::EvidenceResult;
use crate::guard::{
    AuthService, CaseService, DependencyGuard, GuardBreakers, HttpAuthClient, HttpCaseClient,
};
use crate::inbox::{InboxConsumer, InboxDelivery};
use crate::metadata::MetadataRepository;
use crate::outbox::{EventPublisher, LogPublisher, OutboxDispatcher, WebhookPublisher};
use crate::storage::{build_backend, StorageBackend};

/// Sleep for `duration` unless shutdown is requested first.
/// Returns true when the caller should stop.
pub(crate) async fn sleep_or_shutdown(
    shutdown: &mut watch::Receiver<bool>,
    duration: Duration,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Pruning of delivered outbox events and old inbox records.
/// A retention of zero days keeps rows forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    pub interval: Duration,
    pub outbox_retention_days: u64,
    pub inbox_retention_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            outbox_retention_days: 30,
            inbox_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub events_pruned: usize,
    pub inbox_pruned: usize,
}

fn days_ago(days: u64) -> chrono::DateTime<Utc> {
    let days = i64::try_from(days).unwrap_or(i64::MAX).min(36_500);
    Utc::now() - chrono::Duration::days(days)
}

/// Delete delivered events and inbox records past their retention.
pub fn prune_once(
    repo: &MetadataRepository,
    config: &RetentionConfig,
) -> EvidenceResult<RetentionReport> {
    let mut report = RetentionReport::default();
    if config.outbox_retention_days > 0 {
        report.events_pruned =
            repo.prune_delivered_events(days_ago(config.outbox_retention_days))?;
    }
    if config.inbox_retention_days > 0 {
        report.inbox_pruned = repo.prune_inbox(days_ago(config.inbox_retention_days))?;
    }
    Ok(report)
}

async fn run_retention(
    repo: MetadataRepository,
    config: RetentionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if sleep_or_shutdown(&mut shutdown, config.interval).await {
            break;
        }
        match prune_once(&repo, &config) {
            Ok(report) if report.events_pruned + report.inbox_pruned > 0 => info!(
                events_pruned = report.events_pruned,
                inbox_pruned = report.inbox_pruned,
                "retention pass finished"
            ),
            Ok(_) => {}
            Err(err) => error!(error = %err, "retention pass failed"),
        }
    }
}

/// All engine components, built once at startup.
pub struct Engine {
    settings: Settings,
    repo: MetadataRepository,
    storage: Arc<dyn StorageBackend>,
    guard: Arc<DependencyGuard>,
    coordinator: Arc<WriteCoordinator>,
    dispatcher: Arc<OutboxDispatcher>,
    reaper: Arc<PurgeReaper>,
    reconciler: Arc<ReconciliationSweep>,
    inbox: Arc<InboxConsumer>,
}

impl Engine {
    /// Build the engine from settings: storage backend, SQLite file, HTTP
    /// clients for the Case and Auth services, and the event publisher.
    pub fn from_settings(settings: Settings) -> EvidenceResult<Self> {
        settings.validate()?;
        let storage = build_backend(&settings.storage)?;
        let repo = MetadataRepository::open(&settings.database.path)?;
        let call_timeout = Duration::from_millis(settings.breaker.call_timeout_ms);
        let cases: Arc<dyn CaseService> =
            Arc::new(HttpCaseClient::new(&settings.services.case_url, call_timeout)?);
        let auth: Arc<dyn AuthService> =
            Arc::new(HttpAuthClient::new(&settings.services.auth_url, call_timeout)?);
        let publisher: Arc<dyn EventPublisher> = match settings.outbox.webhook_url.as_deref() {
            Some(url) => Arc::new(WebhookPublisher::new(
                url,
                Duration::from_millis(settings.outbox.publish_timeout_ms),
            )?),
            None => Arc::new(LogPublisher),
        };

        info!(
            storage = storage.kind(),
            database = %settings.database.path.display(),
            webhook = settings.outbox.webhook_url.is_some(),
            "engine configured"
        );
        Ok(Self::assemble(settings, storage, repo, cases, auth, publisher))
    }

    /// Build the engine around already constructed collaborators.
    pub fn assemble(
        settings: Settings,
        storage: Arc<dyn StorageBackend>,
        repo: MetadataRepository,
        cases: Arc<dyn CaseService>,
        auth: Arc<dyn AuthService>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let breaker_config = settings.breaker_config();
        let guard = Arc::new(DependencyGuard::new(
            cases,
            auth,
            GuardBreakers::new(&breaker_config),
            breaker_config.call_timeout,
        ));
        let coordinator = Arc::new(WriteCoordinator::new(
            Arc::clone(&storage),
            repo.clone(),
            Arc::clone(&guard),
            settings.coordinator_config(),
        ));
        let dispatcher = Arc::new(OutboxDispatcher::new(
            repo.clone(),
            publisher,
            settings.dispatcher_config(),
        ));
        let reaper = Arc::new(PurgeReaper::new(
            Arc::clone(&storage),
            repo.clone(),
            settings.reaper_config(),
            coordinator.purge_signal(),
        ));
        let reconciler = Arc::new(ReconciliationSweep::new(
            Arc::clone(&storage),
            repo.clone(),
            settings.reconcile_config(),
        ));
        let inbox = Arc::new(
            InboxConsumer::new(repo.clone()).with_purge_signal(coordinator.purge_signal()),
        );

        Self {
            settings,
            repo,
            storage,
            guard,
            coordinator,
            dispatcher,
            reaper,
            reconciler,
            inbox,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn repository(&self) -> &MetadataRepository {
        &self.repo
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn guard(&self) -> &Arc<DependencyGuard> {
        &self.guard
    }

    pub fn coordinator(&self) -> &Arc<WriteCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<OutboxDispatcher> {
        &self.dispatcher
    }

    pub fn reaper(&self) -> &Arc<PurgeReaper> {
        &self.reaper
    }

    pub fn reconciler(&self) -> &Arc<ReconciliationSweep> {
        &self.reconciler
    }

    pub fn inbox(&self) -> &Arc<InboxConsumer> {
        &self.inbox
    }

    /// Spawn the dispatcher, reaper, reconciliation, retention and inbox loops.
    pub fn start(&self) -> RunningEngine {
        let (stop, shutdown) = watch::channel(false);
        let (deliveries, receiver) = mpsc::channel(self.settings.inbox.channel_capacity.max(1));
        let mut tasks = Vec::new();

        let dispatcher = Arc::clone(&self.dispatcher);
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(async move { dispatcher.run(rx).await }));

        let reaper = Arc::clone(&self.reaper);
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(async move { reaper.run(rx).await }));

        let reconciler = Arc::clone(&self.reconciler);
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(async move { reconciler.run(rx).await }));

        let repo = self.repo.clone();
        let retention = self.settings.retention_config();
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(run_retention(repo, retention, rx)));

        let inbox = Arc::clone(&self.inbox);
        tasks.push(tokio::spawn(async move { inbox.run(receiver, shutdown).await }));

        info!(tasks = tasks.len(), "background loops started");
        RunningEngine {
            stop,
            deliveries,
            tasks,
        }
    }
}

/// Handle to the spawned background loops.
pub struct RunningEngine {
    stop: watch::Sender<bool>,
    deliveries: mpsc::Sender<InboxDelivery>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningEngine {
    /// Sender for inbound events; the inbox loop acks each delivery.
    pub fn inbox_sender(&self) -> mpsc::Sender<InboxDelivery> {
        self.deliveries.clone()
    }

    /// Signal every loop to stop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        drop(self.deliveries);
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "background task ended abnormally");
            }
        }
        info!("background loops stopped");
    }
}
