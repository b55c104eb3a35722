use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;

use evidence_vault::coordinator::ReconciliationSweep;
use evidence_vault::outbox::{EventStatus, OutboxEvent};
use evidence_vault::storage::build_backend;
use evidence_vault::{MetadataRepository, Settings};

#[derive(Parser, Debug)]
#[command(name = "evidence-vault-admin")]
#[command(about = "Operator tooling for evidence-vault", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (defaults to <config dir>/evidence-vault/config.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and requeue outbox events
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },
    /// Inspect processed inbound events
    Inbox {
        #[command(subcommand)]
        action: InboxAction,
    },
    /// Compare stored objects with metadata and remove orphans
    Reconcile {
        /// Report without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
enum OutboxAction {
    /// Counts per status
    Status,
    /// Most recent events
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one event with its last error
    Show { event_id: String },
    /// Move failed events back to pending
    Retry {
        /// Event to requeue
        event_id: Option<String>,
        /// Requeue every failed event
        #[arg(long, conflicts_with = "event_id")]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
enum InboxAction {
    /// Show whether an inbound event was processed
    Show { event_id: String },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum StatusArg {
    Pending,
    Delivered,
    Failed,
}

impl From<StatusArg> for EventStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => EventStatus::Pending,
            StatusArg::Delivered => EventStatus::Delivered,
            StatusArg::Failed => EventStatus::Failed,
        }
    }
}

fn default_config() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("evidence-vault").join("config.toml"))
        .filter(|path| path.exists())
}

fn load_settings(explicit: Option<PathBuf>) -> Result<Settings> {
    let path = explicit.or_else(default_config);
    Settings::load(path.as_deref()).context("failed to load settings")
}

fn open_repository(settings: &Settings) -> Result<MetadataRepository> {
    MetadataRepository::open(&settings.database.path).with_context(|| {
        format!(
            "failed to open metadata store {}",
            settings.database.path.display()
        )
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn colored_status(status: EventStatus) -> colored::ColoredString {
    match status {
        EventStatus::Pending => status.as_str().yellow(),
        EventStatus::Delivered => status.as_str().green(),
        EventStatus::Failed => status.as_str().red().bold(),
    }
}

fn print_event_row(event: &OutboxEvent) {
    println!(
        "{:>6}  {:<10}  {:<24}  {:<36}  attempts={}  next={}",
        event.seq,
        colored_status(event.status),
        event.event_name,
        event.aggregate_id,
        event.attempt_count,
        format_time(Some(event.next_attempt_at)),
    );
}

fn outbox(settings: &Settings, action: OutboxAction, json: bool) -> Result<()> {
    let repo = open_repository(settings)?;
    match action {
        OutboxAction::Status => {
            let stats = repo.outbox_stats()?;
            if json {
                return print_json(&stats);
            }
            println!("{}", "Outbox".bold());
            println!("  pending:   {}", stats.pending.to_string().yellow());
            println!("  delivered: {}", stats.delivered.to_string().green());
            println!("  failed:    {}", stats.failed.to_string().red());
            println!("  oldest pending: {}", format_time(stats.oldest_pending_at));
        }
        OutboxAction::List { status, limit } => {
            let events = repo.list_events(status.map(EventStatus::from), limit)?;
            if json {
                return print_json(&events);
            }
            if events.is_empty() {
                println!("{}", "No events".dimmed());
            }
            for event in &events {
                print_event_row(event);
            }
        }
        OutboxAction::Show { event_id } => {
            let Some(event) = repo.get_event(&event_id)? else {
                bail!("event {} not found", event_id);
            };
            if json {
                return print_json(&event);
            }
            print_event_row(&event);
            if let Some(error) = &event.last_error {
                println!("  last error: {}", error.red());
            }
            println!("  payload: {}", serde_json::to_string_pretty(&event.payload)?);
        }
        OutboxAction::Retry { event_id, all } => {
            let requeued = match (event_id, all) {
                (_, true) => repo.requeue_all_failed()?,
                (Some(event_id), false) => {
                    if !repo.requeue_failed(&event_id)? {
                        bail!("event {} is not in failed state", event_id);
                    }
                    1
                }
                (None, false) => bail!("pass an event id or --all"),
            };
            if json {
                return print_json(&serde_json::json!({ "requeued": requeued }));
            }
            println!("{} {} event(s) requeued", "✓".green(), requeued);
        }
    }
    Ok(())
}

fn inbox(settings: &Settings, action: InboxAction, json: bool) -> Result<()> {
    let repo = open_repository(settings)?;
    match action {
        InboxAction::Show { event_id } => {
            let record = repo.inbox_record(&event_id)?;
            if json {
                return print_json(&record);
            }
            match record {
                Some(record) => println!(
                    "{} {} ({}) processed at {}",
                    "✓".green(),
                    record.event_id,
                    record.event_name,
                    format_time(Some(record.processed_at))
                ),
                None => println!("{} {} not processed", "✗".yellow(), event_id),
            }
        }
    }
    Ok(())
}

async fn reconcile(settings: &Settings, dry_run: bool, json: bool) -> Result<()> {
    let repo = open_repository(settings)?;
    let storage = build_backend(&settings.storage).context("failed to open storage backend")?;
    let sweep = ReconciliationSweep::new(Arc::clone(&storage), repo, settings.reconcile_config());
    let report = sweep.sweep(dry_run).await?;
    if json {
        return print_json(&report);
    }

    let mode = if dry_run { " (dry run)" } else { "" };
    println!("{}{}", "Reconciliation".bold(), mode);
    println!("  scanned objects: {}", report.scanned_objects);
    println!(
        "  orphans: {} found, {} removed",
        report.orphans_found.len(),
        report.orphans_removed
    );
    for locator in &report.orphans_found {
        println!("    {}", locator.dimmed());
    }
    println!("  staging files removed: {}", report.staging_removed);
    if report.dangling_records.is_empty() {
        println!("  {} no dangling records", "✓".green());
    } else {
        println!(
            "  {} {} live record(s) without stored object:",
            "✗".red(),
            report.dangling_records.len()
        );
        for evidence_id in &report.dangling_records {
            println!("    {}", evidence_id.red());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config)?;

    match cli.command {
        Commands::Outbox { action } => outbox(&settings, action, cli.json),
        Commands::Inbox { action } => inbox(&settings, action, cli.json),
        Commands::Reconcile { dry_run } => reconcile(&settings, dry_run, cli.json).await,
    }
}
