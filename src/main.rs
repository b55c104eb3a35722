use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use evidence_vault::server::{self, AppState};
use evidence_vault::{Engine, EvidenceResult, Settings};

#[derive(Parser, Debug)]
#[command(name = "evidence-vault")]
#[command(about = "Evidence storage and consistency engine", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML settings file; EVIDENCE_* environment variables override it
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the background loops and the event ingress (default)
    Serve {
        /// Override server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Load and validate settings, then print them
    CheckConfig,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evidence_vault=info,tower_http=info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn serve(settings: Settings, bind: Option<String>) -> EvidenceResult<()> {
    let bind = bind.unwrap_or_else(|| settings.server.bind.clone());
    let engine = Engine::from_settings(settings)?;
    let running = engine.start();
    let state = AppState {
        coordinator: Arc::clone(engine.coordinator()),
        deliveries: running.inbox_sender(),
    };

    let served = server::serve(&bind, state, shutdown_signal()).await;
    running.shutdown().await;
    served
}

fn redacted(mut settings: Settings) -> Settings {
    if !settings.storage.s3.secret_key.is_empty() {
        settings.storage.s3.secret_key = "<redacted>".to_string();
    }
    settings
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("evidence-vault: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => serve(settings, bind).await,
        Commands::CheckConfig => match serde_json::to_string_pretty(&redacted(settings)) {
            Ok(rendered) => {
                println!("{}", rendered);
                Ok(())
            }
            Err(err) => Err(err.into()),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, kind = err.kind_label(), "evidence-vault exited with error");
            eprintln!("evidence-vault: {}", err);
            ExitCode::FAILURE
        }
    }
}
