mod config;
mod db;
mod host;
mod models;
mod services;
mod state;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::services::event_dispatcher::start_event_dispatcher;
use crate::services::event_logger::start_event_logger;
use crate::services::operator;
use crate::services::purge_scheduler::PurgeScheduler;
use crate::state::AppState;
use clap::{Parser, Subcommand};
use offload_engine::{Clock, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "offload-server", version, about = "Remote backup offload and purge queue host")]
struct Cli {
    /// Engine configuration file (overrides CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the purge scheduler and event dispatcher until interrupted (default)
    Serve,
    /// Inspect or change the remote purge queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Upload an archive to one or more destinations
    Upload {
        #[arg(required = true)]
        path: PathBuf,
        /// Destination ids; all connected destinations when omitted
        #[arg(short, long)]
        destination: Vec<String>,
    },
    /// Apply a retention policy to a destination folder
    Prune {
        destination: String,
        #[arg(long, default_value_t = 5)]
        keep: usize,
        #[arg(long, default_value_t = 0)]
        days: u32,
    },
    /// Show storage usage per destination
    Usage {
        destination: Option<String>,
        #[arg(long)]
        refresh: bool,
    },
    /// List configured destinations
    Destinations,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show entries with their SLA forecast
    List,
    /// Register an archive for removal from destinations
    Add {
        file: String,
        #[arg(required = true)]
        destinations: Vec<String>,
    },
    /// Run one purge pass now
    Run,
    /// Reset an entry so the next pass retries it
    Retry { file: String },
    /// Drop an entry without touching the remotes
    Discard { file: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(path) = cli.config {
        config.config_path = path;
    }

    let engine = if config.config_path.exists() {
        Config::from_file(&config.config_path)?
    } else {
        Config::default()
    };

    let level = config.log_level.clone().unwrap_or_else(|| engine.log.level.clone());
    offload_engine::utils::logger::init(&level)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    // Initialize database
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    let state = Arc::new(AppState::new(pool, config, engine)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state).await,
        Command::Queue { action } => queue(&state, action).await,
        Command::Upload { path, destination } => {
            let ids = if destination.is_empty() {
                state.registry.connected_ids()
            } else {
                destination
            };
            if ids.is_empty() {
                anyhow::bail!("No connected destinations configured");
            }
            operator::upload(&state, &ids, &path).await
        }
        Command::Prune { destination, keep, days } => {
            let report = operator::prune(&state, &destination, keep, days).await?;
            println!(
                "{destination}: inspected {}, deleted {}",
                report.inspected, report.deleted
            );
            for item in &report.deleted_items {
                println!("  - {item}");
            }
            for error in &report.errors {
                println!("  ! {error}");
            }
            Ok(())
        }
        Command::Usage { destination, refresh } => {
            let ids = match destination {
                Some(id) => vec![id],
                None => state.registry.connected_ids(),
            };
            for id in ids {
                match operator::usage(&state, &id, refresh).await {
                    Ok(usage) => println!("{}", operator::describe_usage(&id, &usage)),
                    Err(e) => println!("{id}: {e}"),
                }
            }
            Ok(())
        }
        Command::Destinations => {
            for id in state.registry.ids() {
                let destination = state.registry.resolve(&id)?;
                let status = if destination.is_connected() { "connected" } else { "not configured" };
                println!("{id:<20} {:<28} {status}", destination.name());
            }
            Ok(())
        }
    }
}

async fn queue(state: &AppState, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::List => {
            let now = state.clock.now();
            let entries = state.worker.queue().await?;
            if entries.is_empty() {
                println!("Purge queue is empty");
            }
            for entry in &entries {
                println!("{}", operator::describe_entry(entry, now));
            }
            let sla = state.worker.sla().await;
            if let Some(label) = sla.forecast.forecast_label {
                println!("Forecast: {label}");
            }
        }
        QueueAction::Add { file, destinations } => {
            let created = state.worker.register(&file, &destinations).await?;
            println!("{} {file}", if created { "Queued" } else { "Updated" });
        }
        QueueAction::Run => {
            let report = state.worker.run_pass().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        QueueAction::Retry { file } => {
            if !state.worker.retry(&file).await? {
                anyhow::bail!("No queue entry for {file}");
            }
            println!("{file} will be retried on the next pass");
        }
        QueueAction::Discard { file } => {
            if !state.worker.delete(&file).await? {
                anyhow::bail!("No queue entry for {file}");
            }
            println!("Discarded {file}");
        }
    }
    Ok(())
}

async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    tracing::info!(
        destinations = state.registry.ids().len(),
        db = %state.config.db_path.display(),
        "Starting offload server"
    );

    let cancel = CancellationToken::new();
    start_event_logger(&state.events, cancel.clone());
    start_event_dispatcher(state.clone(), cancel.clone());

    // Initialize cron scheduler
    let scheduler = match PurgeScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedule().await {
                tracing::warn!("Failed to initialize purge schedule: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    shutdown_signal(cancel.clone()).await;

    // Cleanup
    tracing::info!("Shutting down...");

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
