//! # Ingest Pipeline Main Entry Point
//!
//! Starts the pipeline workers and the sweeper, or runs database
//! migrations, depending on the subcommand.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use ingest::config::ConfigLoader;
use ingest::platforms::Registry;
use ingest::queue::{DatabaseQueue, QueueClient};
use ingest::sink::TracingSink;
use ingest::sweeper::Sweeper;
use ingest::workers::{DataWorker, ReceiverLoop, RunWorker, StreamWorker};
use ingest::{db, logging};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ingest")]
#[command(about = "Integration ingestion pipeline service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Start queue workers
    Worker {
        #[arg(value_enum, default_value_t = WorkerKind::All)]
        kind: WorkerKind,
    },
    /// Start only the delay/finalize sweeper
    Sweeper,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WorkerKind {
    Run,
    Stream,
    Data,
    All,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load()?;
    logging::init_subscriber(&config);

    let db = db::init_pool(&config).await?;

    if let Some(Commands::Migrate { action }) = &cli.command {
        handle_migrate_command(&db, action).await?;
        return Ok(());
    }

    // Run migrations automatically for local and test profiles
    if config.profile == "local" || config.profile == "test" {
        info!(profile = %config.profile, "running migrations automatically");
        Migrator::up(&db, None).await?;
    }

    Registry::initialize();
    info!("platform registry initialized");

    if let Ok(redacted_json) = config.redacted_json() {
        info!(configuration = %redacted_json, profile = %config.profile, "configuration loaded");
    }

    let db = Arc::new(db);
    let queue: Arc<dyn QueueClient> = Arc::new(DatabaseQueue::new(
        db.clone(),
        Duration::from_secs(config.worker.visibility_timeout_seconds),
    ));
    let registry = Arc::new(Registry::global().read().unwrap().clone());

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    let worker_kind = match &cli.command {
        Some(Commands::Worker { kind }) => Some(*kind),
        Some(Commands::Sweeper) => None,
        None => Some(WorkerKind::All),
        Some(Commands::Migrate { .. }) => unreachable!("handled above"),
    };

    if let Some(kind) = worker_kind {
        if matches!(kind, WorkerKind::Run | WorkerKind::All) {
            handles.push(spawn_receiver(
                ReceiverLoop::new(
                    queue.clone(),
                    Arc::new(RunWorker::new(db.clone(), queue.clone(), registry.clone())),
                    config.worker.max_concurrent_message_processing,
                    Duration::from_millis(config.worker.receive_idle_sleep_ms),
                ),
                shutdown.clone(),
            ));
        }

        if matches!(kind, WorkerKind::Stream | WorkerKind::All) {
            handles.push(spawn_receiver(
                ReceiverLoop::new(
                    queue.clone(),
                    Arc::new(StreamWorker::new(
                        db.clone(),
                        queue.clone(),
                        registry.clone(),
                        config.worker.max_stream_retries,
                    )),
                    config.worker.max_concurrent_message_processing,
                    Duration::from_millis(config.worker.receive_idle_sleep_ms),
                ),
                shutdown.clone(),
            ));
        }

        if matches!(kind, WorkerKind::Data | WorkerKind::All) {
            handles.push(spawn_receiver(
                ReceiverLoop::new(
                    queue.clone(),
                    Arc::new(DataWorker::new(
                        db.clone(),
                        queue.clone(),
                        registry.clone(),
                        Arc::new(TracingSink),
                        config.worker.max_data_retries,
                    )),
                    config.worker.max_concurrent_message_processing,
                    Duration::from_millis(config.worker.receive_idle_sleep_ms),
                ),
                shutdown.clone(),
            ));
        }
    }

    let run_sweeper = matches!(&cli.command, None | Some(Commands::Sweeper));
    if run_sweeper {
        let sweeper = Sweeper::new(db.clone(), queue.clone(), config.sweeper.clone());
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = sweeper.run(token).await {
                error!(error = ?err, "sweeper exited with error");
            }
        }));
    }

    wait_for_shutdown(shutdown).await;

    for handle in handles {
        let _ = handle.await;
    }

    info!("ingest pipeline stopped");
    Ok(())
}

fn spawn_receiver(
    receiver: ReceiverLoop,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = receiver.run(shutdown).await {
            error!(error = ?err, "receiver loop exited with error");
        }
    })
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
    }
    shutdown.cancel();
}

async fn handle_migrate_command(
    db: &DatabaseConnection,
    action: &MigrateAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        MigrateAction::Up => {
            Migrator::up(db, None).await?;
            info!("migrations applied");
        }
        MigrateAction::Down => {
            Migrator::down(db, Some(1)).await?;
            info!("last migration rolled back");
        }
        MigrateAction::Status => {
            Migrator::status(db).await?;
        }
    }
    Ok(())
}
