//! Tag Worker
//!
//! Runs the background side of tag assignment against Postgres:
//! 1. Applies migrations
//! 2. Watches the tap log for exit taps and releases those tags
//! 3. Periodically rebuilds missing cards from `REGISTER` sightings
//!
//! Usage:
//!   DATABASE_URL=postgresql://localhost:5432/rfid \
//!     cargo run --features database --bin tag-worker
//!
//! Tuning comes from `TAG_LOCK_TIMEOUT_MS`, `TAG_RECONCILE_INTERVAL_SECS`,
//! `TAG_EXIT_POLL_MS` and `TAG_EXIT_WINDOW_SECS`; a `.env` file is honoured.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rfid_assign::config::load_dotenv;
use rfid_assign::store::postgres;
use rfid_assign::{
    AssignmentEngine, DatabaseConfig, EngineConfig, ExitWatcher, PgEventLog, PgTagStore,
    ReconcileWorker, Reconciler,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("rfid_assign=info".parse()?),
        )
        .init();

    let db_config = DatabaseConfig::from_env();
    let engine_config = EngineConfig::from_env();
    info!(?engine_config, "Starting tag worker");

    let pool = postgres::connect(&db_config)
        .await
        .context("Failed to connect to database")?;
    postgres::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = Arc::new(PgTagStore::new(pool.clone(), engine_config.lock_timeout));
    let log = Arc::new(PgEventLog::new(pool.clone()));
    let engine = AssignmentEngine::new(store.clone(), log.clone());

    let watcher = ExitWatcher::new(engine, &engine_config);
    let reconciler = ReconcileWorker::new(Reconciler::new(store, log), &engine_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher_rx = shutdown_rx.clone();
    let watcher_task = tokio::spawn(async move { watcher.run(watcher_rx).await });
    let reconcile_task = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    shutdown_tx.send(true).ok();

    watcher_task.await.context("Exit watcher panicked")?;
    reconcile_task.await.context("Reconcile worker panicked")?;

    pool.close().await;
    info!("Tag worker stopped");
    Ok(())
}
