//! Process entry point: reads target-database bootstrap configuration from
//! the environment, builds a [`rowsync::runtime::Runtime`], and runs the
//! scheduler until SIGINT/SIGTERM.
//!
//! Everything downstream of connecting to the target (chunk size, sync
//! interval, debug level) comes from `metadata.config`, not from here —
//! see `rowsync::catalog::ConfigStore`... err, [`rowsync::catalog::CatalogStore::load_config`].

use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use rowsync::catalog::{CatalogStore, DebugLevel};
use rowsync::runtime::Runtime;
use rowsync::scheduler;
use rowsync::target::TargetWriter;

/// Bootstrap configuration for the target warehouse connection and process
/// log level. Everything else lives in `metadata.config`.
#[derive(Parser, Debug)]
#[command(name = "rowsyncd", about = "Continuous heterogeneous database replication engine")]
struct Args {
    /// PostgreSQL connection string for the target warehouse (also holds
    /// `metadata.catalog` / `metadata.config`).
    #[arg(long, env = "ROWSYNC_TARGET_URL")]
    target_url: String,

    /// Target connection pool size.
    #[arg(long, env = "ROWSYNC_TARGET_POOL_SIZE", default_value_t = 10)]
    target_pool_size: u32,

    /// Process-wide log level floor, overridden per-cycle by `metadata.config`'s
    /// `debug_level` once the catalog is reachable.
    #[arg(long, env = "ROWSYNC_LOG_LEVEL", default_value = "INFO")]
    log_level: String,
}

fn init_tracing(level: DebugLevel) {
    let filter = match level {
        DebugLevel::Debug => "debug",
        DebugLevel::Info => "info",
        DebugLevel::Warning => "warn",
        DebugLevel::Error | DebugLevel::Critical => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(DebugLevel::from_str(&args.log_level));

    let pool = PgPoolOptions::new()
        .max_connections(args.target_pool_size)
        .connect(&args.target_url)
        .await?;

    let catalog = CatalogStore::new(pool.clone());
    let target = TargetWriter::new(pool);
    let runtime = Arc::new(Runtime::new(catalog, target));

    let shutdown_runtime = runtime.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(component = "rowsyncd", "shutdown signal received");
        shutdown_runtime.trigger_shutdown();
    });

    tracing::info!(component = "rowsyncd", "starting scheduler");
    scheduler::run(runtime).await;
    Ok(())
}
