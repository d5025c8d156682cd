//! Unistore administration CLI
//!
//! Schema migrations, health checks and search re-indexing against the
//! configured backend.
//!
//! # Usage
//!
//! ```bash
//! # Apply pending migrations to the relational store
//! unistore-admin --config unistore.toml migrate
//!
//! # Undo the most recent migration
//! unistore-admin rollback
//!
//! # Applied and pending migrations
//! unistore-admin status
//!
//! # One health check, printed as JSON
//! unistore-admin health
//!
//! # Index every document not yet in the search engine
//! unistore-admin sync-search --batch-size 200
//! ```
//!
//! Settings come from the optional TOML file and `UNISTORE_*` environment
//! variables. Log verbosity follows `RUST_LOG`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use unistore_core::db::{BackendKind, LibsqlStore, MigrationRunner, StoreAdapter};
use unistore_core::services::{DatabaseManager, HealthMonitor, HealthStatus};
use unistore_core::DalConfig;

#[derive(Parser, Debug)]
#[command(name = "unistore-admin", version, about = "Unistore data access layer administration")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Roll back the most recently applied migration
    Rollback,
    /// Show applied and pending migrations
    Status,
    /// Check the store, the search engine and this process
    Health,
    /// Index documents that are missing from the search engine
    SyncSearch {
        /// Documents per indexing batch
        #[arg(long)]
        batch_size: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("unistore_admin=info,unistore_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = DalConfig::load(cli.config.as_deref()).context("loading configuration")?;
    // One-shot commands never need the background monitor
    config.monitor.enabled = false;

    match cli.command {
        Command::Migrate => {
            let (store, runner) = migration_runner(&config).await?;
            let report = runner.run_migrations().await?;
            if report.applied.is_empty() {
                println!("Schema is up to date ({} applied)", report.already_applied);
            } else {
                for file in &report.applied {
                    println!("applied  {}", file);
                }
                println!("{} migration(s) applied", report.applied.len());
            }
            store.disconnect().await?;
        }
        Command::Rollback => {
            let (store, runner) = migration_runner(&config).await?;
            match runner.rollback_last_migration().await? {
                Some(file) => println!("rolled back  {}", file),
                None => println!("Nothing to roll back"),
            }
            store.disconnect().await?;
        }
        Command::Status => {
            let (store, runner) = migration_runner(&config).await?;
            let status = runner.status().await?;
            println!("Migrations from {}", runner.source());
            for applied in &status.applied {
                println!("  [x] {}  ({})", applied.filename, applied.applied_at);
            }
            for pending in &status.pending {
                println!("  [ ] {}", pending);
            }
            store.disconnect().await?;
        }
        Command::Health => {
            let manager = DatabaseManager::new();
            manager.initialize(&config).await?;
            let monitor = HealthMonitor::new(manager.adapter()?, manager.search_indexer()?);
            let report = monitor.check_now().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            manager.disconnect().await?;
            if report.status != HealthStatus::Healthy {
                bail!("status is {}", report.status);
            }
        }
        Command::SyncSearch { batch_size } => {
            let manager = DatabaseManager::new();
            manager.initialize(&config).await?;
            if !manager.search_indexer()?.is_enabled() {
                manager.disconnect().await?;
                bail!("search is not configured; set UNISTORE_SEARCH_URL or [search].url");
            }
            let reports = manager.sync_search_index(batch_size).await?;
            let mut failed = false;
            for (collection, report) in &reports {
                match &report.error {
                    Some(error) => {
                        failed = true;
                        println!("{:<16} {} indexed, stopped: {}", collection, report.indexed, error);
                    }
                    None => println!("{:<16} {} indexed", collection, report.indexed),
                }
            }
            manager.disconnect().await?;
            if failed {
                bail!("search sync incomplete");
            }
        }
    }
    Ok(())
}

/// Relational store without auto-migration, plus a runner over its pool
async fn migration_runner(config: &DalConfig) -> anyhow::Result<(Arc<LibsqlStore>, MigrationRunner)> {
    if config.backend_kind()? != BackendKind::Relational {
        bail!("migrations apply to the relational backend only (backend = \"relational\")");
    }
    let mut libsql = config.libsql_config();
    libsql.auto_migrate = false;
    let store = Arc::new(LibsqlStore::new(libsql)?);
    store.connect().await?;
    let runner = store.migration_runner()?;
    Ok((store, runner))
}
