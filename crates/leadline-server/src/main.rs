//! leadline server binary.
//!
//! Reads `leadline.toml` (or the path given with `--config`), opens the SQLite
//! store, and either serves the JSON API or drives the lead-shape migration.
//!
//! # Migration
//!
//! ```text
//! leadline migrate status
//! leadline migrate advance --phase expand
//! leadline migrate ack --operator nick
//! leadline migrate rollback
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use axum::Router;
use chrono::Utc;
use clap::{Parser, Subcommand};
use leadline_core::{
  evolution::{Coordinator, Phase},
  pipeline::Pipeline,
  rules::RuleEngine,
};
use leadline_server::{Notifier, ServerConfig};
use leadline_store_sqlite::SqliteStore;
use serde::Serialize;
use tokio::{net::TcpListener, sync::mpsc};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Leadline lead-pipeline server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "leadline.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
  /// Serve the HTTP API (the default).
  Serve,
  /// Inspect or advance the lead-shape consolidation.
  Migrate {
    #[command(subcommand)]
    action: MigrateAction,
  },
}

#[derive(Subcommand)]
enum MigrateAction {
  /// Print the migration record.
  Status,
  /// Run the next phase.
  Advance {
    /// Refuse to run unless this is the next phase.
    #[arg(long)]
    phase: Option<Phase>,
  },
  /// Clear a halt so the failed phase can be retried.
  Ack {
    #[arg(long)]
    operator: String,
  },
  /// Undo the most recently completed phase.
  Rollback,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let cfg = ServerConfig::load(&cli.config)?;

  let store_path = cfg.resolved_store_path();
  if let Some(parent) = store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  match cli.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(cfg, store).await,
    Command::Migrate { action } => migrate(&cfg, store, action).await,
  }
}

async fn serve(cfg: ServerConfig, store: SqliteStore) -> anyhow::Result<()> {
  let rules = RuleEngine::standard(&cfg.rules.settings())
    .context("invalid rule configuration")?;

  let store = Arc::new(store);
  let (tx, rx) = mpsc::unbounded_channel();
  let notifier = Notifier::new(cfg.notify_url.clone(), store.clone())?
    .with_sweep(Duration::from_secs(cfg.notify_sweep_secs))
    .spawn(rx);
  let pipeline = Pipeline::new(store, rules).with_notifications(tx);

  let app = Router::new().nest("/api", leadline_api::api_router(pipeline));
  let address = cfg.address();

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  // The router held the last sender; the notifier makes one last pass over
  // the outbox before exiting.
  notifier.await.context("notifier task failed")?;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(err) = tokio::signal::ctrl_c().await {
    tracing::error!(error = %err, "failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
  tracing::info!("shutting down");
}

async fn migrate(
  cfg: &ServerConfig,
  store: SqliteStore,
  action: MigrateAction,
) -> anyhow::Result<()> {
  let coordinator = Coordinator::new(
    store.consolidate_lead_shape(),
    store.clone(),
    cfg.migration.settings(),
  );
  let now = Utc::now();

  match action {
    MigrateAction::Status => {
      let record = coordinator.status().await?;
      print_json(&record)?;
      let shape = store.shape().await?;
      tracing::info!(
        legacy_present = shape.legacy_present,
        dual_write = shape.dual_write,
        read_consolidated = shape.read_consolidated,
        next = ?record.next_phase(),
        "lead shape"
      );
    }
    MigrateAction::Advance { phase } => {
      print_json(&coordinator.advance(phase, now).await?)?;
    }
    MigrateAction::Ack { operator } => {
      print_json(&coordinator.acknowledge(&operator, now).await?)?;
    }
    MigrateAction::Rollback => {
      print_json(&coordinator.rollback_last(now).await?)?;
    }
  }
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
