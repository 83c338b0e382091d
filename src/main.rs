use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plansync::config::Config;
use plansync::connectivity::{Connectivity, ConnectivityMonitor};
use plansync::db::SqliteStore;
use plansync::event::Notifier;
use plansync::queue::{ExecutorRegistry, OperationQueue, QueuedOperation};

#[derive(Parser, Debug)]
#[command(name = "plansync")]
#[command(about = "Inspect and repair the planner's offline sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/plansync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show pending and failed counts (default)
  Status,
  /// List operations that exhausted their retries
  Failed,
  /// Move one failed operation back into the queue
  Retry { id: String },
  /// Move every failed operation back into the queue
  RetryAll,
  /// Drop one failed operation for good
  Discard { id: String },
  /// Drop every failed operation
  Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let db_path = match &config.database_path {
    Some(path) => path.clone(),
    None => SqliteStore::default_path()?,
  };
  let _log_guard = init_logging(&db_path)?;

  // The CLI never talks to the remote: it only edits the persisted lists,
  // which the app picks up on its next pass.
  let store = SqliteStore::open(&db_path)?;
  let notifier = Arc::new(Notifier::new());
  let connectivity = Arc::new(ConnectivityMonitor::new(
    Connectivity::Offline,
    notifier.clone(),
  ));
  let queue = OperationQueue::new(
    Arc::new(store),
    Arc::new(ExecutorRegistry::new()),
    connectivity,
    notifier,
  )
  .with_options(config.queue.options());

  match args.command.unwrap_or(Command::Status) {
    Command::Status => {
      println!("database: {}", db_path.display());
      println!("pending:  {}", queue.len());
      println!("failed:   {}", queue.failed().len());
      for op in queue.pending() {
        print_operation(&op);
      }
    }
    Command::Failed => {
      let failed = queue.failed();
      if failed.is_empty() {
        println!("No failed operations");
      }
      for op in failed {
        print_operation(&op);
      }
    }
    Command::Retry { id } => {
      if !queue.retry_failed(&id) {
        return Err(eyre!("No failed operation with id {}", id));
      }
      println!("Requeued {}", id);
    }
    Command::RetryAll => {
      let count = queue.retry_all_failed();
      println!("Requeued {} operations", count);
    }
    Command::Discard { id } => {
      let op = queue
        .discard_failed(&id)
        .ok_or_else(|| eyre!("No failed operation with id {}", id))?;
      info!(id = %op.id, "Discarded from CLI");
      println!("Discarded {} {} {}", op.id, op.kind, op.entity_type);
    }
    Command::Purge => {
      let count = queue.clear_failed();
      println!("Discarded {} operations", count);
    }
  }

  Ok(())
}

/// Log to a daily file next to the database; stdout stays for command output.
fn init_logging(db_path: &Path) -> Result<WorkerGuard> {
  let log_dir = db_path
    .parent()
    .map(|p| p.join("logs"))
    .ok_or_else(|| eyre!("Invalid database path {}", db_path.display()))?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "plansync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("PLANSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn print_operation(op: &QueuedOperation) {
  let enqueued = DateTime::from_timestamp_millis(op.enqueued_at)
    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| op.enqueued_at.to_string());
  println!(
    "{}  {:<6} {:<12} attempts={}  queued {}",
    op.id,
    op.kind.to_string(),
    op.entity_type.to_string(),
    op.attempt_count,
    enqueued
  );
}
