use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use driftq::config::Config;
use driftq::connectivity::spawn_probe;
use driftq::db::StorageLocation;
use driftq::{logging, CacheStore, ConnectivityMonitor, HttpSender, MutationQueue, SyncOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "driftq")]
#[command(about = "Offline-first cache and durable mutation queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/driftq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Keep syncing until interrupted
  Run,
  /// Queue a mutation for delivery
  Enqueue {
    op_type: String,
    /// JSON payload
    payload: String,
  },
  /// Show pending and dead-lettered counts
  Status,
  /// List dead-lettered mutations
  DeadLetters,
  /// Give a dead-lettered mutation a fresh retry budget
  Retry { id: i64 },
  /// Discard all dead-lettered mutations
  PurgeDead,
  /// Inspect or edit the cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get {
    key: String,
  },
  Set {
    key: String,
    /// JSON value
    value: String,
    /// Lifetime in seconds; 0 keeps the entry until removed
    #[arg(long, default_value_t = 0)]
    ttl: u64,
  },
  Remove {
    key: String,
  },
  /// Remove every expired entry now
  Sweep,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Run => run(config).await,
    command => {
      let _ = logging::init(None);
      offline_command(config, command).await
    }
  }
}

async fn run(config: Config) -> Result<()> {
  let db = config.database()?;
  let log_dir = match db.location() {
    StorageLocation::File(path) => path.parent().map(|p| p.join("logs")),
    StorageLocation::Memory => None,
  };
  let _guard = logging::init(log_dir.as_deref());

  let endpoint = config
    .remote
    .endpoint
    .clone()
    .ok_or_else(|| eyre!("No remote endpoint configured. Set remote.endpoint or DRIFTQ_ENDPOINT."))?;
  let settings = config.sync.settings()?;

  let sender = HttpSender::new(&endpoint, settings.send_timeout)?;
  let monitor = ConnectivityMonitor::new(false);
  let probe = spawn_probe(
    monitor.clone(),
    reqwest::Client::new(),
    endpoint.clone(),
    Duration::from_secs(config.remote.probe_interval_seconds.max(1)),
  );

  let mut sync = SyncOrchestrator::open(db, monitor, sender, settings);
  let mode = sync.start().await?;
  info!(%endpoint, ?mode, "driftq running, Ctrl-C to stop");

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  probe.abort();
  sync.stop();
  Ok(())
}

async fn offline_command(config: Config, command: Command) -> Result<()> {
  let db = config.database()?;
  let settings = config.sync.settings()?;
  let cache = CacheStore::new(db.clone());
  let queue = MutationQueue::new(db, settings.retry);

  match command {
    Command::Run => return Err(eyre!("run needs the sync service, not a one-shot command")),
    Command::Enqueue { op_type, payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      queue.init().await?;
      let mutation = queue.enqueue(&op_type, &payload).await?;
      println!("{}", mutation.id);
    }
    Command::Status => {
      queue.init().await?;
      println!("pending: {}", queue.pending_count().await?);
      println!("dead letters: {}", queue.dead_letter_count().await?);
    }
    Command::DeadLetters => {
      queue.init().await?;
      for mutation in queue.dead_letters().await? {
        println!("{}", serde_json::to_string(&mutation)?);
      }
    }
    Command::Retry { id } => {
      queue.init().await?;
      queue.retry_dead_letter(id).await?;
      println!("requeued {}", id);
    }
    Command::PurgeDead => {
      queue.init().await?;
      println!("removed {}", queue.clear_dead_letters().await?);
    }
    Command::Cache(command) => {
      cache.init().await?;
      match command {
        CacheCommand::Get { key } => match cache.get_entry::<serde_json::Value>(&key).await? {
          Some(entry) => {
            info!(
              key = %entry.key,
              age_seconds = entry.age(Utc::now()).num_seconds(),
              expires_at = ?entry.expires_at(),
              "Cache hit"
            );
            println!("{}", entry.value);
          }
          None => return Err(eyre!("No live entry for '{}'", key)),
        },
        CacheCommand::Set { key, value, ttl } => {
          let value: serde_json::Value =
            serde_json::from_str(&value).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
          cache.set(&key, &value, ttl).await?;
        }
        CacheCommand::Remove { key } => {
          cache.remove(&key).await?;
        }
        CacheCommand::Sweep => {
          println!("removed {}", cache.clear_expired().await?);
        }
      }
    }
  }

  Ok(())
}
