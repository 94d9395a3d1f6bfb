use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use questsync::app::App;
use questsync::config::Config;
use questsync::logging::{self, LogTarget};
use questsync::queue::{Connectivity, Method, OfflineMutationQueue, Operation, QueueItem};
use questsync::{RemoteClient, SqliteStore, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "questsync")]
#[command(about = "Inspect and drive the offline sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/questsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the rolling log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Live status view with the pending/failed indicator (default)
  #[command(alias = "watch")]
  Status,

  /// Operate on the offline mutation queue
  #[command(subcommand)]
  Queue(QueueCommand),
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Counts by status
  Stats,
  /// Every item in queue order
  List,
  /// Queue a write for later replay
  Enqueue {
    /// HTTP method: POST, PUT, PATCH or DELETE
    #[arg(short, long)]
    method: Method,
    /// Path relative to the remote URL
    #[arg(short, long)]
    path: String,
    /// Logical resource id (defaults to the path)
    #[arg(short, long)]
    resource: Option<String>,
    /// JSON body
    #[arg(long)]
    payload: Option<String>,
    /// Cache key or key prefix (ending in ':') to invalidate once sent
    #[arg(long = "invalidate")]
    invalidates: Vec<String>,
  },
  /// Send every eligible item now
  Drain,
  /// Re-queue items that ran out of attempts
  RetryFailed,
  /// Drop one item
  Remove { id: String },
  /// Drop every item
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let target = if args.log_stderr {
    LogTarget::Stderr
  } else {
    LogTarget::default_directory()?
  };
  let _log_guard = logging::init(&config.logging, target)?;

  let queue = Arc::new(open_queue(&config)?);

  match args.command.unwrap_or(Command::Status) {
    Command::Status => {
      let mut app = App::new(queue, Arc::new(SystemClock), config.remote.url.clone());
      app.run().await?;
    }
    Command::Queue(command) => run_queue_command(&queue, command).await?,
  }

  Ok(())
}

fn open_queue(config: &Config) -> Result<OfflineMutationQueue> {
  let store = match &config.queue.db_path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };
  let remote = RemoteClient::new(&config.remote)?;

  let cache = config.cache.request_cache(Arc::new(SystemClock));

  Ok(
    OfflineMutationQueue::open(
      Arc::new(store),
      Arc::new(remote),
      Connectivity::always_online(),
      config.queue.queue_config(),
    )
    .with_cache(cache),
  )
}

async fn run_queue_command(queue: &OfflineMutationQueue, command: QueueCommand) -> Result<()> {
  match command {
    QueueCommand::Stats => {
      let stats = queue.stats();
      println!("total:    {}", stats.total);
      println!("pending:  {}", stats.pending);
      println!("retrying: {}", stats.retrying);
      println!("failed:   {}", stats.failed);
      if let Some(oldest) = stats.oldest_item {
        println!("oldest:   {}", oldest.to_rfc3339());
      }
    }
    QueueCommand::List => {
      for item in queue.items() {
        print_item(&item);
      }
    }
    QueueCommand::Enqueue {
      method,
      path,
      resource,
      payload,
      invalidates,
    } => {
      let mut operation = Operation::new(resource.unwrap_or_else(|| path.clone()), method, path);
      if let Some(payload) = payload {
        let payload =
          serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
        operation = operation.with_payload(payload);
      }
      for key in invalidates {
        operation = operation.invalidating(key);
      }
      let item = queue.enqueue(operation)?;
      println!("{}", item.id);
    }
    QueueCommand::Drain => {
      let report = queue.process().await;
      info!(?report, "drain from command line finished");
      println!(
        "sent {}, retrying {}, failed {}",
        report.sent, report.retried, report.failed
      );
    }
    QueueCommand::RetryFailed => {
      let count = queue.requeue_failed()?;
      println!("re-queued {}", count);
    }
    QueueCommand::Remove { id } => {
      if !queue.remove(&id)? {
        return Err(eyre!("No queued item with id {}", id));
      }
    }
    QueueCommand::Clear => queue.clear()?,
  }
  Ok(())
}

fn print_item(item: &QueueItem) {
  let status = format!("{:?}", item.status).to_lowercase();
  print!(
    "{:<20} {:<8} {:<6} {} (attempts {})",
    item.id, status, item.operation.method, item.operation.path, item.attempts
  );
  match &item.last_error {
    Some(error) => println!("  {}", error),
    None => println!(),
  }
}
