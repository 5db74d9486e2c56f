mod app;
mod cache;
mod config;
mod connectivity;
mod db;
mod event;
mod logging;
mod outbox;
mod queue;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::app::App;
use crate::cache::{CacheRequest, CacheSource};
use crate::config::Config;
use crate::connectivity::{ConnectivityHandle, ConnectivityState};
use crate::outbox::Outbox;
use crate::queue::{MutationId, MutationStatus, Operation, QueueStore};
use crate::sync::{HttpEndpoint, SyncHandle};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first change queue and read cache for the marketplace")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Remote mutation endpoint, overriding endpoint.url
  #[arg(long, global = true)]
  endpoint: Option<String>,

  /// Start offline: queue only, no network
  #[arg(long, global = true)]
  offline: bool,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a change, then sync it if online
  Enqueue {
    #[arg(long)]
    operation: Operation,
    #[arg(long)]
    collection: String,
    #[arg(long)]
    id: String,
    /// Whole-record payload as JSON
    #[arg(long, default_value = "null")]
    payload: String,
  },
  /// Run one sync pass in the foreground
  Sync,
  /// Show queue counts
  Status {
    /// List every record that is not completed
    #[arg(long)]
    list: bool,
  },
  /// Give a rejected or dead-lettered change a fresh retry budget
  Requeue { id: i64 },
  /// Read a URL through the cache
  Fetch {
    url: String,
    #[arg(long, default_value = "GET")]
    method: String,
  },
  /// Activate a cache generation, purge the others and precache assets
  CacheActivate {
    /// Defaults to cache.version
    version: Option<String>,
  },
  /// Sync continuously until Ctrl-C
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(endpoint) = args.endpoint.clone() {
    config.endpoint.url = Some(endpoint);
  }

  let log_dir = logging::default_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  let _guard = logging::init(&log_dir, args.verbose)?;

  let initial = if args.offline {
    ConnectivityState::Offline
  } else {
    ConnectivityState::Online
  };

  match args.command {
    Command::Enqueue {
      operation,
      collection,
      id,
      payload,
    } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;

      let outbox = Outbox::new(
        open_store(&config)?,
        ConnectivityHandle::fixed(ConnectivityState::Offline),
        SyncHandle::new(),
      );
      let queued = outbox
        .enqueue(operation, &collection, &id, &payload)
        .map_err(|e| eyre!("Change NOT saved: {}", e))?;
      println!("queued change {}", queued);
      drop(outbox);

      if initial.is_online() && config.endpoint.url.is_some() {
        let app = build_app(config, initial)?;
        print_report(&app.sync_now().await?);
        print_waiting(&app)?;
      }
    }
    Command::Sync => {
      let app = build_app(config, initial)?;
      print_report(&app.sync_now().await?);
      print_waiting(&app)?;
    }
    Command::Status { list } => {
      let store = open_store(&config)?;
      let summary = store.summary()?;
      println!("{} changes waiting to sync", summary.waiting());
      println!(
        "pending {}  processing {}  failed {}  completed {}  rejected {}  dead-letter {}",
        summary.pending,
        summary.processing,
        summary.failed,
        summary.completed,
        summary.rejected,
        summary.dead_letter
      );
      if summary.needs_attention() > 0 {
        println!(
          "{} changes need attention (marked ! in `fieldsync status --list`)",
          summary.needs_attention()
        );
      }

      if list {
        for status in MutationStatus::ALL {
          if status == MutationStatus::Completed {
            continue;
          }
          for record in store.list_by_status(status)? {
            println!(
              "{} {:>6}  {:<11}  {:<6}  {}/{}  retries={}{}",
              if status.is_terminal() { "!" } else { " " },
              record.id.to_string(),
              record.status.as_str(),
              record.operation.as_str(),
              record.target_collection,
              record.target_id,
              record.retry_count,
              record
                .last_error
                .as_deref()
                .map(|e| format!("  {}", e))
                .unwrap_or_default()
            );
          }
        }
      }
    }
    Command::Requeue { id } => {
      let store = open_store(&config)?;
      store
        .requeue(MutationId(id))
        .map_err(|e| eyre!("Cannot requeue {}: {}", id, e))?;
      println!("change {} requeued", id);
    }
    Command::Fetch { url, method } => {
      let method = method
        .to_uppercase()
        .parse::<reqwest::Method>()
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let request = CacheRequest::new(method, config.resolve_url(&url)?);

      let (client, _task) = app::start_cache(&config)?;
      client.activate(&config.cache.version).await?;
      let result = client.fetch(request).await?;

      let cached_at = result
        .cached_at
        .map(|t| format!(" (cached {})", t.to_rfc3339()))
        .unwrap_or_default();
      eprintln!("{} from {}{}", result.data.status, result.source.as_str(), cached_at);
      if result.source == CacheSource::Placeholder {
        eprintln!("offline and not cached");
      }
      std::io::stdout()
        .write_all(&result.data.body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))?;
    }
    Command::CacheActivate { version } => {
      let version = version.unwrap_or_else(|| config.cache.version.clone());
      let (client, _task) = app::start_cache(&config)?;

      let purged = client.activate(&version).await?;
      println!("activated {}; purged {:?}", version, purged);

      if !config.cache.precache.is_empty() {
        let requests = config
          .cache
          .precache
          .iter()
          .map(|raw| config.resolve_url(raw).map(CacheRequest::get))
          .collect::<Result<Vec<_>>>()?;
        let total = requests.len();
        let stored = client.precache(requests).await?;
        println!("precached {}/{}", stored, total);
      }
    }
    Command::Run => {
      let mut app = build_app(config, initial)?;
      app.run().await?;
    }
  }

  Ok(())
}

fn open_store(config: &Config) -> Result<Arc<QueueStore>> {
  let path = config.store_path()?;
  let store = QueueStore::open(&path)
    .map_err(|e| eyre!("Failed to open queue at {}: {}", path.display(), e))?;
  Ok(Arc::new(store))
}

fn build_app(config: Config, initial: ConnectivityState) -> Result<App<HttpEndpoint>> {
  let endpoint = HttpEndpoint::new(
    config.endpoint_url()?,
    config.endpoint_timeout(),
    Config::endpoint_token(),
  )?;
  App::new(config, endpoint, initial)
}

fn print_report(report: &sync::PassReport) {
  if report.busy {
    println!("another sync pass is running");
    return;
  }
  println!(
    "synced: {} completed, {} failed, {} rejected, {} dead-lettered ({} batches)",
    report.completed, report.failed, report.rejected, report.dead_lettered, report.batches
  );
  if let Some(at) = report.next_retry_at {
    println!("next retry at {}", at.to_rfc3339());
  }
}

fn print_waiting(app: &App<HttpEndpoint>) -> Result<()> {
  println!("{} changes waiting to sync", app.summary()?.waiting());
  Ok(())
}
