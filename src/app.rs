use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheClient, CacheLayer, HttpFetcher, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, HttpProbe};
use crate::event::{Event, EventHandler};
use crate::outbox::Outbox;
use crate::queue::{QueueStore, QueueSummary};
use crate::sync::{scheduler, MutationEndpoint, PassReport, SyncEngine, SyncHandle};

/// Every service, constructed once and handed to whoever needs it.
pub struct App<E: MutationEndpoint> {
  config: Config,
  store: Arc<QueueStore>,
  outbox: Outbox,
  engine: Arc<SyncEngine<E>>,
  sync: SyncHandle,
  monitor: Arc<ConnectivityMonitor>,
  tasks: Vec<JoinHandle<()>>,
}

impl<E: MutationEndpoint + 'static> App<E> {
  /// Open the queue and wire the services together. Nothing runs until
  /// `start`.
  pub fn new(config: Config, endpoint: E, initial: ConnectivityState) -> Result<Self> {
    let path = config.store_path()?;
    let store = Arc::new(
      QueueStore::open(&path)
        .map_err(|e| eyre!("Failed to open queue at {}: {}", path.display(), e))?,
    );

    let sync = SyncHandle::new();
    let monitor = Arc::new(ConnectivityMonitor::new(
      initial,
      config.debounce(),
      sync.clone(),
    ));
    let outbox = Outbox::new(Arc::clone(&store), monitor.handle(), sync.clone());
    let engine = Arc::new(SyncEngine::new(
      Arc::clone(&store),
      Arc::new(endpoint),
      config.sync_settings(),
    ));

    Ok(Self {
      config,
      store,
      outbox,
      engine,
      sync,
      monitor,
      tasks: Vec::new(),
    })
  }

  pub fn outbox(&self) -> &Outbox {
    &self.outbox
  }

  pub fn store(&self) -> &QueueStore {
    &self.store
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn summary(&self) -> Result<QueueSummary> {
    self
      .store
      .summary()
      .map_err(|e| eyre!("Failed to read queue: {}", e))
  }

  /// Reclaim records a previous process left in Processing, start the
  /// scheduler and kick off a pass if online.
  pub fn start(&mut self) -> Result<()> {
    self.recover()?;

    self.tasks.push(scheduler::spawn(
      Arc::clone(&self.engine),
      self.sync.clone(),
      self.monitor.handle(),
    ));

    if self.monitor.current().is_online() {
      self.sync.request_pass();
    }
    Ok(())
  }

  /// One pass in the foreground, for the `sync` command.
  pub async fn sync_now(&self) -> Result<PassReport> {
    self.recover()?;
    if !self.monitor.current().is_online() {
      return Err(eyre!("Offline; changes stay queued until the network returns"));
    }
    self.engine.run_pass().await
  }

  fn recover(&self) -> Result<()> {
    let recovered = self
      .store
      .recover_interrupted()
      .map_err(|e| eyre!("Failed to recover interrupted changes: {}", e))?;
    if recovered > 0 {
      warn!(recovered, "re-queued changes interrupted mid-sync");
    }
    Ok(())
  }

  /// Long-running mode: serve triggers until Ctrl-C.
  pub async fn run(&mut self) -> Result<()> {
    self.start()?;

    if let Some(url) = self.config.probe_url()? {
      let conn = &self.config.connectivity;
      let probe = HttpProbe::new(url, Duration::from_millis(conn.probe_timeout_ms))?;
      self.tasks.push(
        self
          .monitor
          .spawn_polling(probe, Duration::from_secs(conn.probe_interval_secs.max(1))),
      );
    }

    let mut events = EventHandler::new(self.config.periodic_interval(), &self.monitor.handle());
    info!(waiting = self.outbox.pending_count().unwrap_or(0), "fieldsync running");

    while let Some(event) = events.next().await {
      if !self.handle_event(event) {
        break;
      }
    }

    info!("shutting down");
    Ok(())
  }

  /// Returns false once the loop should stop.
  fn handle_event(&self, event: Event) -> bool {
    match event {
      Event::Tick | Event::Resume => {
        debug!(?event, "sync wake");
        self.sync.request_pass();
      }
      Event::Connectivity(state) => match self.outbox.pending_count() {
        Ok(waiting) => info!(?state, waiting, "connectivity changed"),
        Err(e) => warn!(?state, error = %e, "connectivity changed; queue unreadable"),
      },
      Event::Shutdown => return false,
    }
    true
  }
}

/// Start a cache worker from `config.cache`. Activation is left to the
/// caller.
pub fn start_cache(config: &Config) -> Result<(CacheClient, JoinHandle<()>)> {
  let settings = &config.cache;
  let fetcher = HttpFetcher::new(Duration::from_secs(settings.timeout_secs))?;

  if settings.enabled {
    let storage = SqliteStorage::open(&config.cache_path()?)?;
    let layer = CacheLayer::new(storage, fetcher, settings.routes.clone(), &settings.version)
      .with_placeholder(&settings.placeholder_body);
    Ok(cache::spawn(layer))
  } else {
    let layer = CacheLayer::new(NoopStorage, fetcher, settings.routes.clone(), &settings.version)
      .with_placeholder(&settings.placeholder_body);
    Ok(cache::spawn(layer))
  }
}

impl<E: MutationEndpoint> Drop for App<E> {
  fn drop(&mut self) {
    for task in self.tasks.drain(..) {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{MutationStatus, Operation};
  use crate::sync::testing::MockEndpoint;
  use crate::sync::SubmitError;
  use serde_json::json;
  use std::path::Path;

  fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.store.path = Some(dir.join("queue.db"));
    config.cache.path = Some(dir.join("cache.db"));
    config.sync.debounce_ms = 100;
    config
  }

  async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("condition not reached in time");
  }

  #[tokio::test]
  async fn test_offline_enqueue_then_reconnect_syncs_once() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = MockEndpoint::default();
    let mut app = App::new(config(dir.path()), endpoint, ConnectivityState::Offline).unwrap();
    app.start().unwrap();

    app
      .outbox()
      .enqueue(Operation::Update, "listings", "L1", &json!({"price": 10}))
      .unwrap();
    assert_eq!(app.outbox().pending_count().unwrap(), 1);

    app.monitor().report(ConnectivityState::Online);
    wait_until(|| app.summary().unwrap().completed == 1).await;

    let calls = app.engine.endpoint().calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0].document_id, "L1");
    assert_eq!(app.outbox().pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_sync_now_reports_failures_without_erroring() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = MockEndpoint::default();
    endpoint.push(Err(SubmitError::Timeout));
    let app = App::new(config(dir.path()), endpoint, ConnectivityState::Online).unwrap();

    app
      .outbox()
      .enqueue(Operation::Update, "listings", "L1", &json!({"price": 10}))
      .unwrap();
    let report = app.sync_now().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(app.store().list_by_status(MutationStatus::Failed).unwrap().len(), 1);
    assert_eq!(app.outbox().pending_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_sync_now_refuses_when_offline() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(
      config(dir.path()),
      MockEndpoint::default(),
      ConnectivityState::Offline,
    )
    .unwrap();
    assert!(app.sync_now().await.is_err());
  }

  #[tokio::test]
  async fn test_queue_survives_app_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
      let app = App::new(
        config(dir.path()),
        MockEndpoint::default(),
        ConnectivityState::Offline,
      )
      .unwrap();
      app
        .outbox()
        .enqueue(Operation::Create, "crops", "C1", &json!({"name": "kale"}))
        .unwrap();
    }

    let app = App::new(
      config(dir.path()),
      MockEndpoint::default(),
      ConnectivityState::Offline,
    )
    .unwrap();
    let pending = app.store().list_by_status(MutationStatus::Pending).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, json!({"name": "kale"}));
  }

  #[tokio::test]
  async fn test_tick_and_resume_request_passes() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(
      config(dir.path()),
      MockEndpoint::default(),
      ConnectivityState::Online,
    )
    .unwrap();

    assert!(app.handle_event(Event::Tick));
    assert!(app.handle_event(Event::Resume));
    assert!(app.handle_event(Event::Connectivity(ConnectivityState::Offline)));
    assert_eq!(app.sync.requests(), 2);
    assert!(!app.handle_event(Event::Shutdown));
  }
}
