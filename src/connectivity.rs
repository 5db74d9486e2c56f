//! Online/offline state machine with a debounced reconnect trigger.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::sync::SyncHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Online,
  Offline,
}

impl ConnectivityState {
  pub fn is_online(&self) -> bool {
    matches!(self, Self::Online)
  }
}

/// Read-only view of the current connectivity, cheap to clone.
#[derive(Clone)]
pub struct ConnectivityHandle {
  rx: watch::Receiver<ConnectivityState>,
}

impl ConnectivityHandle {
  pub fn current(&self) -> ConnectivityState {
    *self.rx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current().is_online()
  }

  /// Receiver that wakes on every published transition.
  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.rx.clone()
  }

  /// A handle pinned to one state, for code paths with no monitor.
  pub fn fixed(state: ConnectivityState) -> Self {
    let (_tx, rx) = watch::channel(state);
    Self { rx }
  }
}

/// Source of platform connectivity observations.
pub trait ConnectivityProbe: Send + Sync {
  fn check(&self) -> impl Future<Output = ConnectivityState> + Send;
}

/// Probe that treats any HTTP answer from `url` as being online.
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to build probe client: {}", e))?;
    Ok(Self { client, url })
  }
}

impl ConnectivityProbe for HttpProbe {
  async fn check(&self) -> ConnectivityState {
    match self.client.head(self.url.clone()).send().await {
      Ok(_) => ConnectivityState::Online,
      Err(e) => {
        debug!(url = %self.url, error = %e, "connectivity probe failed");
        ConnectivityState::Offline
      }
    }
  }
}

/// Two-state connectivity machine.
///
/// Offline→Online is only published after `debounce` of uninterrupted online
/// reports, and then requests exactly one sync pass. Online→Offline is
/// published immediately.
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<ConnectivityState>>,
  sync: SyncHandle,
  debounce: Duration,
  armed: Mutex<Option<JoinHandle<()>>>,
  /// Bumped by every offline report; a debounce armed under an older value
  /// must not publish
  epoch: Arc<AtomicU64>,
}

impl ConnectivityMonitor {
  pub fn new(initial: ConnectivityState, debounce: Duration, sync: SyncHandle) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self {
      tx: Arc::new(tx),
      sync,
      debounce,
      armed: Mutex::new(None),
      epoch: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn handle(&self) -> ConnectivityHandle {
    ConnectivityHandle {
      rx: self.tx.subscribe(),
    }
  }

  pub fn current(&self) -> ConnectivityState {
    *self.tx.borrow()
  }

  /// Feed one platform observation into the state machine.
  pub fn report(&self, observed: ConnectivityState) {
    let mut armed = match self.armed.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    match (self.current(), observed) {
      (ConnectivityState::Offline, ConnectivityState::Online) => {
        if armed.as_ref().is_some_and(|task| !task.is_finished()) {
          return;
        }

        debug!(debounce_ms = self.debounce.as_millis() as u64, "network back, debouncing");
        let tx = Arc::clone(&self.tx);
        let epoch = Arc::clone(&self.epoch);
        let armed_at = epoch.load(Ordering::SeqCst);
        let sync = self.sync.clone();
        let debounce = self.debounce;
        *armed = Some(tokio::spawn(async move {
          tokio::time::sleep(debounce).await;
          if publish_online(&tx, &epoch, armed_at) {
            info!("connectivity: online");
            sync.request_pass();
          }
        }));
      }
      (_, ConnectivityState::Offline) => {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = armed.take() {
          task.abort();
        }
        let changed = self.tx.send_if_modified(|state| {
          let was_online = state.is_online();
          *state = ConnectivityState::Offline;
          was_online
        });
        if changed {
          warn!("connectivity: offline");
        }
      }
      (ConnectivityState::Online, ConnectivityState::Online) => {}
    }
  }

  /// Poll `probe` every `interval` and report each result.
  pub fn spawn_polling<P>(self: &Arc<Self>, probe: P, interval: Duration) -> JoinHandle<()>
  where
    P: ConnectivityProbe + 'static,
  {
    let weak = Arc::downgrade(self);
    tokio::spawn(async move {
      loop {
        let observed = probe.check().await;
        // Polling ends once the monitor is gone
        let Some(monitor) = weak.upgrade() else {
          break;
        };
        monitor.report(observed);
        drop(monitor);
        tokio::time::sleep(interval).await;
      }
    })
  }
}

/// Publish Online unless an offline report arrived since `armed_at`. The
/// check runs under the watch lock, so it cannot interleave with one.
fn publish_online(tx: &watch::Sender<ConnectivityState>, epoch: &AtomicU64, armed_at: u64) -> bool {
  tx.send_if_modified(|state| {
    if epoch.load(Ordering::SeqCst) != armed_at || state.is_online() {
      return false;
    }
    *state = ConnectivityState::Online;
    true
  })
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    if let Ok(mut armed) = self.armed.lock() {
      if let Some(task) = armed.take() {
        task.abort();
      }
    }
  }
}
