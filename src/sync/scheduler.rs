//! The single "request a pass" entry point and the task that serves it.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::endpoint::MutationEndpoint;
use super::engine::SyncEngine;
use crate::connectivity::ConnectivityHandle;

/// Cloneable trigger shared by every sync source (enqueue, reconnect,
/// periodic wake, resume, backoff timer).
///
/// Requests collapse into a single pending permit: any number of requests
/// made while a pass runs yield exactly one follow-up pass.
#[derive(Clone, Default)]
pub struct SyncHandle {
  inner: Arc<HandleInner>,
}

#[derive(Default)]
struct HandleInner {
  notify: Notify,
  requests: AtomicU64,
}

impl SyncHandle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn request_pass(&self) {
    self.inner.requests.fetch_add(1, Ordering::Relaxed);
    self.inner.notify.notify_one();
  }

  /// Total requests made through this handle.
  pub fn requests(&self) -> u64 {
    self.inner.requests.load(Ordering::Relaxed)
  }

  async fn requested(&self) {
    self.inner.notify.notified().await;
  }
}

/// Serve pass requests for `engine` until the task is aborted.
pub fn spawn<E>(
  engine: Arc<SyncEngine<E>>,
  handle: SyncHandle,
  connectivity: ConnectivityHandle,
) -> JoinHandle<()>
where
  E: MutationEndpoint + 'static,
{
  tokio::spawn(async move {
    let mut retry_wake = RetryWake::default();

    loop {
      handle.requested().await;

      if !connectivity.is_online() {
        debug!("offline, deferring requested sync pass");
        continue;
      }

      match engine.run_pass().await {
        Ok(report) => {
          if report.claimed > 0 {
            info!(
              completed = report.completed,
              failed = report.failed,
              rejected = report.rejected,
              dead_lettered = report.dead_lettered,
              "sync pass finished"
            );
          }
        }
        Err(e) => error!(error = %e, "sync pass failed"),
      }

      // Records that failed in earlier passes still owe a wake, so the
      // deadline comes from the queue rather than from this pass
      match engine.next_retry_at() {
        Ok(at) => retry_wake.arm(at, &handle),
        Err(e) => warn!(error = %e, "could not read retry deadline"),
      }
    }
  })
}

/// The single pending backoff timer.
#[derive(Default)]
struct RetryWake {
  at: Option<DateTime<Utc>>,
  task: Option<JoinHandle<()>>,
}

impl RetryWake {
  fn arm(&mut self, at: Option<DateTime<Utc>>, handle: &SyncHandle) {
    let running = self.task.as_ref().is_some_and(|task| !task.is_finished());
    if running && self.at == at {
      return;
    }
    if let Some(task) = self.task.take() {
      task.abort();
    }

    self.at = at;
    let Some(at) = at else {
      return;
    };
    let delay = (at - Utc::now()).to_std().unwrap_or_default();
    let handle = handle.clone();
    debug!(delay_ms = delay.as_millis() as u64, "arming retry wake");
    self.task = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      handle.request_pass();
    }));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ConnectivityState;
  use crate::queue::{MutationStatus, QueueStore};
  use crate::sync::backoff::RetryPolicy;
  use crate::sync::endpoint::SubmitError;
  use crate::sync::engine::SyncSettings;
  use crate::sync::testing::{update, MockEndpoint};
  use std::time::Duration;

  async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("condition not reached in time");
  }

  fn setup() -> (tempfile::TempDir, Arc<QueueStore>, Arc<MockEndpoint>, Arc<SyncEngine<MockEndpoint>>) {
    setup_with(SyncSettings::default())
  }

  fn setup_with(
    settings: SyncSettings,
  ) -> (tempfile::TempDir, Arc<QueueStore>, Arc<MockEndpoint>, Arc<SyncEngine<MockEndpoint>>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(QueueStore::open(&dir.path().join("queue.db")).unwrap());
    let endpoint = Arc::new(MockEndpoint::default());
    let engine = Arc::new(SyncEngine::new(
      Arc::clone(&store),
      Arc::clone(&endpoint),
      settings,
    ));
    (dir, store, endpoint, engine)
  }

  #[tokio::test]
  async fn test_requests_during_a_pass_coalesce_into_one_follow_up() {
    let (_dir, store, endpoint, engine) = setup();
    let handle = SyncHandle::new();
    endpoint.hold();

    store.append(&update("listings", "L1", 10)).unwrap();
    let task = spawn(
      Arc::clone(&engine),
      handle.clone(),
      ConnectivityHandle::fixed(ConnectivityState::Online),
    );

    handle.request_pass();
    wait_until(|| endpoint.calls().len() == 1).await;

    // First pass is blocked inside submit; pile up new work and requests
    store.append(&update("listings", "L2", 11)).unwrap();
    store.append(&update("listings", "L3", 12)).unwrap();
    for _ in 0..5 {
      handle.request_pass();
    }
    endpoint.release();

    wait_until(|| store.summary().unwrap().completed == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = endpoint.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].len(), 1);
    assert_eq!(calls[1].len(), 2);
    task.abort();
  }

  #[tokio::test]
  async fn test_offline_requests_make_no_calls() {
    let (_dir, store, endpoint, engine) = setup();
    let handle = SyncHandle::new();
    store.append(&update("listings", "L1", 10)).unwrap();

    let task = spawn(
      engine,
      handle.clone(),
      ConnectivityHandle::fixed(ConnectivityState::Offline),
    );
    handle.request_pass();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(endpoint.calls().is_empty());
    assert_eq!(store.list_by_status(MutationStatus::Pending).unwrap().len(), 1);
    task.abort();
  }

  #[tokio::test]
  async fn test_unrelated_pass_keeps_pending_retry_wake() {
    let (_dir, store, endpoint, engine) = setup_with(SyncSettings {
      retry: RetryPolicy {
        base: Duration::from_millis(300),
        max_delay: Duration::from_millis(300),
        max_attempts: 5,
      },
      ..SyncSettings::default()
    });
    let handle = SyncHandle::new();
    let task = spawn(
      Arc::clone(&engine),
      handle.clone(),
      ConnectivityHandle::fixed(ConnectivityState::Online),
    );

    let l1 = store.append(&update("listings", "L1", 10)).unwrap();
    endpoint.push(Err(SubmitError::Transport("connection reset".into())));
    handle.request_pass();
    wait_until(|| store.summary().unwrap().failed == 1).await;

    // A pass with nothing failing must not cancel L1's wake
    let l2 = store.append(&update("listings", "L2", 20)).unwrap();
    handle.request_pass();
    wait_until(|| store.get(l2).unwrap().unwrap().status == MutationStatus::Completed).await;

    wait_until(|| store.get(l1).unwrap().unwrap().status == MutationStatus::Completed).await;
    let l1_sends = endpoint
      .calls()
      .iter()
      .flatten()
      .filter(|c| c.document_id == "L1")
      .count();
    assert_eq!(l1_sends, 2);
    task.abort();
  }

  #[tokio::test]
  async fn test_retry_wake_fires_without_other_triggers() {
    let (_dir, store, endpoint, engine) = setup_with(SyncSettings {
      retry: RetryPolicy {
        base: Duration::from_millis(100),
        max_delay: Duration::from_millis(100),
        max_attempts: 5,
      },
      ..SyncSettings::default()
    });
    let handle = SyncHandle::new();
    let task = spawn(
      engine,
      handle.clone(),
      ConnectivityHandle::fixed(ConnectivityState::Online),
    );

    store.append(&update("listings", "L1", 10)).unwrap();
    endpoint.push(Err(SubmitError::Timeout));
    endpoint.push(Err(SubmitError::Timeout));
    handle.request_pass();

    wait_until(|| store.summary().unwrap().completed == 1).await;
    assert_eq!(endpoint.calls().len(), 3);
    task.abort();
  }
}
