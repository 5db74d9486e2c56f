//! The cache runs as its own task; everything else talks to it through
//! `CacheClient` messages.

use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::layer::CacheLayer;
use super::storage::CacheStorage;
use super::traits::{CacheRequest, CacheResult, CachedResponse, Fetcher};

const CHANNEL_CAPACITY: usize = 64;

enum WorkerMessage {
  Fetch {
    request: CacheRequest,
    reply: oneshot::Sender<Result<CacheResult<CachedResponse>>>,
  },
  Activate {
    version: String,
    reply: oneshot::Sender<Result<Vec<String>>>,
  },
  Precache {
    requests: Vec<CacheRequest>,
    reply: oneshot::Sender<usize>,
  },
}

/// Handle on a running cache worker.
#[derive(Clone)]
pub struct CacheClient {
  tx: mpsc::Sender<WorkerMessage>,
}

impl CacheClient {
  pub async fn fetch(&self, request: CacheRequest) -> Result<CacheResult<CachedResponse>> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerMessage::Fetch { request, reply }).await?;
    rx.await.map_err(|_| eyre!("Cache worker dropped the request"))?
  }

  /// Switch generations; returns the purged cache names.
  pub async fn activate(&self, version: &str) -> Result<Vec<String>> {
    let (reply, rx) = oneshot::channel();
    self
      .send(WorkerMessage::Activate {
        version: version.to_string(),
        reply,
      })
      .await?;
    rx.await.map_err(|_| eyre!("Cache worker dropped the request"))?
  }

  pub async fn precache(&self, requests: Vec<CacheRequest>) -> Result<usize> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerMessage::Precache { requests, reply }).await?;
    rx.await.map_err(|_| eyre!("Cache worker dropped the request"))
  }

  async fn send(&self, message: WorkerMessage) -> Result<()> {
    self
      .tx
      .send(message)
      .await
      .map_err(|_| eyre!("Cache worker is not running"))
  }
}

/// Start the worker. It stops once every `CacheClient` is dropped.
pub fn spawn<S, F>(mut layer: CacheLayer<S, F>) -> (CacheClient, JoinHandle<()>)
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

  let task = tokio::spawn(async move {
    while let Some(message) = rx.recv().await {
      match message {
        WorkerMessage::Fetch { request, reply } => {
          // Reads don't wait on each other
          let layer = layer.clone();
          tokio::spawn(async move {
            let _ = reply.send(layer.handle(&request).await);
          });
        }
        WorkerMessage::Activate { version, reply } => {
          let result = layer.activate(&version);
          match &result {
            Ok(purged) => info!(
              version = layer.generation().version(),
              purged = purged.len(),
              "cache generation activated"
            ),
            Err(e) => error!(version = %version, error = %e, "cache activation failed"),
          }
          let _ = reply.send(result);
        }
        WorkerMessage::Precache { requests, reply } => {
          let stored = layer.precache(requests).await;
          let _ = reply.send(stored);
        }
      }
    }
  });

  (CacheClient { tx }, task)
}
