//! Turns user actions into durable queued mutations.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connectivity::ConnectivityHandle;
use crate::db::StoreError;
use crate::queue::{MutationId, NewMutation, Operation, QueueStore};
use crate::sync::SyncHandle;

/// The action was not saved. Callers must tell the user.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
  #[error("{0} must not be empty")]
  InvalidTarget(&'static str),

  #[error("payload is not serializable: {0}")]
  Payload(#[source] serde_json::Error),

  #[error("could not save change locally: {0}")]
  Storage(#[from] StoreError),
}

/// Outbox manager: persist first, sync later.
#[derive(Clone)]
pub struct Outbox {
  store: Arc<QueueStore>,
  connectivity: ConnectivityHandle,
  sync: SyncHandle,
}

impl Outbox {
  pub fn new(store: Arc<QueueStore>, connectivity: ConnectivityHandle, sync: SyncHandle) -> Self {
    Self {
      store,
      connectivity,
      sync,
    }
  }

  /// Queue a whole-record change.
  ///
  /// Returns once the record is durably stored; never waits on the network.
  pub fn enqueue<T>(
    &self,
    operation: Operation,
    target_collection: &str,
    target_id: &str,
    payload: &T,
  ) -> Result<MutationId, EnqueueError>
  where
    T: Serialize + ?Sized,
  {
    let target_collection = target_collection.trim();
    let target_id = target_id.trim();
    if target_collection.is_empty() {
      return Err(EnqueueError::InvalidTarget("target collection"));
    }
    if target_id.is_empty() {
      return Err(EnqueueError::InvalidTarget("target id"));
    }

    let payload = serde_json::to_value(payload).map_err(EnqueueError::Payload)?;
    let id = self.store.append(&NewMutation {
      operation,
      target_collection: target_collection.to_string(),
      target_id: target_id.to_string(),
      payload,
    })?;

    info!(%id, operation = operation.as_str(), collection = target_collection,
      document = target_id, "change queued");

    if self.connectivity.is_online() {
      self.sync.request_pass();
    } else {
      debug!(%id, "offline, change will sync on reconnect");
    }

    Ok(id)
  }

  /// "N changes waiting to sync".
  pub fn pending_count(&self) -> Result<u64, StoreError> {
    Ok(self.store.summary()?.waiting())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ConnectivityState;
  use crate::queue::MutationStatus;
  use serde_json::json;
  use std::collections::BTreeMap;

  fn outbox(state: ConnectivityState) -> (tempfile::TempDir, Outbox, SyncHandle) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(QueueStore::open(&dir.path().join("queue.db")).unwrap());
    let sync = SyncHandle::new();
    let outbox = Outbox::new(store, ConnectivityHandle::fixed(state), sync.clone());
    (dir, outbox, sync)
  }

  #[test]
  fn test_offline_enqueue_persists_without_triggering_sync() {
    let (_dir, outbox, sync) = outbox(ConnectivityState::Offline);

    let id = outbox
      .enqueue(Operation::Update, "listings", "L1", &json!({"price": 10}))
      .unwrap();

    let pending = outbox.store.list_by_status(MutationStatus::Pending).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].payload, json!({"price": 10}));
    assert_eq!(sync.requests(), 0);
    assert_eq!(outbox.pending_count().unwrap(), 1);
  }

  #[test]
  fn test_online_enqueue_requests_a_pass() {
    let (_dir, outbox, sync) = outbox(ConnectivityState::Online);
    outbox
      .enqueue(Operation::Delete, "crops", "C4", &json!(null))
      .unwrap();
    assert_eq!(sync.requests(), 1);
  }

  #[test]
  fn test_rejects_empty_targets() {
    let (_dir, outbox, _sync) = outbox(ConnectivityState::Online);

    assert!(matches!(
      outbox.enqueue(Operation::Create, "  ", "L1", &json!({})),
      Err(EnqueueError::InvalidTarget("target collection"))
    ));
    assert!(matches!(
      outbox.enqueue(Operation::Create, "listings", "", &json!({})),
      Err(EnqueueError::InvalidTarget("target id"))
    ));
    assert_eq!(outbox.pending_count().unwrap(), 0);
  }

  #[test]
  fn test_unserializable_payload_is_reported() {
    let (_dir, outbox, _sync) = outbox(ConnectivityState::Offline);

    // JSON object keys must be strings
    let mut payload = BTreeMap::new();
    payload.insert(vec![1u8], "x");

    assert!(matches!(
      outbox.enqueue(Operation::Update, "listings", "L1", &payload),
      Err(EnqueueError::Payload(_))
    ));
  }

  #[test]
  fn test_storage_failure_is_loud() {
    let (_dir, outbox, sync) = outbox(ConnectivityState::Online);
    outbox.store.set_read_only();

    let err = outbox
      .enqueue(Operation::Update, "listings", "L1", &json!({"price": 10}))
      .unwrap_err();
    assert!(matches!(err, EnqueueError::Storage(_)));
    // Nothing to sync, nothing pretended
    assert_eq!(sync.requests(), 0);
  }
}
