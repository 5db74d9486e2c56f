//! In-process endpoint double shared by the sync tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::Semaphore;

use super::endpoint::{BatchOutcome, Change, MutationEndpoint, SubmitError};
use crate::queue::{NewMutation, Operation};

pub fn update(collection: &str, id: &str, price: i64) -> NewMutation {
  NewMutation {
    operation: Operation::Update,
    target_collection: collection.to_string(),
    target_id: id.to_string(),
    payload: json!({ "price": price }),
  }
}

/// Records every batch; answers from a script, defaulting to `Accepted`.
#[derive(Default)]
pub struct MockEndpoint {
  calls: Mutex<Vec<Vec<Change>>>,
  script: Mutex<VecDeque<Result<BatchOutcome, SubmitError>>>,
  gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockEndpoint {
  pub fn push(&self, outcome: Result<BatchOutcome, SubmitError>) {
    self.script.lock().unwrap().push_back(outcome);
  }

  pub fn calls(&self) -> Vec<Vec<Change>> {
    self.calls.lock().unwrap().clone()
  }

  /// Make every `submit` block (after recording its call) until `release`.
  pub fn hold(&self) {
    *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release(&self) {
    if let Some(gate) = self.gate.lock().unwrap().take() {
      gate.close();
    }
  }
}

impl MutationEndpoint for MockEndpoint {
  async fn submit(&self, changes: &[Change]) -> Result<BatchOutcome, SubmitError> {
    self.calls.lock().unwrap().push(changes.to_vec());

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      // A closed semaphore means released
      let _ = gate.acquire().await;
    }

    self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or(Ok(BatchOutcome::Accepted))
  }
}
