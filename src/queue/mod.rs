//! Durable mutation queue: record types and the SQLite store.

mod store;

pub use store::{QueueStore, QueueSummary};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Locally unique, creation-ordered record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub i64);

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl FromStr for Operation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(format!("unknown operation '{}'", other)),
    }
  }
}

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationStatus {
  /// Waiting for its first sync attempt
  Pending,
  /// Claimed by a running sync pass
  Processing,
  /// Acknowledged by the server, deleted after the purge delay
  Completed,
  /// Transient failure, retried once its backoff elapses
  Failed,
  /// Terminal server-side rejection, never retried
  Rejected,
  /// Exhausted its retry budget, held for manual inspection
  DeadLetter,
}

impl MutationStatus {
  pub const ALL: [MutationStatus; 6] = [
    Self::Pending,
    Self::Processing,
    Self::Completed,
    Self::Failed,
    Self::Rejected,
    Self::DeadLetter,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Processing => "processing",
      Self::Completed => "completed",
      Self::Failed => "failed",
      Self::Rejected => "rejected",
      Self::DeadLetter => "dead_letter",
    }
  }

  /// Terminal for the retry cycle; only a manual requeue moves these again.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Rejected | Self::DeadLetter)
  }
}

impl fmt::Display for MutationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .iter()
      .copied()
      .find(|status| status.as_str() == s)
      .ok_or_else(|| format!("unknown mutation status '{}'", s))
  }
}

/// The document a mutation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
  pub collection: String,
  pub id: String,
}

/// A mutation as the outbox hands it to the store, before it has an id.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub operation: Operation,
  pub target_collection: String,
  pub target_id: String,
  pub payload: serde_json::Value,
}

/// A queued whole-record change.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
  pub id: MutationId,
  pub created_at: DateTime<Utc>,
  pub operation: Operation,
  pub target_collection: String,
  pub target_id: String,
  pub payload: serde_json::Value,
  pub status: MutationStatus,
  pub retry_count: u32,
  /// Earliest time a Failed record may be attempted again
  pub next_attempt_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

impl MutationRecord {
  pub fn target(&self) -> TargetKey {
    TargetKey {
      collection: self.target_collection.clone(),
      id: self.target_id.clone(),
    }
  }
}
