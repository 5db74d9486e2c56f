//! Remote mutation endpoint: wire types, response parsing and the HTTP client.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::queue::{MutationRecord, Operation};

/// One change as the server receives it.
///
/// `(document_id, timestamp)` is the idempotency key the server applies on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
  pub collection_path: String,
  pub document_id: String,
  pub operation: Operation,
  pub payload: Value,
  pub timestamp: i64,
}

impl From<&MutationRecord> for Change {
  fn from(record: &MutationRecord) -> Self {
    Self {
      collection_path: record.target_collection.clone(),
      document_id: record.target_id.clone(),
      operation: record.operation,
      payload: record.payload.clone(),
      timestamp: record.created_at.timestamp_millis(),
    }
  }
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
  changes: &'a [Change],
}

/// Result for a single submitted change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
  Applied,
  /// Terminal: the server will never accept this change as-is
  Rejected(String),
  /// Transient: try again later
  Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
  /// 2xx without per-item detail: every change was applied
  Accepted,
  /// One entry per submitted change, in submission order
  PerItem(Vec<ItemOutcome>),
}

/// Whole-batch failure. Every change in the batch is retried.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
  #[error("transport error: {0}")]
  Transport(String),

  #[error("request timed out")]
  Timeout,

  #[error("HTTP {status}: {body}")]
  Status { status: u16, body: String },

  #[error("malformed response: {0}")]
  Malformed(String),

  #[error("batch declined: {0}")]
  Declined(String),
}

/// Accepts batches of changes and applies each one idempotently.
pub trait MutationEndpoint: Send + Sync {
  fn submit(
    &self,
    changes: &[Change],
  ) -> impl Future<Output = std::result::Result<BatchOutcome, SubmitError>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchResponse {
  #[serde(default)]
  success: Option<bool>,
  #[serde(default)]
  error: Option<String>,
  #[serde(default)]
  results: Option<Vec<ItemResult>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemResult {
  #[serde(default)]
  document_id: Option<String>,
  status: ItemStatus,
  #[serde(default)]
  message: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ItemStatus {
  Applied,
  Rejected,
  Failed,
  /// Not attempted because an earlier change for the same document failed
  Skipped,
}

/// Interpret a 2xx response body for `changes`.
pub(crate) fn parse_response(
  changes: &[Change],
  body: &[u8],
) -> std::result::Result<BatchOutcome, SubmitError> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(BatchOutcome::Accepted);
  }

  let response: BatchResponse =
    serde_json::from_slice(body).map_err(|e| SubmitError::Malformed(e.to_string()))?;

  if response.success == Some(false) {
    return Err(SubmitError::Declined(
      response.error.unwrap_or_else(|| "no reason given".to_string()),
    ));
  }

  let Some(results) = response.results else {
    return Ok(BatchOutcome::Accepted);
  };

  if results.len() != changes.len() {
    return Err(SubmitError::Malformed(format!(
      "expected {} results, got {}",
      changes.len(),
      results.len()
    )));
  }

  let outcomes = results
    .into_iter()
    .zip(changes)
    .map(|(result, change)| {
      if let Some(id) = &result.document_id {
        if id != &change.document_id {
          return Err(SubmitError::Malformed(format!(
            "result for {} does not match change for {}",
            id, change.document_id
          )));
        }
      }
      let message = result.message.unwrap_or_default();
      Ok(match result.status {
        ItemStatus::Applied => ItemOutcome::Applied,
        ItemStatus::Rejected => ItemOutcome::Rejected(message),
        ItemStatus::Failed => ItemOutcome::Failed(message),
        ItemStatus::Skipped => ItemOutcome::Failed(if message.is_empty() {
          "skipped after earlier failure".to_string()
        } else {
          message
        }),
      })
    })
    .collect::<std::result::Result<Vec<_>, _>>()?;

  Ok(BatchOutcome::PerItem(outcomes))
}

/// JSON-over-HTTP mutation endpoint.
pub struct HttpEndpoint {
  client: reqwest::Client,
  url: Url,
  token: Option<String>,
}

impl HttpEndpoint {
  pub fn new(url: Url, timeout: Duration, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build endpoint client: {}", e))?;

    Ok(Self { client, url, token })
  }
}

fn classify(e: reqwest::Error) -> SubmitError {
  if e.is_timeout() {
    SubmitError::Timeout
  } else {
    SubmitError::Transport(e.to_string())
  }
}

impl MutationEndpoint for HttpEndpoint {
  async fn submit(&self, changes: &[Change]) -> std::result::Result<BatchOutcome, SubmitError> {
    debug!(url = %self.url, count = changes.len(), "submitting batch");

    let mut request = self
      .client
      .post(self.url.clone())
      .json(&BatchRequest { changes });
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    let body = response.bytes().await.map_err(classify)?;

    if !status.is_success() {
      return Err(SubmitError::Status {
        status: status.as_u16(),
        body: String::from_utf8_lossy(&body).chars().take(512).collect(),
      });
    }

    parse_response(changes, &body)
  }
}
