//! One reconciliation pass: claim, batch, submit, record outcomes.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::backoff::{RetryDecision, RetryPolicy};
use super::endpoint::{BatchOutcome, Change, ItemOutcome, MutationEndpoint};
use crate::queue::{MutationId, MutationRecord, QueueStore, TargetKey};

/// Tunables for a sync pass.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  /// Changes per request
  pub max_batch_size: usize,
  /// Records claimed per pass
  pub max_claim: usize,
  /// How long Completed records linger before deletion
  pub purge_delay: Duration,
  /// Processing claims older than this are considered abandoned
  pub claim_timeout: Duration,
  pub retry: RetryPolicy,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      max_batch_size: 50,
      max_claim: 500,
      purge_delay: Duration::from_secs(5),
      claim_timeout: Duration::from_secs(300),
      retry: RetryPolicy::default(),
    }
  }
}

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
  /// Another pass held the lock; nothing was done
  pub busy: bool,
  pub claimed: usize,
  pub batches: usize,
  pub completed: usize,
  pub failed: usize,
  pub rejected: usize,
  pub dead_lettered: usize,
  /// Claimed but handed back unsubmitted
  pub released: usize,
  /// Earliest moment a record failed in this pass becomes eligible again
  pub next_retry_at: Option<DateTime<Utc>>,
}

impl PassReport {
  fn busy() -> Self {
    Self {
      busy: true,
      ..Self::default()
    }
  }

  fn note_retry(&mut self, at: DateTime<Utc>) {
    self.next_retry_at = Some(match self.next_retry_at {
      Some(existing) => existing.min(at),
      None => at,
    });
  }
}

/// Drains the outbox into the remote endpoint.
pub struct SyncEngine<E> {
  store: Arc<QueueStore>,
  endpoint: Arc<E>,
  settings: SyncSettings,
  pass_lock: Mutex<()>,
}

impl<E> SyncEngine<E>
where
  E: MutationEndpoint + 'static,
{
  pub fn new(store: Arc<QueueStore>, endpoint: Arc<E>, settings: SyncSettings) -> Self {
    Self {
      store,
      endpoint,
      settings,
      pass_lock: Mutex::new(()),
    }
  }

  #[cfg(test)]
  pub(crate) fn endpoint(&self) -> &E {
    &self.endpoint
  }

  /// When the next backoff expires, across every record in the queue.
  pub fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>> {
    Ok(self.store.next_retry_at()?)
  }

  /// Run one pass. Transport and server failures are recorded on the
  /// records, not returned; an `Err` means the local store itself failed.
  pub async fn run_pass(&self) -> Result<PassReport> {
    let Ok(_guard) = self.pass_lock.try_lock() else {
      debug!("sync pass already running");
      return Ok(PassReport::busy());
    };

    let now = Utc::now();
    let mut report = PassReport::default();

    let purged = self.store.purge_completed(now - chrono_duration(self.settings.purge_delay))?;
    let reclaimed = self
      .store
      .release_stale_claims(now - chrono_duration(self.settings.claim_timeout))?;
    if purged > 0 || reclaimed > 0 {
      debug!(purged, reclaimed, "queue housekeeping");
    }

    let claimed = self.store.claim_eligible(now, self.settings.max_claim)?;
    report.claimed = claimed.len();
    if claimed.is_empty() {
      return Ok(report);
    }
    info!(claimed = claimed.len(), "sync pass starting");

    let mut blocked: HashSet<TargetKey> = HashSet::new();
    let mut completed: Vec<MutationId> = Vec::new();
    let chunks: Vec<&[MutationRecord]> = claimed.chunks(self.settings.max_batch_size.max(1)).collect();

    for (index, chunk) in chunks.iter().enumerate() {
      // A target that failed earlier in this pass must not have later
      // records submitted ahead of the failed one
      let (sendable, held): (Vec<&MutationRecord>, Vec<&MutationRecord>) =
        chunk.iter().partition(|r| !blocked.contains(&r.target()));
      self.release(&held, &mut report)?;
      if sendable.is_empty() {
        continue;
      }

      let changes: Vec<Change> = sendable.iter().map(|r| Change::from(*r)).collect();
      report.batches += 1;

      match self.endpoint.submit(&changes).await {
        Ok(BatchOutcome::Accepted) => {
          completed.extend(sendable.iter().map(|r| r.id));
        }
        Ok(BatchOutcome::PerItem(outcomes)) if outcomes.len() != sendable.len() => {
          let reason = format!(
            "endpoint answered {} results for {} changes",
            outcomes.len(),
            sendable.len()
          );
          warn!(reason = %reason, "batch submission failed");
          for record in &sendable {
            blocked.insert(record.target());
            self.record_failure(record, &reason, now, &mut report)?;
          }
        }
        Ok(BatchOutcome::PerItem(outcomes)) => {
          for (record, outcome) in sendable.iter().zip(outcomes) {
            // Applying a later change while an earlier one is still to be
            // retried would let the retry overwrite it
            let outcome = if blocked.contains(&record.target()) {
              if !matches!(outcome, ItemOutcome::Failed(_)) {
                warn!(id = %record.id, collection = %record.target_collection,
                  document = %record.target_id, "server accepted a change queued behind a failed one");
              }
              ItemOutcome::Failed("an earlier change to this document failed".into())
            } else {
              outcome
            };
            match outcome {
              ItemOutcome::Applied => completed.push(record.id),
              ItemOutcome::Rejected(reason) => {
                warn!(id = %record.id, collection = %record.target_collection,
                  document = %record.target_id, reason = %reason, "change rejected by server");
                self.store.mark_rejected(record.id, &reason)?;
                report.rejected += 1;
              }
              ItemOutcome::Failed(reason) => {
                blocked.insert(record.target());
                self.record_failure(record, &reason, now, &mut report)?;
              }
            }
          }
        }
        Err(e) => {
          warn!(error = %e, batch = changes.len(), "batch submission failed");
          let reason = e.to_string();
          for record in &sendable {
            self.record_failure(record, &reason, now, &mut report)?;
          }

          // The endpoint is unreachable or unhappy; leave the rest for later
          let rest: Vec<&MutationRecord> = chunks[index + 1..].iter().flat_map(|c| c.iter()).collect();
          self.release(&rest, &mut report)?;
          break;
        }
      }
    }

    if !completed.is_empty() {
      self.store.mark_completed(&completed, Utc::now())?;
      report.completed = completed.len();
      self.schedule_purge(completed);
    }

    Ok(report)
  }

  fn record_failure(
    &self,
    record: &MutationRecord,
    reason: &str,
    now: DateTime<Utc>,
    report: &mut PassReport,
  ) -> Result<()> {
    let attempt = record.retry_count + 1;
    match self.settings.retry.decide(attempt, now) {
      RetryDecision::RetryAt(at) => {
        self.store.mark_failed(record.id, attempt, at, reason)?;
        report.failed += 1;
        report.note_retry(at);
      }
      RetryDecision::DeadLetter => {
        error!(id = %record.id, attempts = attempt, reason = %reason,
          "change dead-lettered after exhausting retries");
        self.store.mark_dead_letter(record.id, attempt, reason)?;
        report.dead_lettered += 1;
      }
    }
    Ok(())
  }

  fn release(&self, records: &[&MutationRecord], report: &mut PassReport) -> Result<()> {
    if records.is_empty() {
      return Ok(());
    }
    let ids: Vec<MutationId> = records.iter().map(|r| r.id).collect();
    self.store.release(&ids)?;
    report.released += ids.len();
    Ok(())
  }

  /// Delete acknowledged records once the grace delay has passed.
  fn schedule_purge(&self, ids: Vec<MutationId>) {
    let store = Arc::clone(&self.store);
    let delay = self.settings.purge_delay;
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      match store.delete_completed(&ids) {
        Ok(removed) => debug!(removed, "purged completed changes"),
        Err(e) => warn!(error = %e, "failed to purge completed changes"),
      }
    });
  }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
  chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
