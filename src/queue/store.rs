//! SQLite implementation of the persistent queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{MutationId, MutationRecord, MutationStatus, NewMutation, Operation, TargetKey};
use crate::db::{schema, Database, StoreError};

const COLUMNS: &str = "id, created_at, operation, target_collection, target_id, payload, \
                       status, retry_count, next_attempt_at, last_error";

/// Record counts per status, for the "N changes waiting" indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
  pub pending: u64,
  pub processing: u64,
  pub completed: u64,
  pub failed: u64,
  pub rejected: u64,
  pub dead_letter: u64,
}

impl QueueSummary {
  /// Changes that are still on their way to the server.
  pub fn waiting(&self) -> u64 {
    self.pending + self.processing + self.failed
  }

  /// Changes the server will never accept without user action.
  pub fn needs_attention(&self) -> u64 {
    self.rejected + self.dead_letter
  }
}

/// Durable outbox. Single source of truth for every queued mutation.
///
/// Only one process should open a given file: claims are atomic per
/// transaction, but there is no cross-process lease around a sync pass.
pub struct QueueStore {
  conn: Mutex<Connection>,
}

impl QueueStore {
  /// Open (or create) the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    let db = Database::open(path, schema::QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(db.into_connection()),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::Poisoned)
  }

  /// Persist a new Pending record and return its id.
  pub fn append(&self, mutation: &NewMutation) -> Result<MutationId, StoreError> {
    self.append_at(mutation, Utc::now())
  }

  /// `created_at` is kept strictly increasing so it can serve as the
  /// idempotency timestamp even for bursts within one millisecond.
  pub(crate) fn append_at(
    &self,
    mutation: &NewMutation,
    now: DateTime<Utc>,
  ) -> Result<MutationId, StoreError> {
    let mut conn = self.lock()?;
    let payload = serde_json::to_vec(&mutation.payload)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let last: Option<i64> = tx.query_row("SELECT MAX(created_at) FROM mutations", [], |row| {
      row.get(0)
    })?;
    let created_at = match last {
      Some(last) => now.timestamp_millis().max(last + 1),
      None => now.timestamp_millis(),
    };

    tx.execute(
      "INSERT INTO mutations (created_at, operation, target_collection, target_id, payload, status)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      params![
        created_at,
        mutation.operation.as_str(),
        mutation.target_collection,
        mutation.target_id,
        payload,
        MutationStatus::Pending.as_str(),
      ],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    Ok(MutationId(id))
  }

  pub fn get(&self, id: MutationId) -> Result<Option<MutationRecord>, StoreError> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM mutations WHERE id = ?1", COLUMNS),
        params![id.0],
        RawRecord::from_row,
      )
      .optional()?;

    raw.map(RawRecord::into_record).transpose()
  }

  /// Records in the given status, oldest first.
  pub fn list_by_status(&self, status: MutationStatus) -> Result<Vec<MutationRecord>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM mutations WHERE status = ?1 ORDER BY id",
      COLUMNS
    ))?;

    let rows = stmt
      .query_map(params![status.as_str()], RawRecord::from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(RawRecord::into_record).collect()
  }

  /// Set the status of a single record.
  pub fn update_status(&self, id: MutationId, status: MutationStatus) -> Result<(), StoreError> {
    let conn = self.lock()?;
    let changed = conn.execute(
      "UPDATE mutations SET status = ?1 WHERE id = ?2",
      params![status.as_str(), id.0],
    )?;
    if changed == 0 {
      return Err(StoreError::NotFound(id.0));
    }
    Ok(())
  }

  /// Returns whether a record was removed.
  pub fn delete(&self, id: MutationId) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    let changed = conn.execute("DELETE FROM mutations WHERE id = ?1", params![id.0])?;
    Ok(changed > 0)
  }

  /// Select the records a sync pass may submit and mark them Processing in
  /// the same transaction.
  ///
  /// Records are walked per target in creation order. The first record of a
  /// target that cannot go now (still in backoff, or claimed by someone else)
  /// fences every later record of that target, so per-document order holds.
  pub fn claim_eligible(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<MutationRecord>, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let candidates = {
      let mut stmt = tx.prepare(&format!(
        "SELECT {} FROM mutations
         WHERE status IN ('pending', 'failed', 'processing')
         ORDER BY target_collection, target_id, id",
        COLUMNS
      ))?;
      let rows = stmt
        .query_map([], RawRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      rows
        .into_iter()
        .map(RawRecord::into_record)
        .collect::<Result<Vec<_>, _>>()?
    };

    let mut claimed = Vec::new();
    let mut fenced: Option<TargetKey> = None;

    for mut record in candidates {
      if claimed.len() >= limit {
        break;
      }

      let target = record.target();
      if fenced.as_ref() == Some(&target) {
        continue;
      }

      let eligible = match record.status {
        MutationStatus::Pending => true,
        MutationStatus::Failed => record.next_attempt_at.map_or(true, |at| at <= now),
        _ => false,
      };
      if !eligible {
        fenced = Some(target);
        continue;
      }

      tx.execute(
        "UPDATE mutations SET status = 'processing', claimed_at = ?1 WHERE id = ?2",
        params![now.timestamp_millis(), record.id.0],
      )?;
      record.status = MutationStatus::Processing;
      claimed.push(record);
    }

    tx.commit()?;
    Ok(claimed)
  }

  /// Earliest backoff deadline among Failed records that head their target.
  ///
  /// A Failed record queued behind another failure of the same target is not
  /// counted: it cannot go before the head does.
  pub fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
    let conn = self.lock()?;
    let earliest: Option<i64> = conn.query_row(
      "SELECT MIN(m.next_attempt_at) FROM mutations m
       WHERE m.status = 'failed'
         AND m.id = (SELECT MIN(h.id) FROM mutations h
                     WHERE h.target_collection = m.target_collection
                       AND h.target_id = m.target_id
                       AND h.status IN ('pending', 'failed', 'processing'))",
      [],
      |row| row.get(0),
    )?;
    Ok(earliest.and_then(from_millis))
  }

  pub fn mark_completed(&self, ids: &[MutationId], now: DateTime<Utc>) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for id in ids {
      tx.execute(
        "UPDATE mutations
         SET status = 'completed', completed_at = ?1, claimed_at = NULL, last_error = NULL
         WHERE id = ?2",
        params![now.timestamp_millis(), id.0],
      )?;
    }
    tx.commit()?;
    Ok(())
  }

  /// Record a transient failure; the record becomes eligible at `next_attempt_at`.
  pub fn mark_failed(
    &self,
    id: MutationId,
    retry_count: u32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
  ) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE mutations
       SET status = 'failed', retry_count = ?1, next_attempt_at = ?2, claimed_at = NULL,
           last_error = ?3
       WHERE id = ?4",
      params![retry_count, next_attempt_at.timestamp_millis(), error, id.0],
    )?;
    Ok(())
  }

  pub fn mark_rejected(&self, id: MutationId, reason: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE mutations
       SET status = 'rejected', claimed_at = NULL, next_attempt_at = NULL, last_error = ?1
       WHERE id = ?2",
      params![reason, id.0],
    )?;
    Ok(())
  }

  pub fn mark_dead_letter(
    &self,
    id: MutationId,
    retry_count: u32,
    error: &str,
  ) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE mutations
       SET status = 'dead_letter', retry_count = ?1, claimed_at = NULL, next_attempt_at = NULL,
           last_error = ?2
       WHERE id = ?3",
      params![retry_count, error, id.0],
    )?;
    Ok(())
  }

  /// Hand claimed-but-unsubmitted records back without spending an attempt.
  pub fn release(&self, ids: &[MutationId]) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for id in ids {
      tx.execute(
        &format!("{} AND id = ?1", RELEASE_SQL),
        params![id.0],
      )?;
    }
    tx.commit()?;
    Ok(())
  }

  /// Reset every Processing record left behind by a previous process.
  ///
  /// Their outcome is unknown; they are simply submitted again and the
  /// server's idempotent apply absorbs the duplicate.
  pub fn recover_interrupted(&self) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    Ok(conn.execute(RELEASE_SQL, [])?)
  }

  /// Reset Processing records claimed before `older_than`.
  pub fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    Ok(conn.execute(
      &format!("{} AND claimed_at < ?1", RELEASE_SQL),
      params![older_than.timestamp_millis()],
    )?)
  }

  /// Delete Completed records acknowledged before `older_than`.
  pub fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
    let conn = self.lock()?;
    Ok(conn.execute(
      "DELETE FROM mutations WHERE status = 'completed' AND completed_at < ?1",
      params![older_than.timestamp_millis()],
    )?)
  }

  /// Delete the given records if (and only if) they are still Completed.
  pub fn delete_completed(&self, ids: &[MutationId]) -> Result<usize, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let mut removed = 0;
    for id in ids {
      removed += tx.execute(
        "DELETE FROM mutations WHERE id = ?1 AND status = 'completed'",
        params![id.0],
      )?;
    }
    tx.commit()?;
    Ok(removed)
  }

  /// Move a Rejected or DeadLetter record back into the retry cycle with a
  /// fresh budget.
  pub fn requeue(&self, id: MutationId) -> Result<(), StoreError> {
    let conn = self.lock()?;
    let changed = conn.execute(
      "UPDATE mutations
       SET status = 'pending', retry_count = 0, next_attempt_at = NULL, last_error = NULL
       WHERE id = ?1 AND status IN ('rejected', 'dead_letter')",
      params![id.0],
    )?;
    if changed == 0 {
      return Err(StoreError::NotFound(id.0));
    }
    Ok(())
  }

  pub fn summary(&self) -> Result<QueueSummary, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM mutations GROUP BY status")?;
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut summary = QueueSummary::default();
    for (status, count) in rows {
      let count = count.max(0) as u64;
      match status.parse::<MutationStatus>() {
        Ok(MutationStatus::Pending) => summary.pending = count,
        Ok(MutationStatus::Processing) => summary.processing = count,
        Ok(MutationStatus::Completed) => summary.completed = count,
        Ok(MutationStatus::Failed) => summary.failed = count,
        Ok(MutationStatus::Rejected) => summary.rejected = count,
        Ok(MutationStatus::DeadLetter) => summary.dead_letter = count,
        Err(_) => {}
      }
    }
    Ok(summary)
  }

  #[cfg(test)]
  pub(crate) fn set_read_only(&self) {
    self
      .lock()
      .unwrap()
      .execute_batch("PRAGMA query_only = ON;")
      .unwrap();
  }
}

const RELEASE_SQL: &str = "UPDATE mutations
   SET status = CASE WHEN retry_count > 0 THEN 'failed' ELSE 'pending' END, claimed_at = NULL
   WHERE status = 'processing'";

/// Column values as stored, before validation.
struct RawRecord {
  id: i64,
  created_at: i64,
  operation: String,
  target_collection: String,
  target_id: String,
  payload: Vec<u8>,
  status: String,
  retry_count: i64,
  next_attempt_at: Option<i64>,
  last_error: Option<String>,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      created_at: row.get(1)?,
      operation: row.get(2)?,
      target_collection: row.get(3)?,
      target_id: row.get(4)?,
      payload: row.get(5)?,
      status: row.get(6)?,
      retry_count: row.get(7)?,
      next_attempt_at: row.get(8)?,
      last_error: row.get(9)?,
    })
  }

  fn into_record(self) -> Result<MutationRecord, StoreError> {
    let id = self.id;
    let corrupt = |reason: String| StoreError::Corrupt { id, reason };

    let operation: Operation = self.operation.parse().map_err(corrupt)?;
    let status: MutationStatus = self.status.parse().map_err(corrupt)?;
    let payload = serde_json::from_slice(&self.payload)
      .map_err(|e| corrupt(format!("payload is not JSON: {}", e)))?;
    let created_at = from_millis(self.created_at).ok_or_else(|| corrupt("bad created_at".into()))?;
    let next_attempt_at = match self.next_attempt_at {
      Some(ms) => Some(from_millis(ms).ok_or_else(|| corrupt("bad next_attempt_at".into()))?),
      None => None,
    };

    Ok(MutationRecord {
      id: MutationId(self.id),
      created_at,
      operation,
      target_collection: self.target_collection,
      target_id: self.target_id,
      payload,
      status,
      retry_count: u32::try_from(self.retry_count).unwrap_or(0),
      next_attempt_at,
      last_error: self.last_error,
    })
  }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms)
}
