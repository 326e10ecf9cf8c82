//! Durable FIFO of pending writes and the drain pass that delivers them.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use super::mutation::{deliverable_statuses, MutationStatus, QueuedMutation, COLUMNS};
use crate::clock::{SharedClock, SystemClock};
use crate::db::{Database, StorageMode};
use crate::error::{Result, SyncError};
use crate::sender::{FailureScope, MutationSender, SendOutcome};

/// Default bound on a single sender call.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: usize,
  /// Recoverable failures that will be retried
  pub failed: usize,
  pub dead_lettered: usize,
  /// Mutations still waiting out their backoff
  pub skipped_backoff: usize,
  /// The pass stopped early because the channel went down
  pub aborted: bool,
}

impl DrainReport {
  pub fn attempted(&self) -> usize {
    self.delivered + self.failed + self.dead_lettered
  }
}

/// Persistent, ordered queue of writes awaiting delivery.
#[derive(Clone)]
pub struct MutationQueue {
  db: Database,
  clock: SharedClock,
  policy: RetryPolicy,
  send_timeout: Duration,
  drain_lock: Arc<Mutex<()>>,
}

impl MutationQueue {
  pub fn new(db: Database, policy: RetryPolicy) -> Self {
    Self {
      db,
      clock: Arc::new(SystemClock),
      policy,
      send_timeout: DEFAULT_SEND_TIMEOUT,
      drain_lock: Arc::new(Mutex::new(())),
    }
  }

  pub fn with_clock(mut self, clock: SharedClock) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
    self.send_timeout = timeout;
    self
  }

  /// Open the store and recover anything a crashed process left mid-delivery.
  pub async fn init(&self) -> Result<StorageMode> {
    let mode = self.db.init().await?;
    let recovered = self.recover_in_flight().await?;
    if recovered > 0 {
      warn!(recovered, "Recovered mutations interrupted mid-delivery");
    }
    Ok(mode)
  }

  /// Return `in_flight` rows to `pending`. Only valid when no drain is running.
  ///
  /// They keep their attempt count; the idempotency key covers the case where
  /// the interrupted delivery actually reached the remote.
  pub async fn recover_in_flight(&self) -> Result<usize> {
    let _guard = self
      .drain_lock
      .try_lock()
      .map_err(|_| SyncError::DrainInProgress)?;
    self.db.with_conn(|conn| {
      Ok(conn.execute(
        "UPDATE mutation_queue SET status = 'pending' WHERE status = 'in_flight'",
        [],
      )?)
    })
  }

  /// Append a mutation at the tail. Durable once this returns.
  pub async fn enqueue<T: Serialize + ?Sized>(&self, op_type: &str, payload: &T) -> Result<QueuedMutation> {
    let payload = serde_json::to_value(payload)?;
    let data = serde_json::to_vec(&payload)?;
    let created_at_ms = self.clock.now().timestamp_millis();

    let id = self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      tx.execute(
        "INSERT INTO mutation_queue (op_type, payload, status, attempts, created_at_ms)
         VALUES (?, ?, 'pending', 0, ?)",
        params![op_type, data, created_at_ms],
      )?;
      let id = tx.last_insert_rowid();
      tx.execute(
        "UPDATE mutation_queue SET idempotency_key = ? WHERE id = ?",
        params![idempotency_key(id, op_type, created_at_ms, &data), id],
      )?;
      tx.commit()?;
      Ok(id)
    })?;

    debug!(id, op_type, "Enqueued mutation");
    self.get(id).await?.ok_or(SyncError::NotFound(id))
  }

  pub async fn get(&self, id: i64) -> Result<Option<QueuedMutation>> {
    self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            &format!("SELECT {} FROM mutation_queue WHERE id = ?", COLUMNS),
            params![id],
            QueuedMutation::from_row,
          )
          .optional()?,
      )
    })
  }

  /// Mutations not yet delivered or given up on, in delivery order.
  pub async fn pending(&self) -> Result<Vec<QueuedMutation>> {
    self.select_where("status != 'dead_letter'", None)
  }

  pub async fn pending_count(&self) -> Result<usize> {
    self.count_where("status != 'dead_letter'")
  }

  /// Mutations that ran out of attempts or were rejected outright.
  pub async fn dead_letters(&self) -> Result<Vec<QueuedMutation>> {
    self.select_where("status = 'dead_letter'", None)
  }

  pub async fn dead_letter_count(&self) -> Result<usize> {
    self.count_where("status = 'dead_letter'")
  }

  /// Give a dead-lettered mutation a fresh retry budget. It keeps its place in line.
  pub async fn retry_dead_letter(&self, id: i64) -> Result<QueuedMutation> {
    let updated = self.db.with_conn(|conn| {
      Ok(conn.execute(
        "UPDATE mutation_queue
         SET status = 'pending', attempts = 0, last_attempt_at_ms = NULL, last_error = NULL
         WHERE id = ? AND status = 'dead_letter'",
        params![id],
      )?)
    })?;
    if updated == 0 {
      return Err(SyncError::NotFound(id));
    }
    info!(id, "Dead letter requeued");
    self.get(id).await?.ok_or(SyncError::NotFound(id))
  }

  /// Explicitly discard every dead letter, returning how many were removed.
  pub async fn clear_dead_letters(&self) -> Result<usize> {
    let removed = self.db.with_conn(|conn| {
      Ok(conn.execute("DELETE FROM mutation_queue WHERE status = 'dead_letter'", [])?)
    })?;
    if removed > 0 {
      info!(removed, "Cleared dead letters");
    }
    Ok(removed)
  }

  /// Deliver every eligible mutation, oldest first.
  ///
  /// Only mutations that existed when the pass started are considered; later
  /// ones wait for the next pass. A channel-wide failure ends the pass early.
  /// Fails with [`SyncError::DrainInProgress`] if another pass is running.
  pub async fn drain<S: MutationSender + ?Sized>(&self, sender: &S) -> Result<DrainReport> {
    let _guard = self
      .drain_lock
      .try_lock()
      .map_err(|_| SyncError::DrainInProgress)?;

    let mut report = DrainReport::default();
    let Some(high_water) = self.high_water_mark()? else {
      return Ok(report);
    };
    let batch = self.select_where(
      &format!("status IN ({}) AND id <= ?", deliverable_statuses()),
      Some(high_water),
    )?;

    for mutation in batch {
      if !self.policy.is_eligible(&mutation, self.clock.now()) {
        report.skipped_backoff += 1;
        continue;
      }

      let id = mutation.id;
      match self.attempt(sender, mutation, &mut report).await {
        Ok(FlowControl::Continue) => {}
        Ok(FlowControl::Stop) => {
          report.aborted = true;
          break;
        }
        Err(e) => {
          error!(id, error = %e, "Failed to record delivery result");
          self.release(id);
          return Err(e);
        }
      }
    }

    if report.attempted() > 0 {
      info!(
        delivered = report.delivered,
        failed = report.failed,
        dead_lettered = report.dead_lettered,
        skipped = report.skipped_backoff,
        aborted = report.aborted,
        "Drain pass finished"
      );
    } else {
      debug!(skipped = report.skipped_backoff, "Drain pass found nothing to send");
    }
    Ok(report)
  }

  /// One delivery attempt, with its result written back.
  async fn attempt<S: MutationSender + ?Sized>(
    &self,
    sender: &S,
    mut mutation: QueuedMutation,
    report: &mut DrainReport,
  ) -> Result<FlowControl> {
    if !self.mark_in_flight(mutation.id)? {
      // Removed or requeued since the batch was read.
      return Ok(FlowControl::Continue);
    }
    mutation.status = MutationStatus::InFlight;

    let outcome = match tokio::time::timeout(self.send_timeout, sender.send(&mutation)).await {
      Ok(outcome) => outcome,
      Err(_) => SendOutcome::from(SyncError::Timeout(self.send_timeout.as_millis() as u64)),
    };

    let id = mutation.id;
    let attempts = mutation.attempts.saturating_add(1);
    match outcome {
      SendOutcome::Delivered => {
        self.db.with_conn(|conn| {
          conn.execute("DELETE FROM mutation_queue WHERE id = ?", params![id])?;
          Ok(())
        })?;
        debug!(id, op_type = %mutation.op_type, "Delivered mutation");
        report.delivered += 1;
        Ok(FlowControl::Continue)
      }
      SendOutcome::Recoverable { scope, reason } => {
        let status = if self.policy.is_exhausted(attempts) {
          MutationStatus::DeadLetter
        } else {
          MutationStatus::FailedRetryable
        };
        self.record_failure(id, status, attempts, &reason)?;

        if status == MutationStatus::DeadLetter {
          warn!(id, attempts, reason = %reason, "Mutation exhausted its retries");
          report.dead_lettered += 1;
        } else {
          debug!(id, attempts, reason = %reason, "Delivery failed, will retry");
          report.failed += 1;
        }

        Ok(match scope {
          FailureScope::Channel => FlowControl::Stop,
          FailureScope::Mutation => FlowControl::Continue,
        })
      }
      SendOutcome::Permanent { reason } => {
        self.record_failure(id, MutationStatus::DeadLetter, attempts, &reason)?;
        warn!(id, reason = %reason, "Mutation rejected by remote");
        report.dead_lettered += 1;
        Ok(FlowControl::Continue)
      }
    }
  }

  fn mark_in_flight(&self, id: i64) -> Result<bool> {
    self.db.with_conn(|conn| {
      let updated = conn.execute(
        &format!(
          "UPDATE mutation_queue SET status = 'in_flight' WHERE id = ? AND status IN ({})",
          deliverable_statuses()
        ),
        params![id],
      )?;
      Ok(updated == 1)
    })
  }

  fn record_failure(&self, id: i64, status: MutationStatus, attempts: u32, reason: &str) -> Result<()> {
    let now_ms = self.clock.now().timestamp_millis();
    self.db.with_conn(|conn| {
      conn.execute(
        "UPDATE mutation_queue
         SET status = ?, attempts = ?, last_attempt_at_ms = ?, last_error = ?
         WHERE id = ?",
        params![status.as_str(), attempts, now_ms, reason, id],
      )?;
      Ok(())
    })
  }

  /// Best effort: put a mutation stuck `in_flight` back in line.
  fn release(&self, id: i64) {
    let result = self.db.with_conn(|conn| {
      conn.execute(
        "UPDATE mutation_queue SET status = 'pending' WHERE id = ? AND status = 'in_flight'",
        params![id],
      )?;
      Ok(())
    });
    if let Err(e) = result {
      error!(id, error = %e, "Could not release in-flight mutation; it is recovered on next start");
    }
  }

  fn high_water_mark(&self) -> Result<Option<i64>> {
    self.db.with_conn(|conn| {
      Ok(conn.query_row("SELECT MAX(id) FROM mutation_queue", [], |row| row.get(0))?)
    })
  }

  /// Rows matching `filter`, oldest first.
  ///
  /// A row whose payload or status no longer decodes is dead-lettered and left
  /// out, so it cannot stall every row behind it.
  fn select_where(&self, filter: &str, max_id: Option<i64>) -> Result<Vec<QueuedMutation>> {
    self.db.with_conn(|conn| {
      let decoded = {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM mutation_queue WHERE {} ORDER BY id",
          COLUMNS, filter
        ))?;
        match max_id {
          Some(max_id) => stmt
            .query_map(params![max_id], decode_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
          None => stmt.query_map([], decode_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
        }
      };

      let mut rows = Vec::with_capacity(decoded.len());
      for (id, mutation) in decoded {
        match mutation {
          Ok(mutation) => rows.push(mutation),
          Err(e) => {
            let reason = format!("Undecodable row: {}", e);
            let updated = conn.execute(
              "UPDATE mutation_queue SET status = 'dead_letter', last_error = ?
               WHERE id = ? AND status != 'dead_letter'",
              params![reason, id],
            )?;
            if updated > 0 {
              warn!(id, error = %e, "Dead-lettered mutation that could not be decoded");
            }
          }
        }
      }
      Ok(rows)
    })
  }

  fn count_where(&self, filter: &str) -> Result<usize> {
    self.db.with_conn(|conn| {
      let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM mutation_queue WHERE {}", filter),
        [],
        |row| row.get(0),
      )?;
      Ok(count as usize)
    })
  }
}

/// Keeps the id even when the rest of the row fails to decode.
fn decode_row(row: &Row<'_>) -> rusqlite::Result<(i64, rusqlite::Result<QueuedMutation>)> {
  Ok((row.get(0)?, QueuedMutation::from_row(row)))
}

enum FlowControl {
  Continue,
  Stop,
}

/// SHA256 over the identity of a mutation, stable for its whole life.
fn idempotency_key(id: i64, op_type: &str, created_at_ms: i64, payload: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(id.to_be_bytes());
  hasher.update(op_type.as_bytes());
  hasher.update(created_at_ms.to_be_bytes());
  hasher.update(payload);
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use chrono::Duration as ChronoDuration;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex as StdMutex;

  async fn queue(max_attempts: u32, base_backoff_ms: u64) -> (MutationQueue, ManualClock) {
    let clock = ManualClock::default();
    let policy = RetryPolicy {
      max_attempts,
      base_backoff: Duration::from_millis(base_backoff_ms),
      backoff_cap: Duration::from_secs(60),
    };
    let queue = MutationQueue::new(Database::in_memory(), policy).with_clock(Arc::new(clock.clone()));
    queue.init().await.unwrap();
    (queue, clock)
  }

  /// Sender that records op types and answers with a fixed outcome.
  fn recording(outcome: SendOutcome) -> (impl MutationSender, Arc<StdMutex<Vec<String>>>) {
    let sent = Arc::new(StdMutex::new(Vec::new()));
    let log = sent.clone();
    let sender = move |m: QueuedMutation| {
      let log = log.clone();
      let outcome = outcome.clone();
      async move {
        log.lock().unwrap().push(m.op_type.clone());
        outcome
      }
    };
    (sender, sent)
  }

  #[tokio::test]
  async fn test_enqueue_assigns_increasing_ids() {
    let (queue, _) = queue(3, 100).await;
    let a = queue.enqueue("create", &json!({"n": 1})).await.unwrap();
    let b = queue.enqueue("update", &json!({"n": 2})).await.unwrap();

    assert!(b.id > a.id);
    assert_eq!(a.status, MutationStatus::Pending);
    assert_eq!(a.attempts, 0);
    assert_eq!(a.idempotency_key.len(), 64);
    assert_ne!(a.idempotency_key, b.idempotency_key);
    assert_eq!(queue.pending_count().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_drain_delivers_in_order_and_empties_queue() {
    let (queue, _) = queue(3, 100).await;
    for op in ["M1", "M2", "M3"] {
      queue.enqueue(op, &json!({})).await.unwrap();
    }

    let (sender, sent) = recording(SendOutcome::Delivered);
    let report = queue.drain(&sender).await.unwrap();

    assert_eq!(*sent.lock().unwrap(), vec!["M1", "M2", "M3"]);
    assert_eq!(report.delivered, 3);
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    assert!(queue.dead_letters().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_always_failing_sender_dead_letters_after_max_attempts() {
    let (queue, clock) = queue(3, 100).await;
    let m1 = queue.enqueue("M1", &json!({})).await.unwrap();
    let (sender, sent) = recording(SendOutcome::channel_down("offline"));

    // Plenty of passes, each after the backoff has elapsed.
    for _ in 0..10 {
      queue.drain(&sender).await.unwrap();
      clock.advance(ChronoDuration::seconds(60));
    }

    assert_eq!(sent.lock().unwrap().len(), 3);
    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, m1.id);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].last_error.as_deref(), Some("offline"));
  }

  #[tokio::test]
  async fn test_backoff_schedule() {
    let (queue, clock) = queue(3, 100).await;
    let m1 = queue.enqueue("M1", &json!({})).await.unwrap();
    let (sender, sent) = recording(SendOutcome::channel_down("offline"));

    // t=0: first attempt
    queue.drain(&sender).await.unwrap();
    assert_eq!(sent.lock().unwrap().len(), 1);

    // t=99: still backing off
    clock.advance(ChronoDuration::milliseconds(99));
    let report = queue.drain(&sender).await.unwrap();
    assert_eq!(report.skipped_backoff, 1);
    assert_eq!(sent.lock().unwrap().len(), 1);

    // t=100: second attempt
    clock.advance(ChronoDuration::milliseconds(1));
    queue.drain(&sender).await.unwrap();
    assert_eq!(sent.lock().unwrap().len(), 2);

    // t=299: waiting another 200ms
    clock.advance(ChronoDuration::milliseconds(199));
    queue.drain(&sender).await.unwrap();
    assert_eq!(sent.lock().unwrap().len(), 2);

    // t=300: third and final attempt
    clock.advance(ChronoDuration::milliseconds(1));
    let report = queue.drain(&sender).await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    let m1 = queue.get(m1.id).await.unwrap().unwrap();
    assert_eq!(m1.status, MutationStatus::DeadLetter);
    assert_eq!(m1.attempts, 3);
  }

  #[tokio::test]
  async fn test_channel_failure_abandons_rest_of_pass() {
    let (queue, _) = queue(5, 100).await;
    for op in ["M1", "M2", "M3"] {
      queue.enqueue(op, &json!({})).await.unwrap();
    }
    let (sender, sent) = recording(SendOutcome::channel_down("offline"));

    let report = queue.drain(&sender).await.unwrap();
    assert!(report.aborted);
    assert_eq!(*sent.lock().unwrap(), vec!["M1"]);

    let pending = queue.pending().await.unwrap();
    assert_eq!(pending[0].status, MutationStatus::FailedRetryable);
    assert_eq!(pending[1].status, MutationStatus::Pending);
    assert_eq!(pending[2].attempts, 0);
  }

  #[tokio::test]
  async fn test_mutation_failure_continues_with_siblings() {
    let (queue, _) = queue(5, 100).await;
    for op in ["bad", "good", "also-good"] {
      queue.enqueue(op, &json!({})).await.unwrap();
    }
    let sender = |m: QueuedMutation| async move {
      if m.op_type == "bad" {
        SendOutcome::retry_later("500")
      } else {
        SendOutcome::Delivered
      }
    };

    let report = queue.drain(&sender).await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert!(!report.aborted);

    let left = queue.pending().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].op_type, "bad");
    assert_eq!(left[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_failing_head_does_not_block_later_passes() {
    let (queue, clock) = queue(5, 100).await;
    queue.enqueue("stuck", &json!({})).await.unwrap();
    let (sender, _) = recording(SendOutcome::channel_down("offline"));
    queue.drain(&sender).await.unwrap();

    queue.enqueue("later", &json!({})).await.unwrap();
    clock.advance(ChronoDuration::milliseconds(10));

    // "stuck" is still backing off, so "later" goes out.
    let (sender, sent) = recording(SendOutcome::Delivered);
    let report = queue.drain(&sender).await.unwrap();
    assert_eq!(report.skipped_backoff, 1);
    assert_eq!(*sent.lock().unwrap(), vec!["later"]);
  }

  #[tokio::test]
  async fn test_permanent_failure_dead_letters_immediately() {
    let (queue, _) = queue(5, 100).await;
    queue.enqueue("stale-update", &json!({"version": 1})).await.unwrap();
    queue.enqueue("fine", &json!({})).await.unwrap();
    let sender = |m: QueuedMutation| async move {
      if m.op_type == "stale-update" {
        SendOutcome::rejected("Conflict: version 1 is stale")
      } else {
        SendOutcome::Delivered
      }
    };

    let report = queue.drain(&sender).await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.delivered, 1);

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead[0].op_type, "stale-update");
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].payload, json!({"version": 1}));
  }

  #[tokio::test]
  async fn test_enqueued_during_drain_waits_for_next_pass() {
    let (queue, _) = queue(3, 100).await;
    queue.enqueue("first", &json!({})).await.unwrap();

    let inner = queue.clone();
    let sent = Arc::new(StdMutex::new(Vec::new()));
    let log = sent.clone();
    let sender = move |m: QueuedMutation| {
      let inner = inner.clone();
      let log = log.clone();
      async move {
        if m.op_type == "first" {
          inner.enqueue("second", &json!({})).await.unwrap();
        }
        log.lock().unwrap().push(m.op_type);
        SendOutcome::Delivered
      }
    };

    queue.drain(&sender).await.unwrap();
    assert_eq!(*sent.lock().unwrap(), vec!["first"]);
    assert_eq!(queue.pending_count().await.unwrap(), 1);

    queue.drain(&sender).await.unwrap();
    assert_eq!(*sent.lock().unwrap(), vec!["first", "second"]);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_refused() {
    let (queue, _) = queue(3, 100).await;
    queue.enqueue("M1", &json!({})).await.unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let (a, c) = (active.clone(), calls.clone());
    let sender = move |_m: QueuedMutation| {
      let (a, c) = (a.clone(), c.clone());
      async move {
        assert_eq!(a.fetch_add(1, Ordering::SeqCst), 0, "concurrent send");
        c.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.fetch_sub(1, Ordering::SeqCst);
        SendOutcome::Delivered
      }
    };

    let (first, second) = tokio::join!(queue.drain(&sender), queue.drain(&sender));
    assert_eq!(first.unwrap().delivered, 1);
    assert!(matches!(second, Err(SyncError::DrainInProgress)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_send_timeout_is_channel_failure() {
    let (queue, _) = queue(3, 100).await;
    let queue = queue.with_send_timeout(Duration::from_millis(50));
    queue.enqueue("slow", &json!({})).await.unwrap();
    queue.enqueue("never-tried", &json!({})).await.unwrap();

    let sender = |_m: QueuedMutation| async {
      tokio::time::sleep(Duration::from_secs(30)).await;
      SendOutcome::Delivered
    };

    let report = queue.drain(&sender).await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.failed, 1);

    let pending = queue.pending().await.unwrap();
    assert_eq!(pending[0].status, MutationStatus::FailedRetryable);
    assert_eq!(pending[0].last_error.as_deref(), Some("Timed out after 50ms"));
    assert_eq!(pending[1].status, MutationStatus::Pending);
  }

  #[tokio::test]
  async fn test_in_flight_rows_recovered_on_init() {
    let db = Database::in_memory();
    let queue = MutationQueue::new(db.clone(), RetryPolicy::default());
    queue.init().await.unwrap();
    let m = queue.enqueue("interrupted", &json!({})).await.unwrap();
    assert!(queue.mark_in_flight(m.id).unwrap());

    // A fresh queue over the same store, as after a restart.
    let restarted = MutationQueue::new(db, RetryPolicy::default());
    restarted.init().await.unwrap();
    let m = restarted.get(m.id).await.unwrap().unwrap();
    assert_eq!(m.status, MutationStatus::Pending);
    assert_eq!(m.attempts, 0);
  }

  #[tokio::test]
  async fn test_retry_and_clear_dead_letters() {
    let (queue, _) = queue(1, 100).await;
    let a = queue.enqueue("a", &json!({})).await.unwrap();
    queue.enqueue("b", &json!({})).await.unwrap();
    let (sender, _) = recording(SendOutcome::retry_later("nope"));
    queue.drain(&sender).await.unwrap();
    assert_eq!(queue.dead_letter_count().await.unwrap(), 2);

    let requeued = queue.retry_dead_letter(a.id).await.unwrap();
    assert_eq!(requeued.status, MutationStatus::Pending);
    assert_eq!(requeued.attempts, 0);
    assert!(matches!(
      queue.retry_dead_letter(a.id).await,
      Err(SyncError::NotFound(_))
    ));

    assert_eq!(queue.clear_dead_letters().await.unwrap(), 1);
    assert_eq!(queue.dead_letter_count().await.unwrap(), 0);
    assert_eq!(queue.pending_count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_undecodable_rows_are_dead_lettered_and_skipped() {
    let (queue, _) = queue(3, 100).await;
    queue.enqueue("M1", &json!({})).await.unwrap();
    let bad_payload = queue.enqueue("bad-payload", &json!({})).await.unwrap();
    let bad_status = queue.enqueue("bad-status", &json!({})).await.unwrap();
    queue.enqueue("M4", &json!({})).await.unwrap();
    queue
      .db
      .with_conn(|conn| {
        conn.execute(
          "UPDATE mutation_queue SET payload = x'7b7b' WHERE id = ?",
          params![bad_payload.id],
        )?;
        conn.execute(
          "UPDATE mutation_queue SET status = 'done' WHERE id = ?",
          params![bad_status.id],
        )?;
        Ok(())
      })
      .unwrap();

    // The bad-status row no longer matches the deliverable filter, so only
    // the pending listing can find it.
    let pending = queue.pending().await.unwrap();
    assert_eq!(pending.len(), 2);

    let (sender, sent) = recording(SendOutcome::Delivered);
    let report = queue.drain(&sender).await.unwrap();
    assert_eq!(*sent.lock().unwrap(), vec!["M1", "M4"]);
    assert_eq!(report.delivered, 2);
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    assert_eq!(queue.dead_letter_count().await.unwrap(), 2);

    // The rewritten status decodes again; the broken payload never will, so
    // listings leave it out, but it can still be purged.
    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].op_type, "bad-status");
    assert!(dead[0].last_error.as_deref().unwrap().starts_with("Undecodable row"));
    let last_error: Option<String> = queue
      .db
      .with_conn(|conn| {
        Ok(conn.query_row(
          "SELECT last_error FROM mutation_queue WHERE id = ?",
          params![bad_payload.id],
          |row| row.get(0),
        )?)
      })
      .unwrap();
    assert!(last_error.unwrap().starts_with("Undecodable row"));
    assert_eq!(queue.clear_dead_letters().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_drain_empty_queue() {
    let (queue, _) = queue(3, 100).await;
    let (sender, sent) = recording(SendOutcome::Delivered);
    assert_eq!(queue.drain(&sender).await.unwrap(), DrainReport::default());
    assert!(sent.lock().unwrap().is_empty());
  }

  #[test]
  fn test_idempotency_key_is_stable() {
    let a = idempotency_key(1, "create", 1_000, b"{}");
    assert_eq!(a, idempotency_key(1, "create", 1_000, b"{}"));
    assert_ne!(a, idempotency_key(2, "create", 1_000, b"{}"));
  }
}
