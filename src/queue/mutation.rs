//! Queued mutation record and its status.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Where a mutation is in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
  /// Waiting for its first delivery attempt
  Pending,
  /// Currently being handed to the sender
  InFlight,
  /// Failed at least once; will be retried after backoff
  FailedRetryable,
  /// Gave up; kept until explicitly cleared
  DeadLetter,
}

impl MutationStatus {
  pub const ALL: [MutationStatus; 4] = [
    Self::Pending,
    Self::InFlight,
    Self::FailedRetryable,
    Self::DeadLetter,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in_flight",
      Self::FailedRetryable => "failed_retryable",
      Self::DeadLetter => "dead_letter",
    }
  }

  /// Statuses a drain pass may pick up.
  pub fn is_deliverable(&self) -> bool {
    matches!(self, Self::Pending | Self::FailedRetryable)
  }
}

/// SQL list of the deliverable statuses, for `status IN (...)` filters.
pub(crate) fn deliverable_statuses() -> String {
  MutationStatus::ALL
    .iter()
    .filter(|status| status.is_deliverable())
    .map(|status| format!("'{}'", status.as_str()))
    .collect::<Vec<_>>()
    .join(", ")
}

impl fmt::Display for MutationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "in_flight" => Ok(Self::InFlight),
      "failed_retryable" => Ok(Self::FailedRetryable),
      "dead_letter" => Ok(Self::DeadLetter),
      other => Err(format!("unknown mutation status '{}'", other)),
    }
  }
}

/// A write waiting to be applied remotely.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMutation {
  /// Sequence number; delivery order is ascending id
  pub id: i64,
  pub op_type: String,
  pub payload: serde_json::Value,
  /// Stable across retries so the remote can drop duplicate deliveries
  pub idempotency_key: String,
  pub status: MutationStatus,
  /// Delivery attempts made so far
  pub attempts: u32,
  pub created_at: DateTime<Utc>,
  pub last_attempt_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

pub(crate) const COLUMNS: &str = "id, op_type, payload, idempotency_key, status, attempts, \
   created_at_ms, last_attempt_at_ms, last_error";

impl QueuedMutation {
  /// Build from a row selected with [`COLUMNS`].
  pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    let payload: Vec<u8> = row.get(2)?;
    let payload = serde_json::from_slice(&payload)
      .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Blob, Box::new(e)))?;

    let status: String = row.get(4)?;
    let status = status
      .parse::<MutationStatus>()
      .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;

    let created_at_ms: i64 = row.get(6)?;
    let last_attempt_at_ms: Option<i64> = row.get(7)?;

    Ok(Self {
      id: row.get(0)?,
      op_type: row.get(1)?,
      payload,
      idempotency_key: row.get(3)?,
      status,
      attempts: row.get(5)?,
      created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_default(),
      last_attempt_at: last_attempt_at_ms.and_then(DateTime::from_timestamp_millis),
      last_error: row.get(8)?,
    })
  }
}
