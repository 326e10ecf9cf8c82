//! Retry limits and exponential backoff.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::mutation::QueuedMutation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Attempts after which a mutation is dead-lettered
  pub max_attempts: u32,
  pub base_backoff: Duration,
  pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_backoff: Duration::from_millis(1_000),
      backoff_cap: Duration::from_secs(300),
    }
  }
}

impl RetryPolicy {
  /// Wait required after the `attempts`-th failed attempt.
  ///
  /// `base * 2^(attempts - 1)`, capped; nothing before the first attempt.
  pub fn delay_after(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
    self
      .base_backoff
      .checked_mul(factor)
      .unwrap_or(self.backoff_cap)
      .min(self.backoff_cap)
  }

  /// Earliest time the mutation may be attempted again.
  pub fn next_eligible_at(&self, mutation: &QueuedMutation) -> Option<DateTime<Utc>> {
    let last = mutation.last_attempt_at?;
    let delay = chrono::Duration::from_std(self.delay_after(mutation.attempts)).ok()?;
    last.checked_add_signed(delay)
  }

  pub fn is_eligible(&self, mutation: &QueuedMutation, now: DateTime<Utc>) -> bool {
    match self.next_eligible_at(mutation) {
      Some(at) => now >= at,
      None => true,
    }
  }

  pub fn is_exhausted(&self, attempts: u32) -> bool {
    attempts >= self.max_attempts
  }
}
