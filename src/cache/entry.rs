//! Cache entry metadata.

use chrono::{DateTime, Duration, Utc};

/// Lifetime value meaning "never expires until removed".
pub const NO_EXPIRY: u64 = 0;

/// A cached value together with when it was stored and how long it lives.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: String,
  pub value: T,
  /// When the entry was last written
  pub stored_at: DateTime<Utc>,
  /// Lifetime in seconds; [`NO_EXPIRY`] for entries that never expire
  pub ttl_seconds: u64,
}

impl<T> CacheEntry<T> {
  /// When the entry stops being readable, if it ever does.
  pub fn expires_at(&self) -> Option<DateTime<Utc>> {
    expires_at(self.stored_at, self.ttl_seconds)
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.stored_at
  }
}

pub(crate) fn expires_at(stored_at: DateTime<Utc>, ttl_seconds: u64) -> Option<DateTime<Utc>> {
  if ttl_seconds == NO_EXPIRY {
    return None;
  }
  i64::try_from(ttl_seconds)
    .ok()
    .and_then(Duration::try_seconds)
    .and_then(|ttl| stored_at.checked_add_signed(ttl))
}

/// An entry is expired once strictly more than its lifetime has elapsed.
pub(crate) fn is_expired(stored_at_ms: i64, ttl_seconds: u64, now_ms: i64) -> bool {
  if ttl_seconds == NO_EXPIRY {
    return false;
  }
  let ttl_ms = i64::try_from(ttl_seconds).unwrap_or(i64::MAX).saturating_mul(1000);
  now_ms.saturating_sub(stored_at_ms) > ttl_ms
}
