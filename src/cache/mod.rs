//! Durable key/value cache with time-based expiration.
//!
//! Values are stored as JSON under caller-chosen keys (e.g. "patient:42").
//! Each entry carries its own lifetime:
//! - reads treat an expired entry as a miss and delete it on the spot
//! - `clear_expired` sweeps entries that are never read again

mod entry;
mod store;

pub use entry::{CacheEntry, NO_EXPIRY};
pub use store::CacheStore;
