//! Offline-first persistence and sync.
//!
//! - [`cache::CacheStore`]: durable key/value cache with per-entry lifetimes
//! - [`queue::MutationQueue`]: durable FIFO of writes, retried with backoff
//!   until delivered or dead-lettered
//! - [`connectivity::ConnectivityMonitor`]: online/offline transitions
//! - [`orchestrator::SyncOrchestrator`]: drains the queue on reconnect and
//!   sweeps the cache on a timer

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod sender;

pub use cache::CacheStore;
pub use config::{Config, SyncSettings};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, Subscription};
pub use db::{Database, StorageMode};
pub use error::{Result, SyncError};
pub use orchestrator::{DrainState, SyncOrchestrator, SyncStatus};
pub use queue::{DrainReport, MutationQueue, MutationStatus, QueuedMutation, RetryPolicy};
pub use sender::{FailureScope, HttpSender, MutationSender, SendOutcome};
