//! Durable queue of writes waiting to reach the remote service.
//!
//! Mutations are appended with increasing ids and delivered strictly in that
//! order by [`MutationQueue::drain`]. Failures are retried with exponential
//! backoff until [`RetryPolicy::max_attempts`] is reached, after which the
//! mutation is kept as a dead letter for inspection.

mod backoff;
mod mutation;
mod store;

pub use backoff::RetryPolicy;
pub use mutation::{MutationStatus, QueuedMutation};
pub use store::{DrainReport, MutationQueue, DEFAULT_SEND_TIMEOUT};
