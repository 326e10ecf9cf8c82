//! The boundary to the remote service.
//!
//! The queue knows nothing about the remote protocol. It hands each mutation to
//! a [`MutationSender`] and acts on the three-way [`SendOutcome`].

mod http;

pub use http::HttpSender;

use std::future::Future;

use crate::error::SyncError;
use crate::queue::QueuedMutation;

/// How far a recoverable failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
  /// The whole channel is down (offline, timeout, gateway errors). Stop the pass.
  Channel,
  /// Only this mutation failed. Move on to the next one.
  Mutation,
}

/// Result of handing one mutation to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
  Delivered,
  /// Try again later.
  Recoverable { scope: FailureScope, reason: String },
  /// The remote rejected the mutation (e.g. a conflict). Never retried.
  Permanent { reason: String },
}

impl SendOutcome {
  pub fn channel_down(reason: impl Into<String>) -> Self {
    Self::Recoverable {
      scope: FailureScope::Channel,
      reason: reason.into(),
    }
  }

  pub fn retry_later(reason: impl Into<String>) -> Self {
    Self::Recoverable {
      scope: FailureScope::Mutation,
      reason: reason.into(),
    }
  }

  pub fn rejected(reason: impl Into<String>) -> Self {
    Self::Permanent {
      reason: reason.into(),
    }
  }
}

impl From<SyncError> for SendOutcome {
  fn from(err: SyncError) -> Self {
    match err {
      SyncError::Network(_) | SyncError::Timeout(_) => Self::channel_down(err.to_string()),
      SyncError::Conflict(_) => Self::rejected(err.to_string()),
      other => Self::retry_later(other.to_string()),
    }
  }
}

/// Delivers a single mutation to the remote service.
pub trait MutationSender: Send + Sync {
  fn send(&self, mutation: &QueuedMutation) -> impl Future<Output = SendOutcome> + Send;
}

/// Any async closure taking the mutation works as a sender.
impl<F, Fut> MutationSender for F
where
  F: Fn(QueuedMutation) -> Fut + Send + Sync,
  Fut: Future<Output = SendOutcome> + Send,
{
  fn send(&self, mutation: &QueuedMutation) -> impl Future<Output = SendOutcome> + Send {
    self(mutation.clone())
  }
}
