//! Online/offline tracking.
//!
//! The host feeds its raw connectivity signal into [`ConnectivityMonitor::set_online`];
//! subscribers only hear about transitions, never repeats of the current state.

mod probe;

pub use probe::spawn_probe;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  BecameOnline,
  BecameOffline,
}

type Callback = Arc<dyn Fn(ConnectivityEvent) + Send + Sync>;

struct Shared {
  online: AtomicBool,
  next_id: AtomicU64,
  subscribers: Mutex<Vec<(u64, Callback)>>,
}

/// Observable connectivity state. Clones share the same state and subscribers.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  shared: Arc<Shared>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    Self {
      shared: Arc::new(Shared {
        online: AtomicBool::new(initially_online),
        next_id: AtomicU64::new(0),
        subscribers: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.shared.online.load(Ordering::SeqCst)
  }

  /// Report the current platform signal. Subscribers are notified only when it changes.
  pub fn set_online(&self, online: bool) {
    let was_online = self.shared.online.swap(online, Ordering::SeqCst);
    if was_online == online {
      return;
    }

    let event = if online {
      ConnectivityEvent::BecameOnline
    } else {
      ConnectivityEvent::BecameOffline
    };
    info!(?event, "Connectivity changed");

    // Call outside the lock so callbacks may subscribe or unsubscribe.
    let callbacks: Vec<Callback> = self
      .lock_subscribers()
      .iter()
      .map(|(_, cb)| cb.clone())
      .collect();
    for callback in callbacks {
      callback(event);
    }
  }

  /// Register `callback` for transition events until the returned handle is
  /// dropped or [`Subscription::unsubscribe`] is called.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(ConnectivityEvent) + Send + Sync + 'static,
  {
    let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
    self.lock_subscribers().push((id, Arc::new(callback)));
    debug!(id, "Connectivity subscriber added");
    Subscription {
      id,
      shared: Arc::downgrade(&self.shared),
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.lock_subscribers().len()
  }

  fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Callback)>> {
    self
      .shared
      .subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  id: u64,
  shared: Weak<Shared>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work.
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(shared) = self.shared.upgrade() {
      shared
        .subscribers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|(id, _)| *id != self.id);
      debug!(id = self.id, "Connectivity subscriber removed");
    }
  }
}
