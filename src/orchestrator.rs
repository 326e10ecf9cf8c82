//! Wires the cache, the queue and connectivity into one lifecycle.
//!
//! ```ignore
//! let mut sync = SyncOrchestrator::open(db, monitor, sender, settings);
//! sync.start().await?;
//! // ... application runs, using sync.cache() and sync.queue() ...
//! sync.stop();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::config::SyncSettings;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, Subscription};
use crate::db::{Database, StorageMode};
use crate::error::{Result, SyncError};
use crate::queue::{DrainReport, MutationQueue};
use crate::sender::MutationSender;

/// Whether a drain pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
  Idle,
  Draining,
}

/// Snapshot for status indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
  pub online: bool,
  pub drain_state: DrainState,
  pub storage: Option<StorageMode>,
  pub pending: usize,
  pub dead_letters: usize,
}

struct Inner<S> {
  cache: CacheStore,
  queue: MutationQueue,
  monitor: ConnectivityMonitor,
  sender: S,
  settings: SyncSettings,
  draining: AtomicBool,
}

/// Resets the draining flag when a pass ends, however it ends.
struct DrainingGuard<'a>(&'a AtomicBool);

impl Drop for DrainingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl<S: MutationSender + 'static> Inner<S> {
  /// Run one pass unless one is already running. `Ok(None)` means coalesced.
  async fn drain(&self, trigger: &'static str) -> Result<Option<DrainReport>> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!(trigger, "Drain already running, trigger coalesced");
      return Ok(None);
    }
    let _guard = DrainingGuard(&self.draining);

    debug!(trigger, "Drain pass starting");
    match self.queue.drain(&self.sender).await {
      Ok(report) => Ok(Some(report)),
      Err(SyncError::DrainInProgress) => Ok(None),
      Err(e) => Err(e),
    }
  }

  fn spawn_drain(self: &Arc<Self>, trigger: &'static str) {
    let inner = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = inner.drain(trigger).await {
        error!(trigger, error = %e, "Drain pass failed");
      }
    });
  }

  async fn sweep(&self) {
    match self.cache.clear_expired().await {
      Ok(removed) => debug!(removed, "Eviction sweep finished"),
      Err(e) => warn!(error = %e, "Eviction sweep failed"),
    }
  }
}

/// Floor for the retry tick, so a zero base backoff does not spin.
const MIN_RETRY_TICK: Duration = Duration::from_millis(10);

struct Running {
  _subscription: Subscription,
  tasks: Vec<JoinHandle<()>>,
}

/// The sync service. Build one at startup, share it by reference, and call
/// [`start`](Self::start) once and [`stop`](Self::stop) (or drop it) at teardown.
pub struct SyncOrchestrator<S: MutationSender + 'static> {
  inner: Arc<Inner<S>>,
  running: Option<Running>,
}

impl<S: MutationSender + 'static> SyncOrchestrator<S> {
  /// `cache` and `queue` should share one [`Database`].
  pub fn new(
    cache: CacheStore,
    queue: MutationQueue,
    monitor: ConnectivityMonitor,
    sender: S,
    settings: SyncSettings,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        cache,
        queue,
        monitor,
        sender,
        settings,
        draining: AtomicBool::new(false),
      }),
      running: None,
    }
  }

  /// Cache and queue over `db` with the wall clock.
  pub fn open(db: Database, monitor: ConnectivityMonitor, sender: S, settings: SyncSettings) -> Self {
    let cache = CacheStore::new(db.clone());
    let queue = MutationQueue::new(db, settings.retry).with_send_timeout(settings.send_timeout);
    Self::new(cache, queue, monitor, sender, settings)
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.inner.queue
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.inner.monitor
  }

  pub fn is_running(&self) -> bool {
    self.running.is_some()
  }

  pub fn drain_state(&self) -> DrainState {
    if self.inner.draining.load(Ordering::SeqCst) {
      DrainState::Draining
    } else {
      DrainState::Idle
    }
  }

  /// Open storage, subscribe to connectivity, start the eviction and retry
  /// timers, and drain once if already online. Calling it again while running
  /// is a no-op.
  ///
  /// While online, a pass is started every base backoff interval so failed
  /// mutations are retried and new ones go out without waiting for a
  /// connectivity change. Ticks that land on a running pass are coalesced.
  ///
  /// Storage that cannot be opened is not an error: the service continues
  /// memory-only and reports [`StorageMode::MemoryOnly`].
  pub async fn start(&mut self) -> Result<StorageMode> {
    if self.running.is_some() {
      return Ok(self.inner.cache.database().mode().unwrap_or(StorageMode::MemoryOnly));
    }

    let mode = match self.inner.cache.init().await {
      Ok(mode) => mode,
      Err(SyncError::StorageUnavailable(reason)) => {
        warn!(%reason, "Storage unavailable, cache and queue will not survive restart");
        self.inner.cache.database().init_or_fallback().await
      }
      Err(e) => return Err(e),
    };
    self.inner.queue.init().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = self.inner.monitor.subscribe(move |event| {
      // Receiver gone means we're stopping
      let _ = tx.send(event);
    });

    let inner = Arc::clone(&self.inner);
    let events = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        if event == ConnectivityEvent::BecameOnline {
          inner.spawn_drain("connectivity restored");
        }
      }
    });

    let inner = Arc::clone(&self.inner);
    let period = self.inner.settings.eviction_interval;
    let sweeper = tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        inner.sweep().await;
      }
    });

    let inner = Arc::clone(&self.inner);
    let period = self.inner.settings.retry.base_backoff.max(MIN_RETRY_TICK);
    let retrier = tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        if inner.monitor.is_online() {
          inner.spawn_drain("retry");
        }
      }
    });

    self.running = Some(Running {
      _subscription: subscription,
      tasks: vec![events, sweeper, retrier],
    });
    info!(?mode, online = self.inner.monitor.is_online(), "Sync started");

    if self.inner.monitor.is_online() {
      self.inner.spawn_drain("startup");
    }

    Ok(mode)
  }

  /// Unsubscribe and cancel the timers. A pass already running finishes on its own.
  pub fn stop(&mut self) {
    if let Some(running) = self.running.take() {
      for task in &running.tasks {
        task.abort();
      }
      drop(running);
      info!("Sync stopped");
    }
  }

  /// Drain now. Returns `Ok(None)` if offline or a pass is already running.
  pub async fn trigger_drain(&self) -> Result<Option<DrainReport>> {
    if !self.inner.monitor.is_online() {
      debug!("Offline, drain skipped");
      return Ok(None);
    }
    self.inner.drain("explicit").await
  }

  pub async fn status(&self) -> Result<SyncStatus> {
    Ok(SyncStatus {
      online: self.inner.monitor.is_online(),
      drain_state: self.drain_state(),
      storage: self.inner.cache.database().mode(),
      pending: self.inner.queue.pending_count().await?,
      dead_letters: self.inner.queue.dead_letter_count().await?,
    })
  }
}

impl<S: MutationSender + 'static> Drop for SyncOrchestrator<S> {
  fn drop(&mut self) {
    self.stop();
  }
}
