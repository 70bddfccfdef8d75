//! Cooperative shutdown with active-connection tracking.
//!
//! Uses `ArcSwap` for lock-free lifecycle state transitions and an atomic
//! counter with RAII guards to track connection handlers still running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Coordinator lifecycle state.
///
/// State machine: Starting -> Serving -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Listeners are not yet bound.
    Starting,
    /// Accept loops are running.
    Serving,
    /// Shutdown was signalled; accept loops have stopped, connection
    /// handlers are finishing.
    Draining,
    /// All tracked connection handlers have exited.
    Stopped,
}

/// Coordinates cooperative shutdown across the accept loops and
/// per-connection tasks.
///
/// 1. Accept loops and connection read loops select on `subscribe()`
/// 2. `trigger()` moves to Draining and signals every receiver
/// 3. `wait_for_drain()` blocks until tracked handlers complete
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    active: Arc<AtomicU64>,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: tx,
            active: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Starting)),
        }
    }

    /// Transitions to `Serving` once the accept loops are running.
    pub fn set_serving(&self) {
        self.state.store(Arc::new(LifecycleState::Serving));
    }

    /// Returns a receiver signalled when shutdown is triggered.
    ///
    /// Loops should select on this alongside their accept/read future and
    /// exit at the next boundary.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Initiates shutdown: transitions to `Draining` and wakes all
    /// subscribed loops.
    pub fn trigger(&self) {
        self.state.store(Arc::new(LifecycleState::Draining));
        // Ignore send errors -- receivers may have been dropped
        let _ = self.signal.send(true);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Creates an RAII guard tracking one live connection handler.
    ///
    /// The counter is decremented when the guard drops, even if the
    /// handler panics.
    #[must_use]
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Number of tracked connection handlers still running.
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Waits for tracked handlers to finish, up to `timeout`.
    ///
    /// Returns `true` when the count reached zero (state becomes
    /// `Stopped`); `false` on timeout (state stays `Draining`).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.active.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(LifecycleState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the active-connection counter when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}
