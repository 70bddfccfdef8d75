//! Round-robin assignment of queued jobs to available leases.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use pixelmill_core::types::JobId;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::lease::{Lease, LeaseId};

/// Owns the pending-job FIFO, the registered leases, and the rotation
/// cursor.
///
/// Every mutation of the three happens under one mutex, so a dispatch
/// decision -- scanning the leases and dequeuing the job -- is a single
/// critical section that concurrent callers cannot observe half-done.
pub struct Dispatcher {
    table: Mutex<DispatchTable>,
    wakeup: Notify,
}

#[derive(Default)]
struct DispatchTable {
    /// Leases in registration order.
    leases: Vec<Arc<dyn Lease>>,
    /// Next scan starts here and wraps once around `leases`.
    cursor: usize,
    /// Queued jobs in strict arrival order.
    pending: VecDeque<JobId>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(DispatchTable::default()),
            wakeup: Notify::new(),
        }
    }

    /// Registers a freshly accepted lease and wakes the pump.
    pub fn register(&self, lease: Arc<dyn Lease>) {
        let id = lease.id();
        let total = {
            let mut table = self.table.lock();
            table.leases.push(lease);
            table.leases.len()
        };
        metrics::gauge!("pixelmill_connected_leases").increment(1.0);
        info!(lease = %id, total, "worker lease registered");
        self.kick();
    }

    /// Removes a lease from the rotation. The caller requeues any job the
    /// lease was holding.
    pub fn deregister(&self, id: LeaseId) {
        let removed = {
            let mut table = self.table.lock();
            let before = table.leases.len();
            table.leases.retain(|lease| lease.id() != id);
            (before != table.leases.len()).then_some(table.leases.len())
        };
        if let Some(total) = removed {
            metrics::gauge!("pixelmill_connected_leases").decrement(1.0);
            info!(lease = %id, total, "worker lease deregistered");
        }
    }

    /// Appends a job to the pending queue and wakes the pump.
    pub fn enqueue(&self, job: JobId) {
        let pending = {
            let mut table = self.table.lock();
            table.pending.push_back(job);
            table.pending.len()
        };
        metrics::gauge!("pixelmill_pending_jobs").set(pending_as_f64(pending));
        debug!(%job, pending, "job queued");
        self.kick();
    }

    /// Number of jobs waiting for a lease.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Number of registered leases.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.table.lock().leases.len()
    }

    /// Wakes the assignment pump. Called after every state change that
    /// could make an assignment possible.
    pub fn kick(&self) {
        self.wakeup.notify_one();
    }

    /// Waits until the next kick. A kick delivered while nobody was
    /// waiting is retained, so wakeups between drain passes are not lost.
    pub async fn notified(&self) {
        self.wakeup.notified().await;
    }

    /// One dispatch decision.
    ///
    /// Starting at the cursor, scans leases in registration order wrapping
    /// once; the first lease that accepts reservation is handed the head
    /// of the pending queue, and the cursor advances to just past it.
    /// Returns `None` -- a no-op -- when the queue is empty or no lease is
    /// available; a later kick retries.
    pub fn assign(&self) -> Option<(Arc<dyn Lease>, JobId)> {
        let mut table = self.table.lock();
        if table.pending.is_empty() || table.leases.is_empty() {
            return None;
        }

        let count = table.leases.len();
        for step in 0..count {
            let idx = (table.cursor + step) % count;
            if table.leases[idx].try_reserve() {
                let job = table.pending.pop_front().expect("pending checked non-empty");
                table.cursor = (idx + 1) % count;
                let lease = Arc::clone(&table.leases[idx]);
                metrics::gauge!("pixelmill_pending_jobs").set(pending_as_f64(table.pending.len()));
                debug!(%job, lease = %lease.id(), "job assigned");
                return Some((lease, job));
            }
        }
        None
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_precision_loss)]
fn pending_as_f64(pending: usize) -> f64 {
    pending as f64
}
