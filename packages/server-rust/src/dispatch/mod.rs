//! The coordinator's dispatch subsystem: worker leases, the round-robin
//! dispatcher, the job/batch registry, and the pump task that ties them
//! together.
//!
//! Ownership is one-directional -- registry -> dispatcher -> leases -- and
//! every cross-reference between a job and the lease processing it goes
//! through registry-owned identifiers, so nothing here forms a cycle.

pub mod dispatcher;
pub mod lease;
pub mod registry;

pub use dispatcher::Dispatcher;
pub use lease::{Lease, LeaseError, LeaseId, LeaseState, TcpWorkerLease, WorkerLease};
pub use registry::{JobRegistry, RegistryError, ResultSink};

use std::sync::Arc;

use pixelmill_core::wire::JobPayload;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Spawns the assignment pump.
///
/// The pump sleeps until the dispatcher is kicked, then repeats single
/// dispatch decisions until none finds a candidate -- so a burst of
/// wakeups coalesced into one permit still drains the whole queue. Each
/// successful decision launches the lease's round trip on its own task.
pub fn spawn_assignment_pump(
    dispatcher: Arc<Dispatcher>,
    registry: Arc<JobRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = dispatcher.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            while let Some((lease, job_id)) = dispatcher.assign() {
                match registry.begin_assignment(job_id, lease.id()).await {
                    Some(job) => {
                        tokio::spawn(run_round_trip(
                            lease,
                            job,
                            Arc::clone(&dispatcher),
                            Arc::clone(&registry),
                        ));
                    }
                    None => {
                        // The job vanished between queueing and assignment
                        // (its batch was torn down); free the lease.
                        lease.release();
                    }
                }
            }
        }
        debug!("assignment pump exiting");
    })
}

/// One lease round trip and its outcome handling.
async fn run_round_trip(
    lease: Arc<dyn Lease>,
    job: JobPayload,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<JobRegistry>,
) {
    let job_id = job.image_id;
    match lease.exchange(job).await {
        Ok(result) => {
            lease.release();
            registry.on_result(job_id, result).await;
        }
        Err(err) => {
            warn!(
                lease = %lease.id(),
                job = %job_id,
                error = %err,
                "worker round trip failed, dropping lease"
            );
            lease.disconnect();
            dispatcher.deregister(lease.id());
            registry.on_transport_failure(job_id).await;
        }
    }
    dispatcher.kick();
}
