//! Worker leases: the coordinator's handle on one worker connection.
//!
//! A lease owns its socket outright. During a round trip the connection is
//! used for nothing else: the lease sends one job frame and blocks reading
//! exactly one result frame. At most one job is in flight per lease; the
//! dispatcher guarantees this by reserving a lease before handing it work.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pixelmill_core::types::JobId;
use pixelmill_core::wire::{Frame, FrameCodec, JobPayload, MessageKind, WireError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::config::LeaseConfig;

/// Unique identifier for a worker lease.
///
/// Displays as the first 8 hex characters, the label carried in logs and
/// progress `info` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(Uuid);

impl LeaseId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Fresh unique id for scripted leases in tests.
    #[cfg(test)]
    pub(crate) fn fresh_for_tests() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; 32];
        let full = self.0.simple().encode_lower(&mut buf);
        write!(f, "{}", &full[..8])
    }
}

const STATE_AVAILABLE: u8 = 0;
const STATE_BUSY: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

/// Availability state of a lease.
///
/// Available -> Busy -> (Available | Disconnected); Disconnected is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Idle and eligible for assignment.
    Available,
    /// A round trip is in flight.
    Busy,
    /// The connection is gone; the lease will be deregistered.
    Disconnected,
}

/// Errors that end a lease's round trip. All of them are transport-level:
/// the lease is disconnected and its job requeued.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The worker closed the connection before replying.
    #[error("worker connection closed")]
    Closed,

    /// No result frame arrived within the configured window.
    #[error("no result within {0:?}")]
    ResultTimeout(Duration),

    /// Framing or I/O failure on the connection.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The worker replied with something other than a job result.
    #[error("expected a job result frame, received {0:?}")]
    UnexpectedFrame(MessageKind),

    /// The result's job id does not match the job in flight.
    #[error("result for job {got} while job {expected} was in flight")]
    CorrelationMismatch {
        /// Job that was sent.
        expected: JobId,
        /// Job id the worker answered with.
        got: JobId,
    },
}

/// Dispatcher-facing surface of a worker lease.
///
/// The dispatcher and the assignment pump hold leases as trait objects so
/// tests can substitute scripted implementations.
#[async_trait]
pub trait Lease: Send + Sync {
    /// Identity of this lease.
    fn id(&self) -> LeaseId;

    /// Current availability state.
    fn state(&self) -> LeaseState;

    /// Job currently assigned to this lease, if any.
    fn current_job(&self) -> Option<JobId>;

    /// Atomically reserves the lease for one assignment
    /// (Available -> Busy). Fails immediately, with no state change, when
    /// the lease is busy or disconnected.
    fn try_reserve(&self) -> bool;

    /// Returns the lease to Available after a successful round trip.
    fn release(&self);

    /// Marks the lease Disconnected. Terminal: a disconnected lease never
    /// becomes available again.
    fn disconnect(&self);

    /// Performs the full synchronous round trip for one job: send the
    /// assignment frame, block reading the result frame, validate kind
    /// and correlation.
    async fn exchange(&self, job: JobPayload) -> Result<JobPayload, LeaseError>;
}

/// A lease bound to a framed byte stream -- TCP in production, in-memory
/// duplex pipes in tests.
pub struct WorkerLease<S> {
    id: LeaseId,
    state: AtomicU8,
    current: parking_lot::Mutex<Option<JobId>>,
    conn: tokio::sync::Mutex<Framed<S, FrameCodec>>,
    result_timeout: Duration,
}

/// The production lease type.
pub type TcpWorkerLease = WorkerLease<TcpStream>;

impl<S> WorkerLease<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an accepted worker connection in a fresh lease.
    pub fn new(stream: S, config: &LeaseConfig) -> Self {
        Self {
            id: LeaseId::new(),
            state: AtomicU8::new(STATE_AVAILABLE),
            current: parking_lot::Mutex::new(None),
            conn: tokio::sync::Mutex::new(Framed::new(stream, FrameCodec::new())),
            result_timeout: config.result_timeout,
        }
    }
}

#[async_trait]
impl<S> Lease for WorkerLease<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> LeaseId {
        self.id
    }

    fn state(&self) -> LeaseState {
        match self.state.load(Ordering::Acquire) {
            STATE_AVAILABLE => LeaseState::Available,
            STATE_BUSY => LeaseState::Busy,
            _ => LeaseState::Disconnected,
        }
    }

    fn current_job(&self) -> Option<JobId> {
        *self.current.lock()
    }

    fn try_reserve(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_AVAILABLE,
                STATE_BUSY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn release(&self) {
        *self.current.lock() = None;
        // Only Busy -> Available; a disconnected lease stays down.
        let _ = self.state.compare_exchange(
            STATE_BUSY,
            STATE_AVAILABLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn disconnect(&self) {
        *self.current.lock() = None;
        self.state.store(STATE_DISCONNECTED, Ordering::Release);
    }

    async fn exchange(&self, job: JobPayload) -> Result<JobPayload, LeaseError> {
        let expected = job.image_id;
        *self.current.lock() = Some(expected);

        // The round trip owns the connection: nothing else reads or writes
        // this socket until the result arrives or the lease dies.
        let mut conn = self.conn.lock().await;

        conn.send(Frame::AssignJob(job)).await?;

        let frame = match tokio::time::timeout(self.result_timeout, conn.next()).await {
            Err(_) => return Err(LeaseError::ResultTimeout(self.result_timeout)),
            Ok(None) => return Err(LeaseError::Closed),
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(Some(Ok(frame))) => frame,
        };

        let result = match frame {
            Frame::JobResult(result) => result,
            other => return Err(LeaseError::UnexpectedFrame(other.kind())),
        };

        if result.image_id != expected {
            return Err(LeaseError::CorrelationMismatch {
                expected,
                got: result.image_id,
            });
        }

        Ok(result)
    }
}
