//! In-flight job and batch bookkeeping.
//!
//! The registry is the single owner of job and batch lifetime. Jobs and
//! leases refer to each other through registry-owned identifiers, never
//! through direct links, and a batch's client connection lives inside the
//! same critical section as its counters so a result write can never race
//! the close decision.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::SinkExt;
use pixelmill_core::types::{BatchId, JobId, JobStatus};
use pixelmill_core::wire::{Frame, FrameCodec, JobPayload, ProgressUpdate, WireError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::progress::ProgressHandle;

use super::dispatcher::Dispatcher;
use super::lease::LeaseId;

/// Write side of a client's retained result stream.
///
/// A trait object so tests can drive batches over in-memory connections.
#[async_trait]
pub trait ResultSink: Send {
    /// Writes one frame to the client.
    async fn deliver(&mut self, frame: Frame) -> Result<(), WireError>;

    /// Flushes and closes the stream.
    async fn close(&mut self) -> Result<(), WireError>;
}

#[async_trait]
impl<S> ResultSink for Framed<S, FrameCodec>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn deliver(&mut self, frame: Frame) -> Result<(), WireError> {
        self.send(frame).await
    }

    async fn close(&mut self) -> Result<(), WireError> {
        SinkExt::close(self).await
    }
}

/// Errors surfaced by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No open batch with this id.
    #[error("batch {0} is not open")]
    UnknownBatch(BatchId),

    /// A batch with this id is already open.
    #[error("batch {0} is already open")]
    DuplicateBatch(BatchId),

    /// A job with this id is already registered.
    #[error("job {0} is already registered")]
    DuplicateJob(JobId),
}

struct JobEntry {
    payload: JobPayload,
    status: JobStatus,
    lease: Option<LeaseId>,
    /// Assignments consumed so far; bounds transport-fault retries.
    attempts: u32,
}

struct BatchState {
    total: u32,
    remaining: u32,
    processed: u32,
    /// `None` once the batch has been closed; the write-after-close guard.
    client: Option<Box<dyn ResultSink>>,
    progress_dest: SocketAddr,
}

/// All in-flight jobs and batches, and the operations that move them
/// through their lifecycle.
pub struct JobRegistry {
    jobs: DashMap<JobId, JobEntry>,
    batches: DashMap<BatchId, Arc<Mutex<BatchState>>>,
    job_batch: DashMap<JobId, BatchId>,
    dispatcher: Arc<Dispatcher>,
    progress: ProgressHandle,
    max_job_attempts: u32,
}

impl JobRegistry {
    /// Creates an empty registry wired to `dispatcher` and the progress
    /// channel.
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        progress: ProgressHandle,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            jobs: DashMap::new(),
            batches: DashMap::new(),
            job_batch: DashMap::new(),
            dispatcher,
            progress,
            max_job_attempts: config.max_job_attempts,
        }
    }

    /// Opens a batch: retains the client's connection for result delivery,
    /// the address progress datagrams go to, and the declared job count.
    ///
    /// Counters start at the declared count, so a fast completion of the
    /// first job cannot drain the batch before the rest are registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateBatch`] when the id is already
    /// open.
    pub fn open_batch(
        &self,
        batch_id: BatchId,
        expected_jobs: u32,
        client: Box<dyn ResultSink>,
        progress_dest: SocketAddr,
    ) -> Result<(), RegistryError> {
        if self.batches.contains_key(&batch_id) {
            return Err(RegistryError::DuplicateBatch(batch_id));
        }
        self.batches.insert(
            batch_id,
            Arc::new(Mutex::new(BatchState {
                total: expected_jobs,
                remaining: expected_jobs,
                processed: 0,
                client: Some(client),
                progress_dest,
            })),
        );
        Ok(())
    }

    /// Registers one job of an open batch, announces it as queued, and
    /// hands it to the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the batch is unknown or the job id
    /// is already in flight.
    pub async fn enqueue(&self, batch_id: BatchId, job: JobPayload) -> Result<(), RegistryError> {
        let job_id = job.image_id;
        if self.jobs.contains_key(&job_id) {
            return Err(RegistryError::DuplicateJob(job_id));
        }
        let batch = self
            .batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::UnknownBatch(batch_id))?;

        let (total, processed, dest) = {
            let state = batch.lock().await;
            (state.total, state.processed, state.progress_dest)
        };

        let file_name = job.file_name.clone();
        self.job_batch.insert(job_id, batch_id);
        self.jobs.insert(
            job_id,
            JobEntry {
                payload: job,
                status: JobStatus::Queued,
                lease: None,
                attempts: 0,
            },
        );

        metrics::counter!("pixelmill_jobs_enqueued_total").increment(1);
        debug!(job = %job_id, batch = %batch_id, total, "job registered");

        self.progress.publish(
            &ProgressUpdate {
                image_id: job_id,
                file_name,
                total,
                processed,
                status: JobStatus::Queued,
                info: String::new(),
            },
            dest,
        );

        self.dispatcher.enqueue(job_id);
        Ok(())
    }

    /// Marks a job as processing on `lease` and returns the payload to
    /// send. Returns `None` when the job no longer exists (its batch was
    /// torn down between queueing and assignment).
    pub async fn begin_assignment(&self, job_id: JobId, lease: LeaseId) -> Option<JobPayload> {
        let payload = {
            let mut entry = self.jobs.get_mut(&job_id)?;
            entry.status = JobStatus::Processing;
            entry.lease = Some(lease);
            entry.attempts += 1;
            entry.payload.clone()
        };

        self.announce(job_id, &payload.file_name, JobStatus::Processing, lease.to_string())
            .await;
        Some(payload)
    }

    /// Routes a worker's result frame: failure-flagged results become
    /// terminal job failures, everything else completes the job.
    pub async fn on_result(&self, job_id: JobId, result: JobPayload) {
        if result.is_failure_flagged() {
            self.on_failed(job_id, "worker reported transform failure")
                .await;
        } else {
            self.on_completed(job_id, result).await;
        }
    }

    /// Completes a job: delivers the result on the batch's client
    /// connection, advances batch counters, closes the batch exactly once
    /// when it drains.
    pub async fn on_completed(&self, job_id: JobId, result: JobPayload) {
        metrics::counter!("pixelmill_jobs_completed_total").increment(1);
        self.finalize(
            job_id,
            JobStatus::Completed,
            Frame::DeliverResult(result),
            String::new(),
        )
        .await;
    }

    /// Terminally fails a job.
    ///
    /// Synthesizes an error-flagged result frame -- sentinel `failed_`
    /// file name, empty payload, zero dimensions -- so the batch still
    /// delivers exactly one frame per job and its completion accounting
    /// is unaffected by failures.
    pub async fn on_failed(&self, job_id: JobId, reason: &str) {
        let Some(frame) = self.jobs.get(&job_id).map(|entry| {
            Frame::DeliverResult(JobPayload {
                image_id: job_id,
                file_name: format!("failed_{}", entry.payload.file_name),
                width: 0,
                height: 0,
                format: entry.payload.format,
                data: Bytes::new(),
            })
        }) else {
            return;
        };

        metrics::counter!("pixelmill_jobs_failed_total").increment(1);
        warn!(job = %job_id, reason, "job failed terminally");
        self.finalize(job_id, JobStatus::Failed, frame, reason.to_string())
            .await;
    }

    /// Handles a retryable transport fault from a lease round trip.
    ///
    /// The job returns to the pending queue -- never silently dropped --
    /// unless its attempt budget is exhausted, in which case it is failed
    /// terminally instead.
    pub async fn on_transport_failure(&self, job_id: JobId) {
        let requeue = {
            let Some(mut entry) = self.jobs.get_mut(&job_id) else {
                return;
            };
            if entry.attempts >= self.max_job_attempts {
                false
            } else {
                entry.status = JobStatus::Queued;
                entry.lease = None;
                true
            }
        };

        if requeue {
            metrics::counter!("pixelmill_jobs_requeued_total").increment(1);
            let file_name = self
                .jobs
                .get(&job_id)
                .map(|entry| entry.payload.file_name.clone())
                .unwrap_or_default();
            self.announce(
                job_id,
                &file_name,
                JobStatus::Queued,
                "requeued after worker failure".to_string(),
            )
            .await;
            self.dispatcher.enqueue(job_id);
        } else {
            self.on_failed(job_id, "no worker could process this job")
                .await;
        }
    }

    /// Tears down a batch whose submission turned out malformed: closes
    /// the client connection and discards its registered jobs.
    ///
    /// Job ids already handed to the dispatcher become stale; the
    /// assignment pump releases their leases when the lookup misses.
    pub async fn abort_batch(&self, batch_id: BatchId) {
        let Some((_, batch)) = self.batches.remove(&batch_id) else {
            return;
        };
        {
            let mut state = batch.lock().await;
            if let Some(mut client) = state.client.take() {
                let _ = client.close().await;
            }
        }

        let orphaned: Vec<JobId> = self
            .job_batch
            .iter()
            .filter(|entry| *entry.value() == batch_id)
            .map(|entry| *entry.key())
            .collect();
        for job_id in &orphaned {
            self.jobs.remove(job_id);
            self.job_batch.remove(job_id);
        }
        warn!(batch = %batch_id, jobs = orphaned.len(), "batch aborted");
    }

    /// Current status of a job, if it is still in flight.
    #[must_use]
    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.jobs.get(&job_id).map(|entry| entry.status)
    }

    /// Lease currently processing a job, if any.
    #[must_use]
    pub fn job_lease(&self, job_id: JobId) -> Option<LeaseId> {
        self.jobs.get(&job_id).and_then(|entry| entry.lease)
    }

    /// Number of jobs still in flight.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Whether a batch is still open.
    #[must_use]
    pub fn has_batch(&self, batch_id: BatchId) -> bool {
        self.batches.contains_key(&batch_id)
    }

    /// Publishes a progress update with the batch's current counters.
    async fn announce(&self, job_id: JobId, file_name: &str, status: JobStatus, info: String) {
        let Some(batch_id) = self.job_batch.get(&job_id).map(|entry| *entry.value()) else {
            return;
        };
        let Some(batch) = self
            .batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };

        let (total, processed, dest) = {
            let state = batch.lock().await;
            (state.total, state.processed, state.progress_dest)
        };

        self.progress.publish(
            &ProgressUpdate {
                image_id: job_id,
                file_name: file_name.to_string(),
                total,
                processed,
                status,
                info,
            },
            dest,
        );
    }

    /// Terminal bookkeeping shared by completion and failure.
    async fn finalize(&self, job_id: JobId, status: JobStatus, frame: Frame, info: String) {
        let file_name = {
            let Some(mut entry) = self.jobs.get_mut(&job_id) else {
                return;
            };
            entry.status = status;
            entry.lease = None;
            entry.payload.file_name.clone()
        };

        let Some(batch_id) = self.job_batch.get(&job_id).map(|entry| *entry.value()) else {
            return;
        };
        let Some(batch) = self
            .batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };

        // Counters, the result write, and the close decision share one
        // critical section. A late finalization can only observe the
        // connection slot already empty, never a closed stream.
        let (total, processed, dest, drained) = {
            let mut state = batch.lock().await;
            state.processed += 1;

            match state.client.as_mut() {
                Some(client) => {
                    if let Err(err) = client.deliver(frame).await {
                        // Known gap: the undeliverable result is not
                        // retried, bookkeeping still advances.
                        metrics::counter!("pixelmill_result_delivery_failed_total").increment(1);
                        warn!(job = %job_id, batch = %batch_id, error = %err, "result delivery failed");
                    }
                }
                None => {
                    warn!(job = %job_id, batch = %batch_id, "client connection already closed, result dropped");
                }
            }

            state.remaining = state.remaining.saturating_sub(1);
            let drained = state.remaining == 0;
            if drained {
                if let Some(mut client) = state.client.take() {
                    if let Err(err) = client.close().await {
                        debug!(batch = %batch_id, error = %err, "client close failed");
                    }
                }
            }
            (state.total, state.processed, state.progress_dest, drained)
        };

        self.progress.publish(
            &ProgressUpdate {
                image_id: job_id,
                file_name,
                total,
                processed,
                status,
                info,
            },
            dest,
        );

        self.jobs.remove(&job_id);
        self.job_batch.remove(&job_id);

        if drained {
            self.batches.remove(&batch_id);
            info!(batch = %batch_id, total, "batch complete, client connection closed");
        }

        self.dispatcher.kick();
    }
}

#[cfg(test)]
mod tests {
    use pixelmill_core::types::format;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc;

    use crate::progress::reliable::OutboundDatagram;

    use super::*;
    use futures_util::StreamExt;

    fn job(id: u32, name: &str) -> JobPayload {
        JobPayload {
            image_id: JobId(id),
            file_name: name.to_string(),
            width: 8,
            height: 8,
            format: format::PNG,
            data: Bytes::from_static(b"in"),
        }
    }

    fn result(id: u32, name: &str) -> JobPayload {
        JobPayload {
            image_id: JobId(id),
            file_name: name.to_string(),
            width: 8,
            height: 8,
            format: format::PNG,
            data: Bytes::from_static(b"out"),
        }
    }

    fn dest() -> SocketAddr {
        "127.0.0.1:7403".parse().unwrap()
    }

    struct Harness {
        registry: Arc<JobRegistry>,
        dispatcher: Arc<Dispatcher>,
        progress_rx: mpsc::Receiver<OutboundDatagram>,
    }

    fn harness() -> Harness {
        let dispatcher = Arc::new(Dispatcher::new());
        let (progress, progress_rx) = ProgressHandle::test_handle(64);
        let registry = Arc::new(JobRegistry::new(
            Arc::clone(&dispatcher),
            progress,
            &DispatchConfig::default(),
        ));
        Harness {
            registry,
            dispatcher,
            progress_rx,
        }
    }

    fn client_pair() -> (Box<dyn ResultSink>, Framed<DuplexStream, FrameCodec>) {
        let (near, far) = duplex(1 << 20);
        (
            Box::new(Framed::new(near, FrameCodec::new())),
            Framed::new(far, FrameCodec::new()),
        )
    }

    async fn open_with_jobs(
        harness: &Harness,
        batch_id: u64,
        jobs: &[JobPayload],
    ) -> Framed<DuplexStream, FrameCodec> {
        let (sink, far) = client_pair();
        harness
            .registry
            .open_batch(
                BatchId(batch_id),
                u32::try_from(jobs.len()).unwrap(),
                sink,
                dest(),
            )
            .unwrap();
        for job in jobs {
            harness
                .registry
                .enqueue(BatchId(batch_id), job.clone())
                .await
                .unwrap();
        }
        far
    }

    #[tokio::test]
    async fn batch_delivers_exactly_n_results_then_closes() {
        let harness = harness();
        let jobs = [job(1, "a.png"), job(2, "b.png"), job(3, "c.png")];
        let mut far = open_with_jobs(&harness, 1, &jobs).await;

        // Workers complete independently; finish out of submission order.
        harness
            .registry
            .on_completed(JobId(2), result(2, "processed_b.png"))
            .await;
        harness
            .registry
            .on_completed(JobId(3), result(3, "processed_c.png"))
            .await;
        harness
            .registry
            .on_completed(JobId(1), result(1, "processed_a.png"))
            .await;

        let mut delivered = Vec::new();
        while let Some(frame) = far.next().await {
            match frame.unwrap() {
                Frame::DeliverResult(payload) => delivered.push(payload.image_id),
                other => panic!("unexpected frame {other:?}"),
            }
        }

        // The stream ended only after the third result: no loss, no
        // duplication, closed exactly once.
        assert_eq!(delivered.len(), 3);
        assert!(!harness.registry.has_batch(BatchId(1)));
        assert_eq!(harness.registry.active_jobs(), 0);
    }

    #[tokio::test]
    async fn progress_announced_on_every_transition() {
        let mut harness = harness();
        let _far = open_with_jobs(&harness, 1, &[job(1, "a.png")]).await;

        let lease = LeaseId::fresh_for_tests();
        harness
            .registry
            .begin_assignment(JobId(1), lease)
            .await
            .unwrap();
        assert_eq!(
            harness.registry.job_status(JobId(1)),
            Some(JobStatus::Processing)
        );
        assert_eq!(harness.registry.job_lease(JobId(1)), Some(lease));

        harness
            .registry
            .on_completed(JobId(1), result(1, "processed_a.png"))
            .await;

        let mut updates = Vec::new();
        while let Ok(msg) = harness.progress_rx.try_recv() {
            updates.push(ProgressUpdate::decode(&msg.payload).unwrap());
        }
        let statuses: Vec<JobStatus> = updates.iter().map(|u| u.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Queued,
                JobStatus::Processing,
                JobStatus::Completed
            ]
        );
        let last = updates.last().unwrap();
        assert_eq!((last.total, last.processed), (1, 1));
    }

    #[tokio::test]
    async fn failed_job_gets_sentinel_error_frame() {
        let harness = harness();
        let mut far = open_with_jobs(&harness, 1, &[job(1, "a.png"), job(2, "b.png")]).await;

        harness.registry.on_failed(JobId(1), "transform exploded").await;
        harness
            .registry
            .on_completed(JobId(2), result(2, "processed_b.png"))
            .await;

        let Frame::DeliverResult(first) = far.next().await.unwrap().unwrap() else {
            panic!("expected a result frame");
        };
        assert_eq!(first.file_name, "failed_a.png");
        assert!(first.data.is_empty());
        assert_eq!((first.width, first.height), (0, 0));

        let Frame::DeliverResult(second) = far.next().await.unwrap().unwrap() else {
            panic!("expected a result frame");
        };
        assert_eq!(second.image_id, JobId(2));

        // Error frames count toward completion like successes.
        assert!(far.next().await.is_none());
        assert!(!harness.registry.has_batch(BatchId(1)));
    }

    #[tokio::test]
    async fn failure_flagged_worker_result_routes_to_failure() {
        let harness = harness();
        let mut far = open_with_jobs(&harness, 1, &[job(1, "a.png")]).await;

        let flagged = JobPayload {
            data: Bytes::new(),
            width: 0,
            height: 0,
            ..job(1, "a.png")
        };
        harness.registry.on_result(JobId(1), flagged).await;

        let Frame::DeliverResult(frame) = far.next().await.unwrap().unwrap() else {
            panic!("expected a result frame");
        };
        assert_eq!(frame.file_name, "failed_a.png");
        assert!(frame.data.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_requeues_until_budget_exhausted() {
        let harness = harness();
        let mut far = open_with_jobs(&harness, 1, &[job(1, "a.png")]).await;

        let pending_before = harness.dispatcher.pending_jobs();
        harness
            .registry
            .begin_assignment(JobId(1), LeaseId::fresh_for_tests())
            .await
            .unwrap();
        harness.registry.on_transport_failure(JobId(1)).await;

        // Observable requeue: status reverts and the job is back in the
        // pending queue.
        assert_eq!(harness.registry.job_status(JobId(1)), Some(JobStatus::Queued));
        assert_eq!(harness.dispatcher.pending_jobs(), pending_before + 1);

        // Burn through the rest of the attempt budget.
        for _ in 0..2 {
            harness
                .registry
                .begin_assignment(JobId(1), LeaseId::fresh_for_tests())
                .await
                .unwrap();
            harness.registry.on_transport_failure(JobId(1)).await;
        }

        // Third fault exhausted the budget: terminal error frame delivered.
        let Frame::DeliverResult(frame) = far.next().await.unwrap().unwrap() else {
            panic!("expected a result frame");
        };
        assert!(frame.data.is_empty());
        assert_eq!(harness.registry.job_status(JobId(1)), None);
        assert!(!harness.registry.has_batch(BatchId(1)));
    }

    #[tokio::test]
    async fn delivery_error_still_advances_bookkeeping() {
        let harness = harness();
        let (sink, far) = client_pair();
        harness
            .registry
            .open_batch(BatchId(1), 1, sink, dest())
            .unwrap();
        harness
            .registry
            .enqueue(BatchId(1), job(1, "a.png"))
            .await
            .unwrap();
        drop(far); // client hangs up before the result lands

        harness
            .registry
            .on_completed(JobId(1), result(1, "processed_a.png"))
            .await;

        assert!(
            !harness.registry.has_batch(BatchId(1)),
            "batch completes despite the failed write"
        );
        assert_eq!(harness.registry.active_jobs(), 0);
    }

    #[tokio::test]
    async fn early_completion_cannot_drain_a_partially_registered_batch() {
        let harness = harness();
        let (sink, mut far) = client_pair();
        harness
            .registry
            .open_batch(BatchId(1), 2, sink, dest())
            .unwrap();

        // First job completes before the second is even registered.
        harness
            .registry
            .enqueue(BatchId(1), job(1, "a.png"))
            .await
            .unwrap();
        harness
            .registry
            .on_completed(JobId(1), result(1, "processed_a.png"))
            .await;
        assert!(
            harness.registry.has_batch(BatchId(1)),
            "batch must stay open until every declared job is accounted for"
        );

        harness
            .registry
            .enqueue(BatchId(1), job(2, "b.png"))
            .await
            .unwrap();
        harness
            .registry
            .on_completed(JobId(2), result(2, "processed_b.png"))
            .await;

        let mut delivered = 0;
        while let Some(frame) = far.next().await {
            assert!(matches!(frame.unwrap(), Frame::DeliverResult(_)));
            delivered += 1;
        }
        assert_eq!(delivered, 2);
        assert!(!harness.registry.has_batch(BatchId(1)));
    }

    #[tokio::test]
    async fn abort_discards_jobs_and_closes_the_client() {
        let harness = harness();
        let (sink, mut far) = client_pair();
        harness
            .registry
            .open_batch(BatchId(1), 2, sink, dest())
            .unwrap();
        harness
            .registry
            .enqueue(BatchId(1), job(1, "a.png"))
            .await
            .unwrap();

        harness.registry.abort_batch(BatchId(1)).await;

        assert!(!harness.registry.has_batch(BatchId(1)));
        assert_eq!(harness.registry.active_jobs(), 0);
        assert!(far.next().await.is_none(), "client stream closed");

        // The stale queued id is released without effect at assignment.
        assert!(harness
            .registry
            .begin_assignment(JobId(1), LeaseId::fresh_for_tests())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_batch_and_job_rejected() {
        let harness = harness();
        let (sink1, _far1) = client_pair();
        let (sink2, _far2) = client_pair();

        harness
            .registry
            .open_batch(BatchId(1), 2, sink1, dest())
            .unwrap();
        assert!(matches!(
            harness.registry.open_batch(BatchId(1), 2, sink2, dest()),
            Err(RegistryError::DuplicateBatch(_))
        ));

        harness
            .registry
            .enqueue(BatchId(1), job(1, "a.png"))
            .await
            .unwrap();
        assert!(matches!(
            harness.registry.enqueue(BatchId(1), job(1, "a.png")).await,
            Err(RegistryError::DuplicateJob(_))
        ));
        assert!(matches!(
            harness.registry.enqueue(BatchId(2), job(2, "b.png")).await,
            Err(RegistryError::UnknownBatch(_))
        ));
    }
}
