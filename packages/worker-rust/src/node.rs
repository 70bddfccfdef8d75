//! The worker service loop: read a job assignment, run the transform,
//! write the result, repeat.
//!
//! A worker holds exactly one connection to the coordinator and serves one
//! job at a time -- the coordinator's lease protocol never pipelines
//! assignments. Transform failures are reported as failure-flagged result
//! frames (empty payload, zero dimensions); they never kill the process.
//! Connection-level failures drop the connection, and the worker
//! reconnects after a fixed delay, indefinitely, until shutdown.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use pixelmill_core::traits::ImageTransform;
use pixelmill_core::wire::{Frame, FrameCodec, JobPayload, MessageKind, WireError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;

/// Errors that end one connection to the coordinator.
///
/// All of them are transport-level: the connection is dropped and the
/// reconnect loop takes over.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Framing or I/O failure on the connection.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The coordinator sent something other than a job assignment.
    #[error("expected a job assignment frame, received {0:?}")]
    UnexpectedFrame(MessageKind),
}

/// A worker node bound to one coordinator and one transform.
pub struct Worker {
    config: WorkerConfig,
    transform: Arc<dyn ImageTransform>,
}

impl Worker {
    /// Creates a worker. The transform is the pluggable pixel-level
    /// collaborator; the stock binary uses the passthrough transform.
    #[must_use]
    pub fn new(config: WorkerConfig, transform: Arc<dyn ImageTransform>) -> Self {
        Self { config, transform }
    }

    /// Connects to the coordinator and serves jobs until `shutdown` fires.
    ///
    /// On any connection failure -- connect refused, framing error, protocol
    /// violation, coordinator hangup -- the worker waits the configured
    /// reconnect delay and tries again.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the lifecycle contract of
    /// the coordinator's entry points.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.config.coordinator_addr.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(%addr, error = %err, "failed to disable send coalescing");
                    }
                    info!(%addr, "connected to coordinator");
                    match self.serve_connection(stream, &mut shutdown).await {
                        Ok(()) => debug!(%addr, "connection closed"),
                        Err(err) => warn!(%addr, error = %err, "connection lost"),
                    }
                }
                Err(err) => warn!(%addr, error = %err, "connect failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("worker shut down");
        Ok(())
    }

    /// Serves one connection until it closes, errors, or shutdown fires.
    async fn serve_connection<S>(
        &self,
        stream: S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ServeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, FrameCodec::new());

        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };

            let job = match frame {
                None => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(Frame::AssignJob(job))) => job,
                Some(Ok(other)) => return Err(ServeError::UnexpectedFrame(other.kind())),
            };

            debug!(job = %job.image_id, file = %job.file_name, "job assigned");
            let result = self.process(job).await;
            framed.send(Frame::JobResult(result)).await?;
        }
    }

    /// Runs the transform on a blocking thread and builds the result frame.
    async fn process(&self, job: JobPayload) -> JobPayload {
        let transform = Arc::clone(&self.transform);
        let input = job.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            transform.apply(&input.data, input.format, input.width, input.height)
        })
        .await;

        match outcome {
            Ok(Ok(out)) => {
                metrics::counter!("pixelmill_worker_jobs_processed_total").increment(1);
                JobPayload {
                    image_id: job.image_id,
                    file_name: format!("processed_{}", job.file_name),
                    width: out.width,
                    height: out.height,
                    format: job.format,
                    data: out.data,
                }
            }
            Ok(Err(err)) => {
                warn!(job = %job.image_id, error = %err, "transform failed");
                failure_flagged(job)
            }
            Err(err) => {
                // A panicking transform fails its job, not the process.
                warn!(job = %job.image_id, error = %err, "transform panicked");
                failure_flagged(job)
            }
        }
    }
}

/// Result frame reporting a terminal transform failure: empty payload,
/// zero dimensions, file name unchanged.
fn failure_flagged(job: JobPayload) -> JobPayload {
    metrics::counter!("pixelmill_worker_jobs_failed_total").increment(1);
    JobPayload {
        image_id: job.image_id,
        file_name: job.file_name,
        width: 0,
        height: 0,
        format: job.format,
        data: Bytes::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pixelmill_core::traits::{PassthroughTransform, TransformError, TransformedImage};
    use pixelmill_core::types::{format, JobId};
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;

    use super::*;

    struct FailingTransform;

    impl ImageTransform for FailingTransform {
        fn apply(
            &self,
            _data: &[u8],
            format: u32,
            _width: u32,
            _height: u32,
        ) -> Result<TransformedImage, TransformError> {
            Err(TransformError::UnsupportedFormat(format))
        }
    }

    struct PanickingTransform;

    impl ImageTransform for PanickingTransform {
        fn apply(
            &self,
            _data: &[u8],
            _format: u32,
            _width: u32,
            _height: u32,
        ) -> Result<TransformedImage, TransformError> {
            panic!("pixel buffer corrupted")
        }
    }

    fn job(id: u32, name: &str) -> JobPayload {
        JobPayload {
            image_id: JobId(id),
            file_name: name.to_string(),
            width: 32,
            height: 32,
            format: format::BMP,
            data: Bytes::from_static(b"bitmap"),
        }
    }

    fn worker(transform: Arc<dyn ImageTransform>) -> Worker {
        Worker::new(WorkerConfig::default(), transform)
    }

    /// Drives `serve_connection` over an in-memory stream; returns the
    /// coordinator-side framed handle.
    fn spawn_serving(
        transform: Arc<dyn ImageTransform>,
    ) -> (
        Framed<DuplexStream, FrameCodec>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<Result<(), ServeError>>,
    ) {
        let (near, far) = duplex(1 << 16);
        let (stop, mut shutdown) = watch::channel(false);
        let task = tokio::spawn(async move {
            worker(transform)
                .serve_connection(near, &mut shutdown)
                .await
        });
        (Framed::new(far, FrameCodec::new()), stop, task)
    }

    #[tokio::test]
    async fn serves_jobs_until_the_coordinator_hangs_up() {
        let (mut coordinator, _stop, task) = spawn_serving(Arc::new(PassthroughTransform));

        for id in 1..=2 {
            coordinator
                .send(Frame::AssignJob(job(id, "cat.png")))
                .await
                .unwrap();
            let Frame::JobResult(result) = coordinator.next().await.unwrap().unwrap() else {
                panic!("expected a result frame");
            };
            assert_eq!(result.image_id, JobId(id));
            assert_eq!(result.file_name, "processed_cat.png");
            assert_eq!(result.data.as_ref(), b"bitmap");
            assert_eq!((result.width, result.height), (32, 32));
        }

        drop(coordinator);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn transform_failure_reports_a_flagged_result() {
        let (mut coordinator, _stop, task) = spawn_serving(Arc::new(FailingTransform));

        coordinator
            .send(Frame::AssignJob(job(5, "cat.png")))
            .await
            .unwrap();
        let Frame::JobResult(result) = coordinator.next().await.unwrap().unwrap() else {
            panic!("expected a result frame");
        };
        assert_eq!(result.image_id, JobId(5));
        assert_eq!(result.file_name, "cat.png", "file name stays unchanged");
        assert!(result.is_failure_flagged());
        assert_eq!((result.width, result.height), (0, 0));

        drop(coordinator);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn panicking_transform_fails_the_job_not_the_worker() {
        let (mut coordinator, _stop, task) = spawn_serving(Arc::new(PanickingTransform));

        coordinator
            .send(Frame::AssignJob(job(9, "boom.png")))
            .await
            .unwrap();
        let Frame::JobResult(result) = coordinator.next().await.unwrap().unwrap() else {
            panic!("expected a result frame");
        };
        assert!(result.is_failure_flagged());

        // The connection is still serviceable afterwards.
        drop(coordinator);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unexpected_frame_aborts_the_connection() {
        let (mut coordinator, _stop, task) = spawn_serving(Arc::new(PassthroughTransform));

        coordinator
            .send(Frame::JobResult(job(1, "cat.png")))
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ServeError::UnexpectedFrame(MessageKind::JobResult)
        ));
    }

    #[tokio::test]
    async fn shutdown_ends_an_idle_connection() {
        let (coordinator, stop, task) = spawn_serving(Arc::new(PassthroughTransform));

        stop.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
        drop(coordinator);
    }

    #[tokio::test]
    async fn reconnects_after_the_coordinator_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let worker = Worker::new(
            WorkerConfig {
                coordinator_addr: addr.to_string(),
                reconnect_delay: Duration::from_millis(10),
            },
            Arc::new(PassthroughTransform),
        );
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(async move { worker.run(shutdown).await });

        // First connection is dropped immediately; the worker must come back.
        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        let (_second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("worker reconnected")
            .unwrap();

        stop.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}
