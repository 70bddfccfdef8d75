//! Coordinator module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates shared state,
//! `start()` binds the two TCP listeners and the UDP socket, and `serve()`
//! runs the accept loops. The separation lets callers learn the actual
//! bound ports (port 0 is supported) and wire collaborators in between.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use pixelmill_core::wire::{Frame, FrameCodec};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, LeaseConfig};
use crate::dispatch::{spawn_assignment_pump, Dispatcher, JobRegistry, Lease, TcpWorkerLease};
use crate::progress::ReliableDatagramSender;

use super::shutdown::{ConnectionGuard, ShutdownController};

/// How long `serve()` waits for in-flight connection handlers after the
/// shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Ports actually bound by [`Coordinator::start`].
///
/// These may differ from the configured ports when port 0 was requested
/// (OS-assigned ephemeral ports).
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorPorts {
    /// Worker ingress (TCP).
    pub worker: u16,
    /// Client ingress (TCP).
    pub client: u16,
    /// Local port of the progress UDP socket.
    pub progress: u16,
}

struct Bound {
    worker_listener: TcpListener,
    client_listener: TcpListener,
    registry: Arc<JobRegistry>,
    ports: CoordinatorPorts,
}

/// The coordinator: accepts worker and client connections, fans jobs out,
/// and streams results and progress back.
///
/// Lifecycle:
/// 1. `new()` -- allocates the dispatcher and shutdown controller
/// 2. `start()` -- binds both TCP listeners and the UDP socket, spawns the
///    reliable progress sender and the assignment pump
/// 3. `serve()` -- accepts connections until the shutdown future resolves,
///    then drains
pub struct Coordinator {
    config: CoordinatorConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownController>,
    bound: Option<Bound>,
}

impl Coordinator {
    /// Creates a coordinator without binding any port.
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            shutdown: Arc::new(ShutdownController::new()),
            bound: None,
        }
    }

    /// Returns a shared reference to the dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Returns the job registry once `start()` has created it.
    #[must_use]
    pub fn registry(&self) -> Option<Arc<JobRegistry>> {
        self.bound.as_ref().map(|b| Arc::clone(&b.registry))
    }

    /// Binds both TCP listeners and the progress UDP socket, spawns the
    /// reliable datagram sender and the assignment pump.
    ///
    /// Returns the actual bound ports.
    ///
    /// # Errors
    ///
    /// Returns an error when an address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<CoordinatorPorts> {
        let host = &self.config.host;

        let worker_listener =
            TcpListener::bind(format!("{host}:{}", self.config.worker_port)).await?;
        let client_listener =
            TcpListener::bind(format!("{host}:{}", self.config.client_port)).await?;
        let udp = UdpSocket::bind(format!("{host}:0")).await?;

        let ports = CoordinatorPorts {
            worker: worker_listener.local_addr()?.port(),
            client: client_listener.local_addr()?.port(),
            progress: udp.local_addr()?.port(),
        };
        info!(
            worker = ports.worker,
            client = ports.client,
            progress = ports.progress,
            host,
            "coordinator listeners bound"
        );

        let (progress, _sender_task) =
            ReliableDatagramSender::spawn(Arc::new(udp), self.config.progress.clone());
        let registry = Arc::new(JobRegistry::new(
            Arc::clone(&self.dispatcher),
            progress,
            &self.config.dispatch,
        ));
        spawn_assignment_pump(
            Arc::clone(&self.dispatcher),
            Arc::clone(&registry),
            self.shutdown.subscribe(),
        );

        self.bound = Some(Bound {
            worker_listener,
            client_listener,
            registry,
            ports,
        });
        Ok(ports)
    }

    /// Accepts worker and client connections until `shutdown` resolves,
    /// then drains in-flight connection handlers.
    ///
    /// # Errors
    ///
    /// Currently infallible after a successful `start()`; the `Result`
    /// mirrors the lifecycle contract of the other entry points.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let bound = self.bound.expect("start() must be called before serve()");
        let shutdown_ctrl = self.shutdown;

        let trigger = Arc::clone(&shutdown_ctrl);
        tokio::spawn(async move {
            shutdown.await;
            trigger.trigger();
        });

        shutdown_ctrl.set_serving();
        info!("coordinator serving");

        tokio::join!(
            accept_workers(
                bound.worker_listener,
                Arc::clone(&self.dispatcher),
                self.config.lease.clone(),
                shutdown_ctrl.subscribe(),
            ),
            accept_clients(
                bound.client_listener,
                Arc::clone(&bound.registry),
                self.config.client_progress_port,
                Arc::clone(&shutdown_ctrl),
            ),
        );

        if shutdown_ctrl.wait_for_drain(DRAIN_TIMEOUT).await {
            info!("all connection handlers drained");
        } else {
            warn!("drain timeout expired with connection handlers still running");
        }
        Ok(())
    }
}

/// Resolves once the shutdown signal has fired.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Worker-facing accept loop: every connection becomes a registered lease.
///
/// The lease owns its socket outright; nothing is spawned here. A dead
/// worker is discovered at its next round trip, which deregisters the
/// lease and requeues the job it held.
async fn accept_workers(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    lease_config: LeaseConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    // Round trips are latency-bound request/response pairs;
                    // coalescing delay would serialize them behind the clock.
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(%peer, error = %err, "failed to disable send coalescing");
                    }
                    let lease = Arc::new(TcpWorkerLease::new(stream, &lease_config));
                    info!(%peer, lease = %lease.id(), "worker connected");
                    dispatcher.register(lease);
                }
                Err(err) => {
                    warn!(error = %err, "worker accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            () = signalled(&mut shutdown) => break,
        }
    }
    debug!("worker accept loop exiting");
}

/// Client-facing accept loop: each connection gets a one-shot handler task.
async fn accept_clients(
    listener: TcpListener,
    registry: Arc<JobRegistry>,
    progress_port: u16,
    shutdown_ctrl: Arc<ShutdownController>,
) {
    let mut shutdown = shutdown_ctrl.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let guard = shutdown_ctrl.connection_guard();
                    tokio::spawn(handle_client(
                        stream,
                        peer,
                        Arc::clone(&registry),
                        progress_port,
                        guard,
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "client accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            () = signalled(&mut shutdown) => break,
        }
    }
    debug!("client accept loop exiting");
}

/// One-shot client handler: reads exactly one batch-submit frame, hands
/// every contained job to the registry, and returns.
///
/// The connection is retained by the registry, which writes each result
/// onto it as jobs complete and closes it when the batch drains. Any
/// framing or protocol error here aborts the connection; nothing at this
/// boundary is retried.
async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<JobRegistry>,
    progress_port: u16,
    _guard: ConnectionGuard,
) {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let batch = match framed.next().await {
        Some(Ok(Frame::SubmitBatch(batch))) => batch,
        Some(Ok(other)) => {
            warn!(%peer, kind = ?other.kind(), "client sent a non-batch frame, aborting");
            return;
        }
        Some(Err(err)) => {
            warn!(%peer, error = %err, "client framing error, aborting");
            return;
        }
        None => {
            debug!(%peer, "client disconnected before submitting");
            return;
        }
    };

    if batch.jobs.is_empty() {
        warn!(%peer, batch = %batch.batch_id, "empty batch, closing connection");
        return;
    }

    let batch_id = batch.batch_id;
    let progress_dest = SocketAddr::new(peer.ip(), progress_port);
    #[allow(clippy::cast_possible_truncation)]
    let expected = batch.jobs.len() as u32;
    if let Err(err) = registry.open_batch(batch_id, expected, Box::new(framed), progress_dest) {
        warn!(%peer, error = %err, "batch rejected");
        return;
    }
    info!(%peer, batch = %batch_id, jobs = expected, "batch accepted");

    for job in batch.jobs {
        if let Err(err) = registry.enqueue(batch_id, job).await {
            // A batch with an unregistrable job can never drain; tear the
            // whole submission down rather than leak it.
            warn!(batch = %batch_id, error = %err, "malformed batch, aborting");
            registry.abort_batch(batch_id).await;
            return;
        }
    }
}
