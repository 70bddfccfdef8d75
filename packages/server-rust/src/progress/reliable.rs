//! Sequence-numbered, acknowledgment-retried datagram sender.
//!
//! A single background task drains a bounded FIFO of (payload, destination)
//! pairs. Each dequeued payload gets the next sequence number prepended,
//! is sent, and is resent on acknowledgment timeout up to the attempt
//! budget. Sends are serialized, never pipelined: one payload is delivered
//! or abandoned before the next is started.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use pixelmill_core::wire::ProgressUpdate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ProgressConfig;

use super::transport::DatagramTransport;

/// Byte length of the sequence number prepended to every datagram.
pub const SEQ_LEN: usize = 4;

/// One queued payload and where to send it.
#[derive(Debug)]
pub(crate) struct OutboundDatagram {
    pub(crate) payload: Bytes,
    pub(crate) dest: SocketAddr,
}

/// Cloneable producer handle onto the reliable channel's queue.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: mpsc::Sender<OutboundDatagram>,
}

impl ProgressHandle {
    /// Enqueues one progress update for reliable delivery.
    ///
    /// Never blocks. When the queue is full or the sender task has exited
    /// the update is dropped with a warning: progress is advisory and no
    /// error reaches the caller.
    pub fn publish(&self, update: &ProgressUpdate, dest: SocketAddr) {
        let msg = OutboundDatagram {
            payload: update.encode(),
            dest,
        };
        if self.tx.try_send(msg).is_err() {
            metrics::counter!("pixelmill_progress_dropped_total").increment(1);
            warn!(%dest, job = %update.image_id, "progress queue full or closed, dropping update");
        }
    }

    /// Handle wired to a bare queue, for exercising producers without a
    /// sender task.
    #[cfg(test)]
    pub(crate) fn test_handle(capacity: usize) -> (Self, mpsc::Receiver<OutboundDatagram>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// The background sender half of the reliable datagram channel.
pub struct ReliableDatagramSender {
    transport: Arc<dyn DatagramTransport>,
    config: ProgressConfig,
    sequence: u32,
}

impl ReliableDatagramSender {
    /// Spawns the sender task over `transport`.
    ///
    /// Returns the producer handle and the task's join handle. The task
    /// exits once every `ProgressHandle` clone has been dropped.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn DatagramTransport>,
        config: ProgressConfig,
    ) -> (ProgressHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let sender = Self {
            transport,
            config,
            sequence: 0,
        };
        let handle = tokio::spawn(sender.run(rx));
        (ProgressHandle { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<OutboundDatagram>) {
        while let Some(msg) = rx.recv().await {
            self.deliver(&msg).await;
        }
        debug!("reliable datagram sender exiting: all producers dropped");
    }

    /// Sends one payload with the retry ladder, then returns regardless of
    /// outcome.
    async fn deliver(&mut self, msg: &OutboundDatagram) {
        self.sequence = self.sequence.wrapping_add(1);
        let seq = self.sequence;

        let mut packet = BytesMut::with_capacity(SEQ_LEN + msg.payload.len());
        packet.put_u32_le(seq);
        packet.extend_from_slice(&msg.payload);
        let packet = packet.freeze();

        for attempt in 1..=self.config.max_attempts {
            if let Err(err) = self.transport.send_to(&packet, msg.dest).await {
                // A failed send consumes an attempt like an unacknowledged one.
                warn!(seq, attempt, error = %err, "datagram send failed");
                continue;
            }
            if self.await_ack(seq).await {
                debug!(seq, attempt, dest = %msg.dest, "progress datagram acknowledged");
                return;
            }
        }

        metrics::counter!("pixelmill_progress_dropped_total").increment(1);
        warn!(
            seq,
            dest = %msg.dest,
            attempts = self.config.max_attempts,
            "progress datagram never acknowledged, dropping"
        );
    }

    /// Waits up to the acknowledgment timeout for an ack matching `seq`.
    ///
    /// Acknowledgments for other sequence numbers (stale retries) are
    /// drained and ignored within the window.
    async fn await_ack(&self, seq: u32) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.ack_timeout;
        let mut buf = [0u8; 16];

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, self.transport.recv_from(&mut buf)).await {
                Ok(Ok((n, _))) if n >= SEQ_LEN => {
                    let ack = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    if ack == seq {
                        return true;
                    }
                }
                Ok(Ok(_)) => {} // runt datagram, ignore
                Ok(Err(err)) => {
                    warn!(seq, error = %err, "acknowledgment receive failed");
                    return false;
                }
                Err(_) => return false, // window expired
            }
        }
    }
}
