//! Receiving side of the reliable datagram channel.
//!
//! Used by clients (and tests) to consume progress telemetry. The
//! acknowledgment is sent back *before* the payload is decoded, so the
//! sender's retry clock stops as early as possible.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use pixelmill_core::wire::{ProgressUpdate, WireError};
use thiserror::Error;

use super::reliable::SEQ_LEN;
use super::transport::DatagramTransport;

/// Errors raised while receiving a progress datagram.
#[derive(Debug, Error)]
pub enum ProgressRecvError {
    /// Underlying transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The datagram is shorter than a sequence number.
    #[error("datagram shorter than a sequence number ({0} bytes)")]
    Runt(usize),

    /// The payload after the sequence number is malformed.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Consumes sequence-prefixed progress datagrams and acknowledges each one.
pub struct ProgressReceiver {
    transport: Arc<dyn DatagramTransport>,
}

impl ProgressReceiver {
    /// Creates a receiver over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn DatagramTransport>) -> Self {
        Self { transport }
    }

    /// Receives one progress update, acknowledging its sequence number
    /// immediately.
    ///
    /// A malformed payload is still acknowledged (the bytes did arrive);
    /// the decode error is returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressRecvError`] on transport failure, a datagram too
    /// short to carry a sequence number, or a malformed payload.
    pub async fn recv(&self) -> Result<(ProgressUpdate, SocketAddr), ProgressRecvError> {
        let mut buf = vec![0u8; 64 * 1024];
        let (len, from) = self.transport.recv_from(&mut buf).await?;

        if len < SEQ_LEN {
            return Err(ProgressRecvError::Runt(len));
        }

        // Echo the sequence number back before any further processing.
        self.transport.send_to(&buf[..SEQ_LEN], from).await?;

        let update = ProgressUpdate::decode(&buf[SEQ_LEN..len])?;
        Ok((update, from))
    }
}
