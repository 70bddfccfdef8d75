//! Datagram transport seam.
//!
//! The reliable channel and the responder talk to this trait instead of a
//! socket so their retry and acknowledgment behavior is testable without
//! touching the network.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// An unreliable, connectionless message transport.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Sends one datagram to `dest`.
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Receives one datagram, returning its length and origin.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, dest).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}
