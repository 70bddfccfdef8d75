//! Progress telemetry over an acknowledged datagram channel.
//!
//! Progress delivery is advisory: it never sits on the job-success path,
//! and every failure mode here ends in a logged drop, not an error
//! surfaced to the producer.

pub mod reliable;
pub mod responder;
pub mod transport;

pub use reliable::{ProgressHandle, ReliableDatagramSender, SEQ_LEN};
pub use responder::{ProgressReceiver, ProgressRecvError};
pub use transport::DatagramTransport;
