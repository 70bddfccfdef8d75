//! Binary wire formats shared by every pixelmill connection.
//!
//! Every streamed message is a *frame*:
//!
//! ```text
//! +---------------+---------------+=======================+
//! |  type tag (4) | payload len(4)|  payload (len bytes)  |
//! +---------------+---------------+=======================+
//! ```
//!
//! All multi-byte integers are **little-endian**, fixed width. Type tags:
//!
//! | tag | meaning                         | direction            |
//! |-----|---------------------------------|----------------------|
//! | 1   | reserved (legacy single-image submit, not part of this protocol) |
//! | 2   | job assignment                  | coordinator -> worker |
//! | 3   | job result                      | worker -> coordinator |
//! | 4   | result delivery                 | coordinator -> client |
//! | 5   | progress (datagram-only, carries no stream framing)              |
//! | 6   | batch submit                    | client -> coordinator |
//!
//! Progress updates travel as UDP datagrams with no tag or length wrapper;
//! the datagram boundary delimits them. The reliable-delivery layer prepends
//! its own 4-byte sequence number, which is not part of this module.
//!
//! Decoding validates every declared length against the bytes actually
//! available (and against [`MAX_PAYLOAD_LEN`]) before allocating, and either
//! consumes exactly the declared bytes or fails -- partially-filled results
//! are never returned.

mod batch;
mod codec;
mod job;
mod progress;

pub use batch::BatchFrame;
pub use codec::{Frame, FrameCodec};
pub use job::JobPayload;
pub use progress::ProgressUpdate;

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Byte length of the tag + length frame header.
pub const HEADER_LEN: usize = 8;

/// Upper bound on a declared frame payload length. Frames claiming more
/// are treated as corrupt and abort the connection.
pub const MAX_PAYLOAD_LEN: u32 = 100_000_000;

/// Upper bound on a declared file name length within a frame.
pub const MAX_FILE_NAME_LEN: u32 = 1024;

/// Message type tags for streamed frames.
///
/// Numeric values are fixed by the wire protocol; see the module docs for
/// the tags (1 and 5) that never appear on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Coordinator hands a job to a worker.
    AssignJob,
    /// Worker returns the (possibly failure-flagged) result of a job.
    JobResult,
    /// Coordinator streams a finished result back to the client.
    DeliverResult,
    /// Client submits a batch of jobs.
    SubmitBatch,
}

impl MessageKind {
    /// Wire tag for this kind.
    #[must_use]
    pub fn tag(self) -> u32 {
        match self {
            MessageKind::AssignJob => 2,
            MessageKind::JobResult => 3,
            MessageKind::DeliverResult => 4,
            MessageKind::SubmitBatch => 6,
        }
    }

    /// Parses a wire tag. Returns `None` for tags that are unknown or
    /// never valid on a stream connection.
    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            2 => Some(MessageKind::AssignJob),
            3 => Some(MessageKind::JobResult),
            4 => Some(MessageKind::DeliverResult),
            6 => Some(MessageKind::SubmitBatch),
            _ => None,
        }
    }
}

/// Errors raised while encoding or decoding wire messages.
///
/// Every variant except `Io` indicates a malformed or corrupt peer; the
/// owning connection is aborted, never retried at this layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying transport failure surfaced through the codec.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A declared length exceeds the bytes actually available.
    #[error("truncated message: declared length exceeds available bytes")]
    Truncated,

    /// The frame header carries a tag this protocol does not use on streams.
    #[error("unknown message type tag {0}")]
    UnknownTag(u32),

    /// The declared payload length is beyond the corruption guard.
    #[error("declared payload length {len} exceeds the {max} byte limit")]
    PayloadTooLarge { len: u32, max: u32 },

    /// A declared file name length is outside `0..=1024`.
    #[error("file name length {0} outside the allowed 0..=1024 range")]
    FileNameTooLong(u32),

    /// A text field did not decode as UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// A progress datagram carried a status code outside the table.
    #[error("unknown job status code {0}")]
    UnknownStatus(u32),

    /// The payload declared more bytes than its fields account for.
    #[error("{0} trailing bytes after decoding frame payload")]
    TrailingBytes(usize),
}

// Checked little-endian reads. `bytes::Buf` getters panic on underflow,
// so every field read goes through these.

pub(crate) fn take_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn take_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64_le())
}

pub(crate) fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(buf.split_to(len))
}

pub(crate) fn take_string(
    buf: &mut Bytes,
    len: usize,
    field: &'static str,
) -> Result<String, WireError> {
    let raw = take_bytes(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}
