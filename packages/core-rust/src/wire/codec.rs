//! Length-delimited frame codec for stream connections.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{BatchFrame, JobPayload, MessageKind, WireError, HEADER_LEN, MAX_PAYLOAD_LEN};

/// A complete streamed message: type tag, payload length, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Coordinator hands a job to a worker (tag 2).
    AssignJob(JobPayload),
    /// Worker returns a job result (tag 3).
    JobResult(JobPayload),
    /// Coordinator streams a finished result to the client (tag 4).
    DeliverResult(JobPayload),
    /// Client submits a batch (tag 6).
    SubmitBatch(BatchFrame),
}

impl Frame {
    /// Message kind of this frame.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::AssignJob(_) => MessageKind::AssignJob,
            Frame::JobResult(_) => MessageKind::JobResult,
            Frame::DeliverResult(_) => MessageKind::DeliverResult,
            Frame::SubmitBatch(_) => MessageKind::SubmitBatch,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::AssignJob(job) | Frame::JobResult(job) | Frame::DeliverResult(job) => {
                job.encoded_len()
            }
            Frame::SubmitBatch(batch) => batch.encoded_len(),
        }
    }
}

/// Codec turning a byte stream into [`Frame`]s and back.
///
/// Decoding rejects unknown tags and corrupt declared lengths *before*
/// buffering the payload, so a garbage peer cannot force a large
/// allocation. Incomplete frames yield `None` until enough bytes arrive;
/// a short read at EOF surfaces as an error from the framed stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates the codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);

        // Validate the header before waiting for (or allocating) the payload.
        let kind = MessageKind::from_tag(tag).ok_or(WireError::UnknownTag(tag))?;
        if len > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge {
                len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let total = HEADER_LEN + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut payload: Bytes = src.split_to(len as usize).freeze();

        let frame = match kind {
            MessageKind::AssignJob => Frame::AssignJob(JobPayload::decode(&mut payload)?),
            MessageKind::JobResult => Frame::JobResult(JobPayload::decode(&mut payload)?),
            MessageKind::DeliverResult => Frame::DeliverResult(JobPayload::decode(&mut payload)?),
            MessageKind::SubmitBatch => {
                return Ok(Some(Frame::SubmitBatch(BatchFrame::decode(&mut payload)?)))
            }
        };

        if payload.has_remaining() {
            return Err(WireError::TrailingBytes(payload.remaining()));
        }
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let len = frame.payload_len();
        let len32 = u32::try_from(len).map_err(|_| WireError::PayloadTooLarge {
            len: u32::MAX,
            max: MAX_PAYLOAD_LEN,
        })?;
        if len32 > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge {
                len: len32,
                max: MAX_PAYLOAD_LEN,
            });
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u32_le(frame.kind().tag());
        dst.put_u32_le(len32);
        match &frame {
            Frame::AssignJob(job) | Frame::JobResult(job) | Frame::DeliverResult(job) => {
                job.encode_into(dst);
            }
            Frame::SubmitBatch(batch) => batch.encode_into(dst),
        }
        Ok(())
    }
}
