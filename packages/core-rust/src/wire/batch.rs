//! Batch submission payload: a client's "process all of these" message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::BatchId;

use super::{take_u32, take_u64, JobPayload, WireError};

/// Payload of a batch-submit frame.
///
/// Layout: `batchId(8) | jobCount(4)` followed by `jobCount` repetitions of
/// the [`JobPayload`] fields without any per-job wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFrame {
    /// Client-chosen batch identity; every contained job maps back to it.
    pub batch_id: BatchId,
    /// The jobs, in submission order.
    pub jobs: Vec<JobPayload>,
}

impl BatchFrame {
    /// Encoded byte length of this payload (without the frame header).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        8 + 4 + self.jobs.iter().map(JobPayload::encoded_len).sum::<usize>()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u64_le(self.batch_id.0);
        dst.put_u32_le(self.jobs.len() as u32);
        for job in &self.jobs {
            job.encode_into(dst);
        }
    }

    /// Decodes a batch payload, consuming all of `buf`.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when a contained record is malformed, when
    /// the declared job count exceeds the bytes available, or when bytes
    /// remain after the last declared job (the declared payload length is
    /// inconsistent with its contents).
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let batch_id = BatchId(take_u64(buf)?);
        let count = take_u32(buf)?;

        // Each job record is at least 24 bytes of fixed fields, so a count
        // larger than the remaining bytes can be rejected without looping.
        if count as usize > buf.remaining() {
            return Err(WireError::Truncated);
        }

        let mut jobs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            jobs.push(JobPayload::decode(buf)?);
        }

        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }

        Ok(Self { batch_id, jobs })
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{format, JobId};

    use super::*;

    fn job(id: u32, name: &str, data: &'static [u8]) -> JobPayload {
        JobPayload {
            image_id: JobId(id),
            file_name: name.to_string(),
            width: 32,
            height: 32,
            format: format::BMP,
            data: Bytes::from_static(data),
        }
    }

    fn encode(frame: &BatchFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf);
        buf
    }

    #[test]
    fn round_trip_three_jobs() {
        let frame = BatchFrame {
            batch_id: BatchId(42),
            jobs: vec![job(1, "a.png", b"aa"), job(2, "b.png", b"bb"), job(3, "", b"")],
        };
        let buf = encode(&frame);
        assert_eq!(buf.len(), frame.encoded_len());
        let decoded = BatchFrame::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_empty_batch() {
        let frame = BatchFrame {
            batch_id: BatchId(u64::MAX),
            jobs: Vec::new(),
        };
        let decoded = BatchFrame::decode(&mut encode(&frame).freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn declared_count_beyond_bytes_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(1);
        buf.put_u32_le(50_000); // claims 50k jobs, no bytes follow
        assert!(matches!(
            BatchFrame::decode(&mut buf.freeze()),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let frame = BatchFrame {
            batch_id: BatchId(9),
            jobs: vec![job(1, "x.jpg", b"data")],
        };
        let mut buf = encode(&frame);
        buf.put_u8(0xAB);
        assert!(matches!(
            BatchFrame::decode(&mut buf.freeze()),
            Err(WireError::TrailingBytes(1))
        ));
    }

    #[test]
    fn truncated_mid_job_rejected() {
        let frame = BatchFrame {
            batch_id: BatchId(9),
            jobs: vec![job(1, "x.jpg", b"0123456789")],
        };
        let mut buf = encode(&frame);
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            BatchFrame::decode(&mut buf.freeze()),
            Err(WireError::Truncated)
        ));
    }
}
