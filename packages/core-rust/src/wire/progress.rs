//! Progress datagram payload.
//!
//! Progress travels over UDP, so there is no outer tag or length -- the
//! datagram boundary delimits the message. The reliable-delivery layer
//! prepends its own 4-byte sequence number before transmission.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{JobId, JobStatus};

use super::{take_string, take_u32, WireError, MAX_FILE_NAME_LEN};

/// One job status notification, carrying batch-relative counters.
///
/// Layout: `imageId(4) | fileNameLength(4) | fileNameBytes | totalImages(4)
/// | processedImages(4) | status(4) | infoLength(4) | infoBytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// The job this update is about.
    pub image_id: JobId,
    /// File name the client keys notifications on.
    pub file_name: String,
    /// Total jobs in the owning batch.
    pub total: u32,
    /// Jobs of the owning batch processed so far.
    pub processed: u32,
    /// New status of the job.
    pub status: JobStatus,
    /// Free-form detail (worker label, failure reason), possibly empty.
    pub info: String,
}

impl ProgressUpdate {
    /// Encodes this update into a fresh datagram payload.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            4 + 4 + self.file_name.len() + 4 + 4 + 4 + 4 + self.info.len(),
        );
        buf.put_u32_le(self.image_id.0);
        buf.put_u32_le(self.file_name.len() as u32);
        buf.put_slice(self.file_name.as_bytes());
        buf.put_u32_le(self.total);
        buf.put_u32_le(self.processed);
        buf.put_u32_le(self.status.as_code());
        buf.put_u32_le(self.info.len() as u32);
        buf.put_slice(self.info.as_bytes());
        buf.freeze()
    }

    /// Decodes a datagram payload (sequence number already stripped).
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] on truncation, an out-of-range file name
    /// length, a status code outside the table, or trailing bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut buf = Bytes::copy_from_slice(payload);

        let image_id = JobId(take_u32(&mut buf)?);

        let name_len = take_u32(&mut buf)?;
        if name_len > MAX_FILE_NAME_LEN {
            return Err(WireError::FileNameTooLong(name_len));
        }
        let file_name = take_string(&mut buf, name_len as usize, "file name")?;

        let total = take_u32(&mut buf)?;
        let processed = take_u32(&mut buf)?;

        let code = take_u32(&mut buf)?;
        let status = JobStatus::from_code(code).ok_or(WireError::UnknownStatus(code))?;

        let info_len = take_u32(&mut buf)?;
        let info = take_string(&mut buf, info_len as usize, "info")?;

        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            image_id,
            file_name,
            total,
            processed,
            status,
            info,
        })
    }
}
