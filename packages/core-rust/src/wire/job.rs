//! The image record shared by job assignment, job result, and result
//! delivery frames.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::JobId;

use super::{take_bytes, take_string, take_u32, WireError, MAX_FILE_NAME_LEN, MAX_PAYLOAD_LEN};

/// One image unit of work as it travels on the wire.
///
/// Layout: `imageId(4) | fileNameLength(4) | fileNameBytes | width(4) |
/// height(4) | format(4) | dataLength(4) | imageBytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPayload {
    /// Client-assigned job identity; results correlate on this.
    pub image_id: JobId,
    /// File name the client keys results and progress on.
    pub file_name: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Image format code (see [`crate::types::format`]).
    pub format: u32,
    /// Encoded image bytes. Zero-length in a *result* frame flags a
    /// worker-side transform failure for this job.
    pub data: Bytes,
}

impl JobPayload {
    /// Encoded byte length of this record (without any frame header).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + 4 + self.file_name.len() + 4 + 4 + 4 + 4 + self.data.len()
    }

    /// Whether a result frame carrying this payload flags a transform
    /// failure rather than a transformed image.
    #[must_use]
    pub fn is_failure_flagged(&self) -> bool {
        self.data.is_empty()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32_le(self.image_id.0);
        dst.put_u32_le(self.file_name.len() as u32);
        dst.put_slice(self.file_name.as_bytes());
        dst.put_u32_le(self.width);
        dst.put_u32_le(self.height);
        dst.put_u32_le(self.format);
        dst.put_u32_le(self.data.len() as u32);
        dst.put_slice(&self.data);
    }

    /// Decodes one image record, consuming exactly its bytes from `buf`.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when a declared length is out of bounds or
    /// exceeds the bytes available.
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let image_id = JobId(take_u32(buf)?);

        let name_len = take_u32(buf)?;
        if name_len > MAX_FILE_NAME_LEN {
            return Err(WireError::FileNameTooLong(name_len));
        }
        let file_name = take_string(buf, name_len as usize, "file name")?;

        let width = take_u32(buf)?;
        let height = take_u32(buf)?;
        let format = take_u32(buf)?;

        let data_len = take_u32(buf)?;
        if data_len > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge {
                len: data_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let data = take_bytes(buf, data_len as usize)?;

        Ok(Self {
            image_id,
            file_name,
            width,
            height,
            format,
            data,
        })
    }
}
