//! Collaborator contracts implemented outside the core crate.

use bytes::Bytes;
use thiserror::Error;

/// Output of a successful image transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedImage {
    /// Encoded bytes of the transformed image.
    pub data: Bytes,
    /// Width of the transformed image in pixels.
    pub width: u32,
    /// Height of the transformed image in pixels.
    pub height: u32,
}

/// Error raised by an image transform.
///
/// A transform failure is a job-level fault: it is reported back to the
/// coordinator as a failure-flagged result frame, never as a crash.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The format code is not one the transform can decode.
    #[error("unsupported image format code {0}")]
    UnsupportedFormat(u32),
    /// The image bytes could not be decoded or processed.
    #[error("transform failed: {0}")]
    Failed(String),
}

/// Pluggable pixel-level image transform.
///
/// The contract is `(bytes, format, width, height) -> (bytes, width, height)`.
/// Implementations run on blocking threads (the worker wraps calls in
/// `spawn_blocking`), so they may be CPU-heavy but must not block on I/O.
pub trait ImageTransform: Send + Sync {
    /// Applies the transform to one image.
    ///
    /// # Errors
    ///
    /// Returns a [`TransformError`] when the input cannot be decoded or
    /// processed; the caller converts this into a job-level failure.
    fn apply(
        &self,
        data: &[u8],
        format: u32,
        width: u32,
        height: u32,
    ) -> Result<TransformedImage, TransformError>;
}

/// Transform that returns its input unchanged.
///
/// Used by wiring tests and as the default for the stock worker binary,
/// where the real transform is supplied by the embedding application.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTransform;

impl ImageTransform for PassthroughTransform {
    fn apply(
        &self,
        data: &[u8],
        _format: u32,
        width: u32,
        height: u32,
    ) -> Result<TransformedImage, TransformError> {
        Ok(TransformedImage {
            data: Bytes::copy_from_slice(data),
            width,
            height,
        })
    }
}
