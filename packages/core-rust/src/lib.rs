//! Pixelmill Core -- wire frames, job identifiers, and the transform contract.

pub mod traits;
pub mod types;
pub mod wire;

pub use traits::{ImageTransform, PassthroughTransform, TransformError, TransformedImage};
pub use types::{BatchId, JobId, JobStatus};
pub use wire::{BatchFrame, Frame, FrameCodec, JobPayload, ProgressUpdate, WireError};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
