use std::fmt;

/// Unique identifier of one image job, assigned by the submitting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a client-submitted batch of jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a job, as carried in progress datagrams.
///
/// The numeric codes are part of the wire protocol and must not change:
/// 0 = queued, 1 = processing, 2 = completed, 3 = failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting in the pending queue for an available worker.
    Queued,
    /// Assigned to a worker lease; the round trip is in flight.
    Processing,
    /// Result delivered (or delivery attempted) to the client.
    Completed,
    /// Terminally failed; an error-flagged result was synthesized.
    Failed,
}

impl JobStatus {
    /// Wire code for this status.
    #[must_use]
    pub fn as_code(self) -> u32 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
        }
    }

    /// Parses a wire code back into a status. Returns `None` for unknown codes.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(JobStatus::Queued),
            1 => Some(JobStatus::Processing),
            2 => Some(JobStatus::Completed),
            3 => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Human-readable status text for client display.
    #[must_use]
    pub fn text(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether this status is terminal for the job.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Image format codes carried in job frames.
pub mod format {
    /// PNG-encoded image bytes.
    pub const PNG: u32 = 1;
    /// JPEG-encoded image bytes.
    pub const JPEG: u32 = 2;
    /// BMP-encoded image bytes.
    pub const BMP: u32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_code(status.as_code()), Some(status));
        }
    }

    #[test]
    fn unknown_status_code_rejected() {
        assert_eq!(JobStatus::from_code(4), None);
        assert_eq!(JobStatus::from_code(u32::MAX), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_text_is_stable() {
        // Client UIs key on these strings.
        assert_eq!(JobStatus::Queued.text(), "queued");
        assert_eq!(JobStatus::Failed.text(), "failed");
    }
}
