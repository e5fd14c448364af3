//! Error types for the index helper.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IndexHelperError>;

#[derive(Debug, Error)]
pub enum IndexHelperError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Exclusive create found an object with the same name.
    #[error("shared segment already exists: {0}")]
    SegmentExists(String),

    #[error("shared segment not found: {0}")]
    SegmentNotFound(String),

    #[error("segment name too long ({len} bytes, max {max}): {name}")]
    NameTooLong { name: String, len: usize, max: usize },

    #[error("invalid segment name: {0}")]
    InvalidName(String),

    #[error("shared memory is not supported on this platform")]
    Unsupported,

    /// The segment is unsealed, truncated or its trailer disagrees with its name.
    #[error("invalid shared segment {name}: {reason}")]
    InvalidSegment { name: String, reason: String },

    #[error("index format error: {0}")]
    IndexFormat(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("verification failed at entry {entry}: {reason}")]
    VerifyMismatch { entry: usize, reason: String },

    #[error("index helper already running (PID {0})")]
    DaemonRunning(u32),

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl IndexHelperError {
    /// Errors that must abort startup instead of skipping a publish cycle.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            IndexHelperError::DaemonRunning(_) | IndexHelperError::Unsupported
        )
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        IndexHelperError::IndexFormat(msg.into())
    }

    pub(crate) fn invalid_segment(name: impl Into<String>, reason: impl Into<String>) -> Self {
        IndexHelperError::InvalidSegment {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(IndexHelperError::DaemonRunning(42).is_fatal_startup());
        assert!(IndexHelperError::Unsupported.is_fatal_startup());
        assert!(!IndexHelperError::SegmentExists("git-index-00".into()).is_fatal_startup());
        assert!(!IndexHelperError::VerifyMismatch {
            entry: 0,
            reason: "name".into()
        }
        .is_fatal_startup());
    }
}
