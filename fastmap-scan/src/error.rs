//! Error types for fastmap-scan.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for scan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Scan orchestration errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The positioner is unknown or cannot drive a trajectory.
    #[error("positioner '{0}' is not configured for trajectory scans")]
    InvalidPositioner(String),

    /// A scan is already in progress.
    #[error("a scan is already running")]
    Busy,

    /// A bounded wait ran out.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },

    /// The trajectory controller refused the line definition.
    #[error("trajectory controller rejected the line for axis '{0}'")]
    TrajectoryRejected(String),

    /// The detector finished writing, but not the file for this row.
    #[error("row {row}: expected spectral file {expected:?}, detector reports {reported:?}")]
    MissingRowFile {
        row: usize,
        expected: PathBuf,
        reported: Option<PathBuf>,
    },

    /// A row could not be acquired within its redo budget.
    #[error("row {row} failed: {reason}")]
    RowFailed { row: usize, reason: String },

    /// The operator aborted the scan.
    #[error("scan aborted")]
    Aborted,

    /// A hardware capability call failed.
    #[error("hardware error: {0:#}")]
    Hardware(#[from] anyhow::Error),

    /// A blocking worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] fastmap_io::Error),

    #[error(transparent)]
    Core(#[from] fastmap_core::Error),
}

impl Error {
    /// True when acquiring the same row again may succeed.
    #[must_use]
    pub fn is_row_recoverable(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::MissingRowFile { .. } => true,
            Error::Io(e) => e.is_row_recoverable(),
            Error::Core(e) => e.is_row_recoverable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_recoverable_classification() {
        let timeout = Error::Timeout {
            what: "detector armed",
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_row_recoverable());

        let unreliable = Error::Core(fastmap_core::Error::UnreliableRow {
            row: 3,
            reason: "short".into(),
        });
        assert!(unreliable.is_row_recoverable());

        assert!(!Error::Io(fastmap_io::Error::AlreadyInitialized).is_row_recoverable());
        assert!(!Error::InvalidPositioner("x".into()).is_row_recoverable());
        assert!(!Error::Aborted.is_row_recoverable());
    }

    #[test]
    fn test_hardware_error_shows_context() {
        let e = Error::from(anyhow::anyhow!("no reply").context("reading fine x"));
        assert_eq!(e.to_string(), "hardware error: reading fine x: no reply");
    }
}
