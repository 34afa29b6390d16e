//! Error types for fastmap-core.

use crate::row::SourceKind;
use thiserror::Error;

/// Result type alias for fastmap-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Error, Debug)]
pub enum Error {
    /// A source delivered too few pixels to be padded up to the scan width.
    #[error("short read from {source_kind}: {got} of {expected} pixels")]
    ShortRead {
        source_kind: SourceKind,
        got: usize,
        expected: usize,
    },

    /// The row cannot be reconciled and must be acquired again.
    #[error("row {row} is unreliable: {reason}")]
    UnreliableRow { row: usize, reason: String },

    /// A row disagrees with the detector layout fixed by row 0.
    #[error("row {row} does not match the detector layout: {reason}")]
    InvalidLayout { row: usize, reason: String },

    /// Invalid region-of-interest definition.
    #[error("invalid ROI '{name}': {reason}")]
    InvalidRoi { name: String, reason: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Array shape error from ndarray.
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when acquiring the same row again may succeed.
    #[must_use]
    pub fn is_row_recoverable(&self) -> bool {
        matches!(self, Error::ShortRead { .. } | Error::UnreliableRow { .. })
    }
}
