//! I/O and store error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for I/O and store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O and store error types.
#[derive(Error, Debug)]
pub enum Error {
    /// A hardware row file never became readable within the retry budget.
    #[error("source unavailable after {attempts} attempts: {path}: {reason}")]
    SourceUnavailable {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    /// The file exists but is not a map store.
    #[error("not a map store: {0}")]
    NotThisFormat(PathBuf),

    /// Another process holds write ownership of the store.
    #[error("store is owned by {owner}")]
    OwnershipConflict { owner: String },

    /// This handle does not hold write ownership.
    #[error("this process does not own the store (owner: {owner})")]
    NotOwner { owner: String },

    /// The store schema was already created.
    #[error("store schema is already initialized")]
    AlreadyInitialized,

    /// The store schema has not been created yet.
    #[error("store schema is not initialized")]
    NotInitialized,

    /// A row or dataset does not match the store schema.
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: String,
        got: String,
    },

    /// Rows must be appended in sequence.
    #[error("row {got} appended out of order (next row is {expected})")]
    RowOrder { expected: usize, got: usize },

    /// A named channel, ROI or sub-detector is not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// The handle was closed or opened read-only.
    #[error("store handle is {0}")]
    Unwritable(&'static str),

    /// Malformed raw data file.
    #[error("format error in {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    /// A string that cannot be stored as an HDF5 string.
    #[error("invalid text value: {0}")]
    InvalidText(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HDF5 library error.
    #[cfg(feature = "hdf5")]
    #[error("hdf5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Spectral buffer error.
    #[error("spectral buffer error: {0}")]
    Buffer(#[from] fastmap_xmap::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] fastmap_core::Error),
}

impl Error {
    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(what: &str, expected: impl ToString, got: impl ToString) -> Self {
        Error::ShapeMismatch {
            what: what.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// True when the row that produced this error may succeed if acquired
    /// again.
    #[must_use]
    pub fn is_row_recoverable(&self) -> bool {
        match self {
            Error::SourceUnavailable { .. } => true,
            Error::Core(e) => e.is_row_recoverable(),
            _ => false,
        }
    }
}
