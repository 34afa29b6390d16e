//! Spectral buffer error types.

use thiserror::Error;

/// Result type for buffer decoding.
pub type Result<T> = std::result::Result<T, Error>;

/// Spectral buffer error types.
#[derive(Error, Debug)]
pub enum Error {
    /// A header field is outside its allowed range.
    #[error("buffer format error at word {offset}: {reason}")]
    Format { offset: usize, reason: String },

    /// The stream ends inside a record, usually because the file is still
    /// being written.
    #[error("buffer truncated: record needs {needed} words, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] fastmap_core::Error),
}

impl Error {
    pub(crate) fn format(offset: usize, reason: impl Into<String>) -> Self {
        Error::Format {
            offset,
            reason: reason.into(),
        }
    }

    /// True when reading the same file again later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Truncated { .. })
    }
}
