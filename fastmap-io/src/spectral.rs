//! Memory-mapped spectral buffer files with retry.
//!
//! The spectral detector finishes writing its row file some time after the
//! trajectory ends. A missing, empty or truncated file is treated as "not
//! written yet" and retried under the configured [`RetryPolicy`].

use crate::{Error, Result};
use fastmap_core::{RetryPolicy, SpectralData};
use fastmap_xmap::BufferDecoder;
use memmap2::Mmap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A memory-mapped file reader.
pub struct MappedFileReader {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and the detector has finished
        // writing it once its records decode; a concurrent writer only ever
        // appends.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of a single read attempt.
enum Attempt {
    NotReady(String),
    Failed(Error),
}

/// Reads spectral row files, waiting for the detector to finish writing.
#[derive(Debug, Clone, Default)]
pub struct SpectralReader {
    policy: RetryPolicy,
    decoder: BufferDecoder,
}

impl SpectralReader {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            decoder: BufferDecoder::new(),
        }
    }

    #[must_use]
    pub fn with_decoder(mut self, decoder: BufferDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Reads and decodes one row file.
    ///
    /// # Errors
    /// [`Error::SourceUnavailable`] when the file never became complete
    /// within the retry budget; [`Error::Buffer`] for malformed records.
    pub fn read<P: AsRef<Path>>(&self, path: P) -> Result<SpectralData> {
        let path = path.as_ref();
        let result = self
            .policy
            .run_blocking(|| self.attempt(path), |a| matches!(a, Attempt::NotReady(_)));
        match result {
            Ok(data) => Ok(data),
            Err((Attempt::Failed(e), _)) => Err(e),
            Err((Attempt::NotReady(reason), attempts)) => {
                warn!(path = %path.display(), attempts, %reason, "spectral file unavailable");
                Err(Error::SourceUnavailable {
                    path: path.to_path_buf(),
                    attempts,
                    reason,
                })
            }
        }
    }

    fn attempt(&self, path: &Path) -> std::result::Result<SpectralData, Attempt> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() == 0 => return Err(Attempt::NotReady("file is empty".into())),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Attempt::NotReady("file not found".into()));
            }
            Err(e) => return Err(Attempt::Failed(e.into())),
        }
        let reader = MappedFileReader::open(path).map_err(Attempt::Failed)?;
        match self.decoder.decode(reader.as_bytes()) {
            Ok(data) => {
                debug!(
                    path = %reader.path().display(),
                    bytes = reader.len(),
                    pixels = data.pixels(),
                    "decoded spectral file"
                );
                Ok(data)
            }
            Err(e) if e.is_transient() => Err(Attempt::NotReady(e.to_string())),
            Err(e) => Err(Attempt::Failed(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastmap_core::MappingMode;
    use fastmap_xmap::BufferEncoder;
    use std::time::Duration;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(50)).with_max_attempts(3)
    }

    #[test]
    fn test_mapped_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let reader = MappedFileReader::open(&path).unwrap();
        assert_eq!(reader.as_bytes(), &[1, 2, 3]);
        assert_eq!(reader.len(), 3);
        assert!(!reader.is_empty());
    }

    #[test]
    fn test_read_decodes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xmap.0001");
        let mut data = SpectralData::zeros(MappingMode::FullSpectrum, 5, 2, 8);
        data.counts[[3, 1, 4]] = 17;
        std::fs::write(&path, BufferEncoder::new().encode(&data).unwrap()).unwrap();

        let decoded = SpectralReader::new(quick_policy()).read(&path).unwrap();
        assert_eq!(decoded.pixels(), 5);
        assert_eq!(decoded.counts[[3, 1, 4]], 17);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = SpectralReader::new(quick_policy())
            .read(dir.path().join("xmap.0009"))
            .unwrap_err();
        match err {
            Error::SourceUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert!(Error::SourceUnavailable {
            path: PathBuf::new(),
            attempts: 1,
            reason: String::new()
        }
        .is_row_recoverable());
    }

    #[test]
    fn test_truncated_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xmap.0001");
        let data = SpectralData::zeros(MappingMode::FullSpectrum, 4, 1, 16);
        let bytes = BufferEncoder::new().encode(&data).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        let err = SpectralReader::new(quick_policy()).read(&path).unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[test]
    fn test_malformed_file_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xmap.0001");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        let err = SpectralReader::new(quick_policy()).read(&path).unwrap_err();
        assert!(matches!(err, Error::Buffer(_)));
    }
}
