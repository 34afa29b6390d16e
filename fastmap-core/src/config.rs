//! Acquisition configuration loaded from JSON.

use crate::error::{Error, Result};
use crate::reconcile::ReconcileConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

/// How per-row arrays in the store grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthPolicy {
    /// Row capacity allocated when the schema is created.
    pub initial_rows: usize,
    /// Multiplier applied to the capacity when it is exhausted.
    pub growth_factor: usize,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            initial_rows: 4,
            growth_factor: 2,
        }
    }
}

impl GrowthPolicy {
    /// Capacity needed to hold row `row` given the current `capacity`.
    #[must_use]
    pub fn next_capacity(&self, capacity: usize, row: usize) -> usize {
        if row < capacity {
            return capacity;
        }
        (capacity * self.growth_factor.max(2)).max(row + 1)
    }
}

/// Tunables for one acquisition session.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use fastmap_core::AcquisitionConfig;
///
/// let config = AcquisitionConfig::from_json(r#"{"max_row_redos": 2}"#).unwrap();
/// assert_eq!(config.max_row_redos, 2);
/// assert_eq!(config.leading_spectral_pixels, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Retry budget for reading a spectral file that is still being written.
    pub spectral_read: RetryPolicy,
    /// Poll budget for "is the device ready" waits.
    pub device_ready: RetryPolicy,
    /// Poll budget for "has the detector finished writing its file".
    pub file_write: RetryPolicy,
    /// Poll budget for waiting on beam recovery.
    pub beam_recovery: RetryPolicy,
    /// Extra time allowed for the trajectory beyond the row time.
    pub motion_margin_ms: u64,
    pub growth: GrowthPolicy,
    /// Spectral pixels recorded before the first trajectory pulse.
    pub leading_spectral_pixels: usize,
    /// Floor on output counts in the dead-time factor.
    pub dead_time_epsilon: f64,
    /// A short source is padded only while `missing < pad_fraction * npts`.
    pub pad_fraction: f64,
    /// Consecutive redos of an unreliable row before the scan fails.
    pub max_row_redos: u32,
    /// Redos of a row caused by beam faults before the scan fails.
    pub max_beam_redos: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            spectral_read: RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(10)),
            device_ready: RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(10)),
            file_write: RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(30)),
            beam_recovery: RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(300)),
            motion_margin_ms: 5_000,
            growth: GrowthPolicy::default(),
            leading_spectral_pixels: 1,
            dead_time_epsilon: 1e-12,
            pad_fraction: 0.5,
            max_row_redos: 1,
            max_beam_redos: 5,
        }
    }
}

impl AcquisitionConfig {
    /// Loads and validates a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the text is not valid JSON or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.growth.initial_rows == 0 {
            return Err(Error::Config("growth.initial_rows must be > 0".into()));
        }
        if self.growth.growth_factor < 2 {
            return Err(Error::Config("growth.growth_factor must be >= 2".into()));
        }
        if !(0.0..=1.0).contains(&self.pad_fraction) {
            return Err(Error::Config(format!(
                "pad_fraction must be within [0, 1], got {}",
                self.pad_fraction
            )));
        }
        if !(self.dead_time_epsilon.is_finite() && self.dead_time_epsilon > 0.0) {
            return Err(Error::Config("dead_time_epsilon must be positive".into()));
        }
        for (name, policy) in [
            ("spectral_read", &self.spectral_read),
            ("device_ready", &self.device_ready),
            ("file_write", &self.file_write),
            ("beam_recovery", &self.beam_recovery),
        ] {
            if policy.timeout_ms == 0 {
                return Err(Error::Config(format!("{name}.timeout_ms must be > 0")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn motion_margin(&self) -> Duration {
        Duration::from_millis(self.motion_margin_ms)
    }

    /// Reconciler settings carried by this configuration.
    #[must_use]
    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            leading_spectral_pixels: self.leading_spectral_pixels,
            dead_time_epsilon: self.dead_time_epsilon,
            pad_fraction: self.pad_fraction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AcquisitionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.growth.initial_rows, 4);
        assert_eq!(config.max_row_redos, 1);
    }

    #[test]
    fn test_partial_json() {
        let config =
            AcquisitionConfig::from_json(r#"{"file_write": {"timeout_ms": 60000}}"#).unwrap();
        assert_eq!(config.file_write.timeout_ms, 60_000);
        assert_eq!(config.file_write.interval_ms, 100);
    }

    #[test]
    fn test_invalid_growth() {
        let result = AcquisitionConfig::from_json(r#"{"growth": {"growth_factor": 1}}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pad_fraction": 0.25}}"#).unwrap();
        let config = AcquisitionConfig::from_file(file.path()).unwrap();
        assert!((config.pad_fraction - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_next_capacity() {
        let growth = GrowthPolicy::default();
        assert_eq!(growth.next_capacity(4, 3), 4);
        assert_eq!(growth.next_capacity(4, 4), 8);
        assert_eq!(growth.next_capacity(4, 11), 12);
    }
}
