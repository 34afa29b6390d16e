//! Region-of-interest definitions and per-sub-detector energy calibration.

use crate::error::{Error, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// A named region of interest with one half-open channel interval
/// `[lo, hi)` per sub-detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiDefinition {
    pub name: String,
    pub limits: Vec<(usize, usize)>,
}

impl RoiDefinition {
    /// Creates an ROI that uses the same interval on every sub-detector.
    #[must_use]
    pub fn uniform(name: impl Into<String>, lo: usize, hi: usize, sub_detectors: usize) -> Self {
        Self {
            name: name.into(),
            limits: vec![(lo, hi); sub_detectors],
        }
    }

    /// Checks the interval count and bounds against a detector layout.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRoi`] when the interval count differs from
    /// `sub_detectors` or an interval is empty or exceeds `channels`.
    pub fn validate(&self, sub_detectors: usize, channels: usize) -> Result<()> {
        if self.limits.len() != sub_detectors {
            return Err(Error::InvalidRoi {
                name: self.name.clone(),
                reason: format!(
                    "{} intervals for {} sub-detectors",
                    self.limits.len(),
                    sub_detectors
                ),
            });
        }
        for (det, &(lo, hi)) in self.limits.iter().enumerate() {
            if lo >= hi || hi > channels {
                return Err(Error::InvalidRoi {
                    name: self.name.clone(),
                    reason: format!(
                        "interval [{lo}, {hi}) on sub-detector {det} outside 0..{channels}"
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Ordered ROI table shared by every sub-detector.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoiTable {
    rois: Vec<RoiDefinition>,
}

impl RoiTable {
    #[must_use]
    pub fn new(rois: Vec<RoiDefinition>) -> Self {
        Self { rois }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rois.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoiDefinition> {
        self.rois.iter()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&RoiDefinition> {
        self.rois.get(index)
    }

    /// Index of the ROI named `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.rois.iter().position(|r| r.name == name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.rois.iter().map(|r| r.name.clone()).collect()
    }

    /// Validates every ROI and rejects duplicate names.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRoi`] for the first offending entry.
    pub fn validate(&self, sub_detectors: usize, channels: usize) -> Result<()> {
        for (i, roi) in self.rois.iter().enumerate() {
            roi.validate(sub_detectors, channels)?;
            if self.rois[..i].iter().any(|r| r.name == roi.name) {
                return Err(Error::InvalidRoi {
                    name: roi.name.clone(),
                    reason: "duplicate name".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Quadratic channel-to-energy calibration for one sub-detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyCalibration {
    pub offset: f64,
    pub slope: f64,
    pub quad: f64,
}

impl Default for EnergyCalibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            slope: 1.0,
            quad: 0.0,
        }
    }
}

impl EnergyCalibration {
    #[must_use]
    pub fn new(offset: f64, slope: f64, quad: f64) -> Self {
        Self {
            offset,
            slope,
            quad,
        }
    }

    /// Energy of channel `index`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn energy(&self, index: usize) -> f64 {
        let i = index as f64;
        self.offset + self.slope * i + self.quad * i * i
    }

    /// Energy axis for `channels` channels.
    #[must_use]
    pub fn axis(&self, channels: usize) -> Array1<f64> {
        (0..channels).map(|i| self.energy(i)).collect()
    }
}
