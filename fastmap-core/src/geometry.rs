//! Scan geometry, point-count planning and the once-per-scan configuration
//! snapshot.

use crate::error::{Error, Result};
use crate::roi::{EnergyCalibration, RoiTable};
use serde::{Deserialize, Serialize};

/// Requested motion of one positioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    pub positioner: String,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

/// Point count and end points of an axis after boundary alignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub npts: usize,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl AxisRange {
    /// Aligns `start..stop` on a grid of `step` so both end points land on
    /// trajectory boundaries.
    ///
    /// The result always runs upward. With `add_half_step` the span is
    /// widened by half a step on each side, so the requested end points
    /// become pixel centers. A zero-length span gives a single point.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn fix_range(start: f64, stop: f64, step: f64, add_half_step: bool) -> Self {
        let (mut start, mut stop) = if stop < start {
            (stop, start)
        } else {
            (start, stop)
        };
        let step = step.abs();
        if add_half_step {
            start -= step / 2.0;
            stop += step / 2.0;
        }
        let span = (stop - start).abs();
        if span < 1e-12 || step == 0.0 {
            return Self {
                npts: 1,
                start,
                stop,
                step: 0.0,
            };
        }
        let npts = 1 + (0.25 + span / step) as usize;
        stop = start + step * (npts - 1) as f64;
        Self {
            npts,
            start,
            stop,
            step,
        }
    }

    /// Position of point `index`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn position(&self, index: usize) -> f64 {
        self.start + self.step * index as f64
    }
}

/// Operator-requested 1-D or 2-D raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanGeometry {
    /// Output name, used for the store file and the folder title.
    pub filename: String,
    /// Fast (trajectory) axis.
    pub fast: AxisSpec,
    /// Slow (stepped) axis, absent for a single line.
    #[serde(default)]
    pub slow: Option<AxisSpec>,
    /// Seconds per row.
    pub scan_time: f64,
    /// Column of the gather table holding the fast-axis position.
    #[serde(default)]
    pub fast_column: usize,
}

impl ScanGeometry {
    /// 1 for a line scan, 2 for a map.
    #[must_use]
    pub fn dimension(&self) -> usize {
        if self.slow.is_some() {
            2
        } else {
            1
        }
    }

    /// Validates the requested ranges.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for non-finite values, a zero step or a
    /// non-positive row time.
    pub fn validate(&self) -> Result<()> {
        if !(self.scan_time.is_finite() && self.scan_time > 0.0) {
            return Err(Error::Config(format!(
                "scan_time must be positive, got {}",
                self.scan_time
            )));
        }
        for axis in std::iter::once(&self.fast).chain(self.slow.as_ref()) {
            if ![axis.start, axis.stop, axis.step].iter().all(|v| v.is_finite()) {
                return Err(Error::Config(format!(
                    "axis '{}' has a non-finite range",
                    axis.positioner
                )));
            }
            if axis.step == 0.0 {
                return Err(Error::Config(format!(
                    "axis '{}' has a zero step",
                    axis.positioner
                )));
            }
        }
        Ok(())
    }

    /// Computes point counts, end points and the travel direction of the
    /// first row.
    ///
    /// # Errors
    /// See [`ScanGeometry::validate`].
    pub fn plan(&self) -> Result<ScanPlan> {
        self.validate()?;
        let fast = AxisRange::fix_range(self.fast.start, self.fast.stop, self.fast.step, true);
        let direction_offset = usize::from(self.fast.start > self.fast.stop);
        let slow = self.slow.as_ref().map(|axis| {
            let mut range = AxisRange::fix_range(axis.start, axis.stop, axis.step, false);
            if axis.start > axis.stop {
                std::mem::swap(&mut range.start, &mut range.stop);
                range.step = -range.step;
            }
            range
        });
        Ok(ScanPlan {
            fast,
            slow,
            direction_offset,
        })
    }
}

/// Aligned scan ranges derived from a [`ScanGeometry`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    /// Fast axis, always increasing, widened by half a step on each side.
    pub fast: AxisRange,
    /// Slow axis in the requested direction.
    pub slow: Option<AxisRange>,
    /// 1 when the first row travels downward.
    pub direction_offset: usize,
}

impl ScanPlan {
    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.slow.map_or(1, |s| s.npts)
    }

    /// Whether row `row` travels from `fast.stop` back to `fast.start`.
    #[must_use]
    pub fn is_reversed(&self, row: usize) -> bool {
        (row + self.direction_offset) % 2 == 1
    }

    /// Fast-axis end points `(from, to)` for row `row`.
    #[must_use]
    pub fn fast_travel(&self, row: usize) -> (f64, f64) {
        if self.is_reversed(row) {
            (self.fast.stop, self.fast.start)
        } else {
            (self.fast.start, self.fast.stop)
        }
    }

    /// Slow-axis position of row `row`, if the scan is 2-D.
    #[must_use]
    pub fn slow_position(&self, row: usize) -> Option<f64> {
        self.slow.map(|s| s.position(row))
    }
}

/// One recorded environment value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    pub title: String,
    pub address: String,
    pub value: String,
}

/// Configuration written once into the store's configuration subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub geometry: ScanGeometry,
    pub rois: RoiTable,
    /// One calibration per sub-detector.
    pub calibration: Vec<EnergyCalibration>,
    #[serde(default)]
    pub environment: Vec<EnvironmentEntry>,
    /// Raw-data folder the store was built from.
    #[serde(default)]
    pub folder: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn geometry(start: f64, stop: f64) -> ScanGeometry {
        ScanGeometry {
            filename: "test".to_string(),
            fast: AxisSpec {
                positioner: "x".to_string(),
                start,
                stop,
                step: 0.1,
            },
            slow: Some(AxisSpec {
                positioner: "y".to_string(),
                start: 1.0,
                stop: 0.0,
                step: 0.5,
            }),
            scan_time: 10.0,
            fast_column: 0,
        }
    }

    #[test]
    fn test_fix_range_half_step() {
        let r = AxisRange::fix_range(0.0, 1.0, 0.1, true);
        assert_eq!(r.npts, 12);
        assert_relative_eq!(r.start, -0.05);
        assert_relative_eq!(r.stop, 1.05, epsilon = 1e-9);
    }

    #[test]
    fn test_fix_range_without_padding() {
        let r = AxisRange::fix_range(2.0, 0.0, -0.5, false);
        assert_eq!(r.npts, 5);
        assert_relative_eq!(r.start, 0.0);
        assert_relative_eq!(r.stop, 2.0);
        assert_relative_eq!(r.step, 0.5);
    }

    #[test]
    fn test_fix_range_zero_span() {
        let r = AxisRange::fix_range(1.0, 1.0, 0.1, false);
        assert_eq!(r.npts, 1);
        assert_relative_eq!(r.step, 0.0);
    }

    #[test]
    fn test_plan_direction_and_slow_axis() {
        let plan = geometry(0.0, 1.0).plan().unwrap();
        assert_eq!(plan.direction_offset, 0);
        assert_eq!(plan.rows(), 3);
        assert!(!plan.is_reversed(0));
        assert!(plan.is_reversed(1));
        assert_relative_eq!(plan.slow_position(1).unwrap(), 0.5);
        assert_relative_eq!(plan.slow_position(2).unwrap(), 0.0);

        let swapped = geometry(1.0, 0.0).plan().unwrap();
        assert_eq!(swapped.direction_offset, 1);
        assert!(swapped.is_reversed(0));
        let (from, to) = swapped.fast_travel(0);
        assert!(from > to);
    }

    #[test]
    fn test_validate_rejects_zero_step() {
        let mut g = geometry(0.0, 1.0);
        g.fast.step = 0.0;
        assert!(matches!(g.validate(), Err(Error::Config(_))));
        assert_eq!(g.dimension(), 2);
    }
}
