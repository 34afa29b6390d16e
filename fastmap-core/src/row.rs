//! Per-row data: decoded source arrays and the reconciled [`AcquiredRow`].
//!
//! Every per-pixel array keeps the pixel index on axis 0 so that padding,
//! truncation and serpentine reversal can be applied uniformly.

use crate::layout::MappingMode;
use ndarray::{s, Array1, Array2, Array3, Axis};
use std::fmt;

/// Which hardware source produced a set of per-pixel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Multichannel spectral detector buffer file.
    Spectral,
    /// Multichannel scaler table.
    Scaler,
    /// Gathered trajectory positions table.
    Gather,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Spectral => write!(f, "spectral"),
            SourceKind::Scaler => write!(f, "scaler"),
            SourceKind::Gather => write!(f, "gather"),
        }
    }
}

/// Decoded spectral detector output for one row.
///
/// Arrays are indexed `[pixel, sub_detector]` or
/// `[pixel, sub_detector, channel]`. Times are in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralData {
    /// Mapping mode the buffers were recorded in.
    pub mapping_mode: MappingMode,
    /// Starting pixel number reported by the first buffer.
    pub first_pixel: u32,
    /// Spectral counts (full spectrum) or ROI values (ROI-only mode).
    pub counts: Array3<u32>,
    /// Real time per pixel and sub-detector.
    pub real_time: Array2<f64>,
    /// Live time per pixel and sub-detector.
    pub live_time: Array2<f64>,
    /// Input count totals (trigger counts).
    pub input_counts: Array2<u32>,
    /// Output count totals (events in the spectrum).
    pub output_counts: Array2<u32>,
}

impl SpectralData {
    /// Creates zero-filled arrays for `npix` pixels.
    #[must_use]
    pub fn zeros(mapping_mode: MappingMode, npix: usize, ndet: usize, nchan: usize) -> Self {
        Self {
            mapping_mode,
            first_pixel: 0,
            counts: Array3::zeros((npix, ndet, nchan)),
            real_time: Array2::zeros((npix, ndet)),
            live_time: Array2::zeros((npix, ndet)),
            input_counts: Array2::zeros((npix, ndet)),
            output_counts: Array2::zeros((npix, ndet)),
        }
    }

    /// Number of pixels.
    #[must_use]
    pub fn pixels(&self) -> usize {
        self.counts.len_of(Axis(0))
    }

    /// Number of sub-detectors.
    #[must_use]
    pub fn sub_detectors(&self) -> usize {
        self.counts.len_of(Axis(1))
    }

    /// Number of channels (or ROI values) per sub-detector.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.counts.len_of(Axis(2))
    }

    /// Drops the first `n` pixels.
    ///
    /// The first spectral pixel is armed before the first trajectory pulse
    /// and does not correspond to a scan position.
    #[must_use]
    pub fn without_leading(self, n: usize) -> Self {
        let n = n.min(self.pixels());
        Self {
            mapping_mode: self.mapping_mode,
            first_pixel: self.first_pixel + u32::try_from(n).unwrap_or(u32::MAX),
            counts: self.counts.slice(s![n.., .., ..]).to_owned(),
            real_time: self.real_time.slice(s![n.., ..]).to_owned(),
            live_time: self.live_time.slice(s![n.., ..]).to_owned(),
            input_counts: self.input_counts.slice(s![n.., ..]).to_owned(),
            output_counts: self.output_counts.slice(s![n.., ..]).to_owned(),
        }
    }
}

/// A decoded whitespace-delimited numeric table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    /// Comment-prefixed header lines, prefix stripped.
    pub header: Vec<String>,
    /// Values indexed `[row, column]`.
    pub values: Array2<f64>,
}

impl Table {
    /// Number of data rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.values.nrows()
    }

    /// Number of columns.
    #[must_use]
    pub fn columns(&self) -> usize {
        self.values.ncols()
    }

    /// Column labels from the last header line.
    ///
    /// Labels are separated by `|` when present, otherwise by whitespace.
    /// Missing labels are filled with `col<N>`.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.header.last() {
            Some(line) if line.contains('|') => line
                .split('|')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(line) => line.split_whitespace().map(str::to_string).collect(),
            None => Vec::new(),
        };
        names.truncate(self.columns());
        for i in names.len()..self.columns() {
            names.push(format!("col{}", i + 1));
        }
        names
    }
}

/// One scan line after reconciliation.
///
/// All per-pixel arrays have exactly `npts` entries on axis 0 and are
/// co-indexed with `fast_positions` regardless of travel direction.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredRow {
    /// Row sequence number (0-based).
    pub index: usize,
    /// Slow-axis position of the row.
    pub ordinate: f64,
    /// Fast-axis pixel centers.
    pub fast_positions: Array1<f64>,
    /// Spectral counts `[pixel, sub_detector, channel]`.
    pub spectra: Array3<u32>,
    /// Real time `[pixel, sub_detector]` in seconds.
    pub real_time: Array2<f64>,
    /// Live time `[pixel, sub_detector]` in seconds.
    pub live_time: Array2<f64>,
    /// Input counts `[pixel, sub_detector]`.
    pub input_counts: Array2<u32>,
    /// Output counts `[pixel, sub_detector]`.
    pub output_counts: Array2<u32>,
    /// Dead-time correction factor `[pixel, sub_detector]`.
    pub dead_time_factor: Array2<f64>,
    /// Scaler channel values `[pixel, scaler_channel]`.
    pub scalers: Array2<f64>,
    /// Raw ROI sums `[pixel, roi, sub_detector]`.
    pub roi_raw: Array3<f64>,
    /// Dead-time corrected ROI sums `[pixel, roi, sub_detector]`.
    pub roi_corrected: Array3<f64>,
}

impl AcquiredRow {
    /// Number of pixels in the row.
    #[must_use]
    pub fn pixels(&self) -> usize {
        self.spectra.len_of(Axis(0))
    }

    /// Number of sub-detectors.
    #[must_use]
    pub fn sub_detectors(&self) -> usize {
        self.spectra.len_of(Axis(1))
    }

    /// Number of spectral channels.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.spectra.len_of(Axis(2))
    }

    /// Raw ROI sums added across sub-detectors, `[pixel, roi]`.
    #[must_use]
    pub fn roi_raw_summed(&self) -> Array2<f64> {
        self.roi_raw.sum_axis(Axis(2))
    }

    /// Corrected ROI sums added across sub-detectors, `[pixel, roi]`.
    #[must_use]
    pub fn roi_corrected_summed(&self) -> Array2<f64> {
        self.roi_corrected.sum_axis(Axis(2))
    }

    /// Dead-time corrected spectrum summed over sub-detectors,
    /// `[pixel, channel]`.
    #[must_use]
    pub fn corrected_sum_spectrum(&self) -> Array2<f64> {
        let (npix, ndet, nchan) = self.spectra.dim();
        let mut out = Array2::<f64>::zeros((npix, nchan));
        for pix in 0..npix {
            for det in 0..ndet {
                let factor = self.dead_time_factor[[pix, det]];
                for chan in 0..nchan {
                    out[[pix, chan]] += f64::from(self.spectra[[pix, det, chan]]) * factor;
                }
            }
        }
        out
    }

    /// Real time averaged over sub-detectors, one value per pixel.
    #[must_use]
    pub fn mean_real_time(&self) -> Array1<f64> {
        self.real_time
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(self.pixels()))
    }

    /// Live time averaged over sub-detectors, one value per pixel.
    #[must_use]
    pub fn mean_live_time(&self) -> Array1<f64> {
        self.live_time
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(self.pixels()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_without_leading_drops_first_pixel() {
        let mut data = SpectralData::zeros(MappingMode::FullSpectrum, 3, 1, 2);
        data.counts[[0, 0, 0]] = 9;
        data.counts[[1, 0, 0]] = 1;
        data.input_counts[[2, 0]] = 7;

        let trimmed = data.without_leading(1);
        assert_eq!(trimmed.pixels(), 2);
        assert_eq!(trimmed.first_pixel, 1);
        assert_eq!(trimmed.counts[[0, 0, 0]], 1);
        assert_eq!(trimmed.input_counts[[1, 0]], 7);
    }

    #[test]
    fn test_column_names_pipe_separated() {
        let table = Table {
            header: vec![
                "Struck MCA data".to_string(),
                " I0 | I1 | Time ".to_string(),
            ],
            values: array![[1.0, 2.0, 3.0]],
        };
        assert_eq!(table.column_names(), vec!["I0", "I1", "Time"]);
    }

    #[test]
    fn test_column_names_filled_when_missing() {
        let table = Table {
            header: vec![],
            values: array![[1.0, 2.0]],
        };
        assert_eq!(table.column_names(), vec!["col1", "col2"]);
    }
}
