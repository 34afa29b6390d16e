//! Row Reconciler: aligns one row's spectral, scaler and gather outputs
//! into an [`AcquiredRow`].
//!
//! Row 0 fixes the pixel count (`npts`) and the [`DetectorLayout`]. Later
//! rows are conformed to that layout: a source that is a little short is
//! padded by repeating its last pixel, a source that is long is truncated,
//! anything else makes the row unreliable. Rows travelling backwards are
//! reversed so every per-pixel array is indexed by increasing position.

use crate::error::{Error, Result};
use crate::layout::{DetectorLayout, MappingMode};
use crate::roi::RoiTable;
use crate::row::{AcquiredRow, SourceKind, SpectralData, Table};
use ndarray::{concatenate, Array, Array1, Array2, Array3, Axis, Dimension, RemoveAxis, Slice, Zip};
use tracing::{debug, info, warn};

/// Reconciler tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileConfig {
    /// Spectral pixels to drop from the start of every row.
    pub leading_spectral_pixels: usize,
    /// Floor on output counts in the dead-time factor.
    pub dead_time_epsilon: f64,
    /// A short source is padded only while `missing < pad_fraction * npts`.
    pub pad_fraction: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            leading_spectral_pixels: 1,
            dead_time_epsilon: 1e-12,
            pad_fraction: 0.5,
        }
    }
}

/// One row's decoded source data.
#[derive(Debug, Clone)]
pub struct RowSources {
    /// Slow-axis position the row was acquired at.
    pub ordinate: f64,
    pub spectral: SpectralData,
    pub scaler: Table,
    /// Gathered positions, one line per trajectory pulse (`npts + 1`).
    pub gather: Table,
}

/// A correction applied to one source while conforming a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// `missing` pixels were filled by repeating the last real pixel.
    Padded { source: SourceKind, missing: usize },
    /// `extra` trailing pixels were dropped.
    Truncated { source: SourceKind, extra: usize },
}

/// Reconciler output: the row plus what was done to obtain it.
#[derive(Debug, Clone)]
pub struct ReconciledRow {
    pub row: AcquiredRow,
    pub adjustments: Vec<Adjustment>,
}

/// Stateful reconciler for one scan.
#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ReconcileConfig,
    rois: RoiTable,
    fast_column: usize,
    direction_offset: usize,
    layout: Option<DetectorLayout>,
}

impl Reconciler {
    /// Creates a reconciler that derives its layout from the first row.
    #[must_use]
    pub fn new(config: ReconcileConfig, rois: RoiTable, fast_column: usize) -> Self {
        Self {
            config,
            rois,
            fast_column,
            direction_offset: 0,
            layout: None,
        }
    }

    /// Resumes with a layout recorded earlier, e.g. for an append session.
    #[must_use]
    pub fn with_layout(mut self, layout: DetectorLayout) -> Self {
        self.rois = layout.rois.clone();
        self.layout = Some(layout);
        self
    }

    /// Sets the row parity offset: 1 when row 0 travels backwards.
    #[must_use]
    pub fn with_direction_offset(mut self, offset: usize) -> Self {
        self.direction_offset = offset % 2;
        self
    }

    /// Layout fixed by row 0, if a row has been reconciled.
    #[must_use]
    pub fn layout(&self) -> Option<&DetectorLayout> {
        self.layout.as_ref()
    }

    /// Whether row `index` is stored reversed.
    #[must_use]
    pub fn is_reversed(&self, index: usize) -> bool {
        (index + self.direction_offset) % 2 == 1
    }

    /// Reconciles the sources of row `index`.
    ///
    /// # Errors
    /// - [`Error::UnreliableRow`] if a source cannot be conformed to `npts`,
    ///   or row 0 has fewer than two usable pixels.
    /// - [`Error::InvalidLayout`] if the detector or scaler shape differs
    ///   from row 0 or the gather table lacks the fast-axis column.
    /// - [`Error::InvalidRoi`] if the ROI table does not fit the detector.
    pub fn reconcile(&mut self, index: usize, sources: RowSources) -> Result<ReconciledRow> {
        let RowSources {
            ordinate,
            spectral,
            scaler,
            gather,
        } = sources;
        let spectral = spectral.without_leading(self.config.leading_spectral_pixels);

        if gather.columns() <= self.fast_column {
            return Err(Error::InvalidLayout {
                row: index,
                reason: format!(
                    "gather table has {} columns, fast axis is column {}",
                    gather.columns(),
                    self.fast_column
                ),
            });
        }

        let counts = [
            (SourceKind::Spectral, spectral.pixels()),
            (SourceKind::Scaler, scaler.rows()),
            (SourceKind::Gather, gather.rows().saturating_sub(1)),
        ];

        let layout = match &self.layout {
            Some(layout) => {
                check_layout(index, layout, &spectral, &scaler)?;
                layout.clone()
            }
            None => {
                let layout = self.first_layout(index, &spectral, &scaler, &counts)?;
                self.layout = Some(layout.clone());
                layout
            }
        };
        let npts = layout.npts;

        let mut adjustments = Vec::new();
        for &(source, got) in &counts {
            if let Some(adj) = self.plan_adjustment(index, source, got, npts)? {
                adjustments.push(adj);
            }
        }

        let counts_arr = conform(spectral.counts, npts)?;
        let real_time = conform(spectral.real_time, npts)?;
        let live_time = conform(spectral.live_time, npts)?;
        let input_counts = conform(spectral.input_counts, npts)?;
        let output_counts = conform(spectral.output_counts, npts)?;
        let scalers = conform(scaler.values, npts)?;
        let gather_values = conform(gather.values, npts + 1)?;

        let mut row = AcquiredRow {
            index,
            ordinate,
            fast_positions: midpoints(&gather_values, self.fast_column),
            spectra: counts_arr,
            real_time,
            live_time,
            input_counts,
            output_counts,
            dead_time_factor: Array2::zeros((0, 0)),
            scalers,
            roi_raw: Array3::zeros((0, 0, 0)),
            roi_corrected: Array3::zeros((0, 0, 0)),
        };

        if self.is_reversed(index) {
            row = reverse_pixels(row);
        }

        row.dead_time_factor = dead_time_factor(
            &row.input_counts,
            &row.output_counts,
            self.config.dead_time_epsilon,
        );
        row.roi_raw = roi_sums(&row.spectra, &layout);
        row.roi_corrected = correct(&row.roi_raw, &row.dead_time_factor);

        for adj in &adjustments {
            warn!(row = index, ?adj, "row source adjusted");
        }
        debug!(row = index, npts, reversed = self.is_reversed(index), "row reconciled");

        Ok(ReconciledRow { row, adjustments })
    }

    fn first_layout(
        &self,
        index: usize,
        spectral: &SpectralData,
        scaler: &Table,
        counts: &[(SourceKind, usize)],
    ) -> Result<DetectorLayout> {
        let npts = counts.iter().map(|&(_, n)| n).min().unwrap_or(0);
        if npts < 2 {
            return Err(Error::UnreliableRow {
                row: index,
                reason: format!("only {npts} usable pixels ({counts:?})"),
            });
        }
        let (sub_detectors, channels) = (spectral.sub_detectors(), spectral.channels());
        match spectral.mapping_mode {
            MappingMode::FullSpectrum => self.rois.validate(sub_detectors, channels)?,
            MappingMode::RoiOnly => {
                if self.rois.len() > channels {
                    return Err(Error::InvalidRoi {
                        name: self.rois.names().last().cloned().unwrap_or_default(),
                        reason: format!(
                            "{} ROIs defined, detector reports {channels} ROI values",
                            self.rois.len()
                        ),
                    });
                }
            }
        }
        info!(
            npts,
            sub_detectors,
            channels,
            mode = ?spectral.mapping_mode,
            "detector layout fixed by first row"
        );
        Ok(DetectorLayout {
            npts,
            sub_detectors,
            channels,
            mapping_mode: spectral.mapping_mode,
            scaler_names: scaler.column_names(),
            rois: self.rois.clone(),
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn plan_adjustment(
        &self,
        index: usize,
        source: SourceKind,
        got: usize,
        npts: usize,
    ) -> Result<Option<Adjustment>> {
        if got > npts {
            return Ok(Some(Adjustment::Truncated {
                source,
                extra: got - npts,
            }));
        }
        let missing = npts - got;
        if missing == 0 {
            return Ok(None);
        }
        if got > 0 && (missing as f64) < self.config.pad_fraction * npts as f64 {
            return Ok(Some(Adjustment::Padded { source, missing }));
        }
        let short = Error::ShortRead {
            source_kind: source,
            got,
            expected: npts,
        };
        Err(Error::UnreliableRow {
            row: index,
            reason: short.to_string(),
        })
    }
}

fn check_layout(
    index: usize,
    layout: &DetectorLayout,
    spectral: &SpectralData,
    scaler: &Table,
) -> Result<()> {
    let reason = if spectral.mapping_mode != layout.mapping_mode {
        Some(format!(
            "mapping mode {:?}, expected {:?}",
            spectral.mapping_mode, layout.mapping_mode
        ))
    } else if spectral.sub_detectors() != layout.sub_detectors
        || spectral.channels() != layout.channels
    {
        Some(format!(
            "{} sub-detectors x {} channels, expected {} x {}",
            spectral.sub_detectors(),
            spectral.channels(),
            layout.sub_detectors,
            layout.channels
        ))
    } else if scaler.columns() != layout.scaler_count() {
        Some(format!(
            "{} scaler channels, expected {}",
            scaler.columns(),
            layout.scaler_count()
        ))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidLayout { row: index, reason }),
        None => Ok(()),
    }
}

/// Pads (repeating the last entry) or truncates `arr` along axis 0 to `n`.
fn conform<A, D>(arr: Array<A, D>, n: usize) -> Result<Array<A, D>>
where
    A: Clone,
    D: RemoveAxis,
{
    let len = arr.len_of(Axis(0));
    if len == n {
        return Ok(arr);
    }
    if len > n {
        return Ok(arr.slice_axis(Axis(0), Slice::from(0..n)).to_owned());
    }
    if len == 0 {
        return Err(Error::Config("cannot pad an empty source".into()));
    }
    let last = arr.slice_axis(Axis(0), Slice::from(len - 1..len));
    let mut parts = vec![arr.view()];
    parts.extend(std::iter::repeat_n(last, n - len));
    Ok(concatenate(Axis(0), &parts)?)
}

fn reverse<A: Clone, D: Dimension>(mut arr: Array<A, D>) -> Array<A, D> {
    arr.invert_axis(Axis(0));
    arr.as_standard_layout().into_owned()
}

fn reverse_pixels(row: AcquiredRow) -> AcquiredRow {
    AcquiredRow {
        fast_positions: reverse(row.fast_positions),
        spectra: reverse(row.spectra),
        real_time: reverse(row.real_time),
        live_time: reverse(row.live_time),
        input_counts: reverse(row.input_counts),
        output_counts: reverse(row.output_counts),
        scalers: reverse(row.scalers),
        ..row
    }
}

/// Pixel centers from boundary positions: `(g[i] + g[i-1]) / 2`.
fn midpoints(gather: &Array2<f64>, column: usize) -> Array1<f64> {
    let col = gather.column(column);
    (1..col.len()).map(|i| (col[i] + col[i - 1]) / 2.0).collect()
}

/// `input / max(output, epsilon)` per pixel and sub-detector.
#[must_use]
pub fn dead_time_factor(input: &Array2<u32>, output: &Array2<u32>, epsilon: f64) -> Array2<f64> {
    Zip::from(input)
        .and(output)
        .map_collect(|&icr, &ocr| f64::from(icr) / f64::from(ocr).max(epsilon))
}

fn roi_sums(spectra: &Array3<u32>, layout: &DetectorLayout) -> Array3<f64> {
    let (npix, ndet, _) = spectra.dim();
    let mut out = Array3::<f64>::zeros((npix, layout.rois.len(), ndet));
    for (iroi, roi) in layout.rois.iter().enumerate() {
        for det in 0..ndet {
            for pix in 0..npix {
                out[[pix, iroi, det]] = match layout.mapping_mode {
                    MappingMode::FullSpectrum => {
                        let (lo, hi) = roi.limits[det];
                        (lo..hi).map(|c| f64::from(spectra[[pix, det, c]])).sum()
                    }
                    MappingMode::RoiOnly => f64::from(spectra[[pix, det, iroi]]),
                };
            }
        }
    }
    out
}

fn correct(raw: &Array3<f64>, factor: &Array2<f64>) -> Array3<f64> {
    let mut out = raw.clone();
    for ((pix, _, det), value) in out.indexed_iter_mut() {
        *value *= factor[[pix, det]];
    }
    out
}
