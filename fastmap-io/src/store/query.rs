//! Read-side queries over a map store.

use super::ownership::{read_owner, Owner};
use super::schema::{detector_group, read_attr, read_attr_string, read_values, DETSUM, ROIMAP};
use super::MapStore;
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, Axis, Ix2, Ix3};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

/// Overview of a store, as printed by `fastmap info`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSummary {
    pub path: PathBuf,
    pub version: String,
    pub title: String,
    pub dimension: usize,
    pub rows: usize,
    pub npts: usize,
    pub sub_detectors: usize,
    pub channels: usize,
    pub scaler_names: Vec<String>,
    pub roi_names: Vec<String>,
    pub owner: Option<Owner>,
    pub folder: String,
    pub start_time: String,
    pub stop_time: String,
}

impl fmt::Display for StoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}, version {})", self.path.display(), self.title, self.version)?;
        writeln!(f, "  dimension:     {}", self.dimension)?;
        writeln!(f, "  rows x pixels: {} x {}", self.rows, self.npts)?;
        writeln!(f, "  sub-detectors: {}", self.sub_detectors)?;
        writeln!(f, "  channels:      {}", self.channels)?;
        writeln!(f, "  scalers:       {}", self.scaler_names.join(", "))?;
        writeln!(f, "  rois:          {}", self.roi_names.join(", "))?;
        writeln!(f, "  folder:        {}", self.folder)?;
        writeln!(f, "  started:       {}", self.start_time)?;
        writeln!(f, "  stopped:       {}", self.stop_time)?;
        match &self.owner {
            Some(owner) => write!(f, "  owner:         {owner}"),
            None => write!(f, "  owner:         (none)"),
        }
    }
}

impl MapStore {
    fn layout_or_err(&self) -> Result<&fastmap_core::DetectorLayout> {
        self.layout().ok_or(Error::NotInitialized)
    }

    fn check_sub_detector(&self, sub_detector: usize) -> Result<()> {
        let ndet = self.layout_or_err()?.sub_detectors;
        if sub_detector >= ndet {
            return Err(Error::NotFound(format!(
                "sub-detector {sub_detector} (store has {ndet})"
            )));
        }
        Ok(())
    }

    /// Map of a scaler or ROI channel, `[row, pixel]`.
    ///
    /// With `sub_detector` the ROI is read for that sub-detector alone,
    /// otherwise summed across sub-detectors. Scaler channels are the same
    /// either way.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown name or sub-detector,
    /// [`Error::NotInitialized`], and HDF5 errors.
    pub fn roi_map(
        &self,
        name: &str,
        sub_detector: Option<usize>,
        corrected: bool,
    ) -> Result<Array2<f64>> {
        let layout = self.layout_or_err()?;
        let scaler = layout.scaler_names.iter().position(|n| n == name);
        let roi = layout.rois.position(name);
        let (dataset, column) = match (sub_detector, scaler, roi) {
            (_, Some(column), _) => (if corrected { "sum_cor" } else { "sum_raw" }, column),
            (Some(det), None, Some(roi)) => {
                self.check_sub_detector(det)?;
                (
                    if corrected { "det_cor" } else { "det_raw" },
                    layout.detector_column(roi, det),
                )
            }
            (None, None, Some(roi)) => (
                if corrected { "sum_cor" } else { "sum_raw" },
                layout.summed_column(roi),
            ),
            (_, None, None) => return Err(Error::NotFound(format!("map channel '{name}'"))),
        };
        let rows = self.rows();
        if rows == 0 {
            return Ok(Array2::zeros((0, layout.npts)));
        }
        let ds = self.root()?.dataset(&format!("{ROIMAP}/{dataset}"))?;
        Ok(ds.read_slice::<f64, _, Ix2>(s![0..rows, .., column])?)
    }

    /// Energy of every channel of `sub_detector`, or of the summed
    /// detector.
    ///
    /// # Errors
    /// [`Error::NotFound`], [`Error::NotInitialized`] and HDF5 errors.
    pub fn energy_axis(&self, sub_detector: Option<usize>) -> Result<Array1<f64>> {
        let group = match sub_detector {
            Some(det) => {
                self.check_sub_detector(det)?;
                detector_group(det)
            }
            None => {
                self.layout_or_err()?;
                DETSUM.to_string()
            }
        };
        let group = self.root()?.group(&group)?;
        Ok(Array1::from(read_values::<f64>(&group, "energy")?))
    }

    /// Spectrum summed over pixels `x` of rows `y`.
    ///
    /// Ranges are clipped to the written area. Without `sub_detector` the
    /// dead-time corrected sum over sub-detectors is used.
    ///
    /// # Errors
    /// [`Error::NotFound`], [`Error::NotInitialized`] and HDF5 errors.
    pub fn spectrum_over_region(
        &self,
        x: Range<usize>,
        y: Range<usize>,
        sub_detector: Option<usize>,
    ) -> Result<Array1<f64>> {
        let layout = self.layout_or_err()?;
        if let Some(det) = sub_detector {
            self.check_sub_detector(det)?;
        }
        let x_end = x.end.min(layout.npts);
        let y_end = y.end.min(self.rows());
        if x.start >= x_end || y.start >= y_end {
            return Ok(Array1::zeros(layout.channels));
        }
        let selection = s![y.start..y_end, x.start..x_end, ..];
        let root = self.root()?;
        let block = match sub_detector {
            Some(det) => root
                .dataset(&format!("{}/counts", detector_group(det)))?
                .read_slice::<u32, _, Ix3>(selection)?
                .mapv(f64::from),
            None => root
                .dataset(&format!("{DETSUM}/counts"))?
                .read_slice::<f64, _, Ix3>(selection)?,
        };
        Ok(block.sum_axis(Axis(0)).sum_axis(Axis(0)))
    }

    /// Summary of the store's metadata and shape.
    ///
    /// # Errors
    /// HDF5 errors, or a closed handle.
    pub fn summary(&self) -> Result<StoreSummary> {
        let root = self.root()?;
        let text = |name: &str| -> Result<String> {
            Ok(read_attr_string(&root, name)?.unwrap_or_default())
        };
        let layout = self.layout();
        let dimension = read_attr::<u64>(&root, "Dimension")?.unwrap_or(1);
        Ok(StoreSummary {
            path: self.path().to_path_buf(),
            version: text("Version")?,
            title: text("Title")?,
            dimension: usize::try_from(dimension).unwrap_or(1),
            rows: self.rows(),
            npts: layout.map_or(0, |l| l.npts),
            sub_detectors: layout.map_or(0, |l| l.sub_detectors),
            channels: layout.map_or(0, |l| l.channels),
            scaler_names: layout.map(|l| l.scaler_names.clone()).unwrap_or_default(),
            roi_names: layout.map(|l| l.rois.names()).unwrap_or_default(),
            owner: read_owner(&root)?,
            folder: text("Map_Folder")?,
            start_time: text("Start_Time")?,
            stop_time: text("Stop_Time")?,
        })
    }
}
