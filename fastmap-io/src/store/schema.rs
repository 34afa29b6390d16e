//! HDF5 layout of the map store and the dataset helpers that build it.
//!
//! ```text
//! /xrfmap                    root attributes (version, owner, rows, ...)
//! /xrfmap/config             scan, layout, rois, mca_calib, environ
//! /xrfmap/det1 .. detN       counts, energy, realtime, livetime, dtfactor
//! /xrfmap/detsum             dead-time corrected sum over sub-detectors
//! /xrfmap/roimap             det_raw/det_cor, sum_raw/sum_cor, pos
//! ```
//!
//! Every per-row dataset has the row index on axis 0 and is created with
//! unlimited extents so that it can grow in batches and be trimmed on close.

use crate::{Error, Result};
use fastmap_core::{AcquiredRow, ConfigSnapshot, DetectorLayout};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, Group};
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, Axis};
use std::str::FromStr;

pub(crate) const ROOT: &str = "xrfmap";
pub(crate) const FORMAT_VERSION: &str = "2.0.0";
pub(crate) const CONFIG: &str = "config";
pub(crate) const DETSUM: &str = "detsum";
pub(crate) const ROIMAP: &str = "roimap";
pub(crate) const ROWS_ATTR: &str = "Rows";

/// Group name of 0-based sub-detector `index`.
pub(crate) fn detector_group(index: usize) -> String {
    format!("det{}", index + 1)
}

/// Chunk compression for per-row datasets.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Storage {
    pub compression: Option<u8>,
    pub shuffle: bool,
}

fn create_row_dataset<T: H5Type, S, C>(
    group: &Group,
    name: &str,
    shape: S,
    chunk: C,
    storage: Storage,
) -> Result<Dataset>
where
    S: Into<hdf5::Extents>,
    C: Into<hdf5::Chunk>,
{
    let mut builder = group.new_dataset::<T>().shape(shape).chunk(chunk);
    if let Some(level) = storage.compression {
        builder = builder.deflate(level);
    }
    if storage.shuffle {
        builder = builder.shuffle();
    }
    Ok(builder.create(name)?)
}

/// Per-row dataset of shape `[capacity, npts]`.
fn create_row_dataset2<T: H5Type>(
    group: &Group,
    name: &str,
    capacity: usize,
    npts: usize,
    storage: Storage,
) -> Result<Dataset> {
    create_row_dataset::<T, _, _>(
        group,
        name,
        (capacity.., npts..),
        (1, npts.max(1)),
        storage,
    )
}

/// Per-row dataset of shape `[capacity, npts, width]`.
fn create_row_dataset3<T: H5Type>(
    group: &Group,
    name: &str,
    capacity: usize,
    npts: usize,
    width: usize,
    storage: Storage,
) -> Result<Dataset> {
    create_row_dataset::<T, _, _>(
        group,
        name,
        (capacity.., npts.., width..),
        (1, npts.max(1), width.max(1)),
        storage,
    )
}

fn create_fixed_dataset<T: H5Type, S>(group: &Group, name: &str, shape: S) -> Result<Dataset>
where
    S: Into<hdf5::Extents>,
{
    Ok(group.new_dataset::<T>().shape(shape).create(name)?)
}

fn write_values<T: H5Type>(group: &Group, name: &str, values: &[T]) -> Result<()> {
    let ds = create_fixed_dataset::<T, _>(group, name, (values.len(),))?;
    if !values.is_empty() {
        ds.write(ArrayView1::from(values))?;
    }
    Ok(())
}

fn write_limits(group: &Group, name: &str, limits: &Array2<u64>) -> Result<()> {
    let ds = create_fixed_dataset::<u64, _>(group, name, limits.dim())?;
    if !limits.is_empty() {
        ds.write(limits.view())?;
    }
    Ok(())
}

pub(crate) fn write_strings(group: &Group, name: &str, values: &[String]) -> Result<()> {
    let values = values
        .iter()
        .map(|v| to_var_len_unicode(v))
        .collect::<Result<Vec<_>>>()?;
    write_values(group, name, &values)
}

pub(crate) fn read_strings(group: &Group, name: &str) -> Result<Vec<String>> {
    let raw = group.dataset(name)?.read_raw::<VarLenUnicode>()?;
    Ok(raw.iter().map(|v| v.as_str().to_string()).collect())
}

pub(crate) fn read_values<T: H5Type>(group: &Group, name: &str) -> Result<Vec<T>> {
    Ok(group.dataset(name)?.read_raw::<T>()?)
}

fn has_attr(group: &Group, name: &str) -> Result<bool> {
    Ok(group.attr_names()?.iter().any(|n| n == name))
}

/// Creates or overwrites a scalar attribute.
pub(crate) fn write_attr<T: H5Type>(group: &Group, name: &str, value: &T) -> Result<()> {
    if has_attr(group, name)? {
        group.attr(name)?.write_scalar(value)?;
    } else {
        group.new_attr::<T>().create(name)?.write_scalar(value)?;
    }
    Ok(())
}

pub(crate) fn read_attr<T: H5Type>(group: &Group, name: &str) -> Result<Option<T>> {
    if has_attr(group, name)? {
        Ok(Some(group.attr(name)?.read_scalar::<T>()?))
    } else {
        Ok(None)
    }
}

pub(crate) fn write_attr_string(group: &Group, name: &str, value: &str) -> Result<()> {
    write_attr(group, name, &to_var_len_unicode(value)?)
}

pub(crate) fn read_attr_string(group: &Group, name: &str) -> Result<Option<String>> {
    Ok(read_attr::<VarLenUnicode>(group, name)?.map(|v| v.as_str().to_string()))
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value).map_err(|e| Error::InvalidText(format!("{value:?}: {e}")))
}

/// Paths, relative to the root group, of every dataset with a row axis.
pub(crate) fn row_dataset_paths(layout: &DetectorLayout) -> Vec<String> {
    let mut paths = Vec::new();
    for det in 0..layout.sub_detectors {
        let group = detector_group(det);
        for name in ["counts", "realtime", "livetime", "dtfactor"] {
            paths.push(format!("{group}/{name}"));
        }
    }
    paths.push(format!("{DETSUM}/counts"));
    for name in ["det_raw", "det_cor", "sum_raw", "sum_cor", "pos"] {
        paths.push(format!("{ROIMAP}/{name}"));
    }
    paths
}

/// Sets the row extent of every per-row dataset.
pub(crate) fn set_row_extent(root: &Group, layout: &DetectorLayout, rows: usize) -> Result<()> {
    for path in row_dataset_paths(layout) {
        let ds = root.dataset(&path)?;
        let mut shape = ds.shape();
        if shape.first() != Some(&rows) {
            shape[0] = rows;
            ds.resize(shape)?;
        }
    }
    Ok(())
}

/// Allocated rows, read from the summed counts dataset.
pub(crate) fn row_capacity(root: &Group) -> Result<usize> {
    let ds = root.dataset(&format!("{DETSUM}/counts"))?;
    Ok(ds.shape().first().copied().unwrap_or(0))
}

fn position_names(snapshot: &ConfigSnapshot) -> Vec<String> {
    let mut names = vec![snapshot.geometry.fast.positioner.clone()];
    if let Some(slow) = &snapshot.geometry.slow {
        names.push(slow.positioner.clone());
    }
    names.push("realtime".to_string());
    names.push("livetime".to_string());
    names
}

fn roi_limits(layout: &DetectorLayout, det: usize) -> Array2<u64> {
    let mut limits = Array2::zeros((layout.rois.len(), 2));
    for (i, roi) in layout.rois.iter().enumerate() {
        if let Some(&(lo, hi)) = roi.limits.get(det) {
            limits[[i, 0]] = lo as u64;
            limits[[i, 1]] = hi as u64;
        }
    }
    limits
}

/// Creates the configuration subtree and every dataset of the schema.
pub(crate) fn create_schema(
    root: &Group,
    layout: &DetectorLayout,
    snapshot: &ConfigSnapshot,
    capacity: usize,
    storage: Storage,
) -> Result<()> {
    let ndet = layout.sub_detectors;
    let nchan = layout.channels;
    let npts = layout.npts;
    if snapshot.calibration.len() != ndet {
        return Err(Error::shape(
            "calibration",
            format!("{ndet} sub-detectors"),
            snapshot.calibration.len(),
        ));
    }

    let config = root.create_group(CONFIG)?;
    write_strings(&config, "scan", &[serde_json::to_string(&snapshot.geometry)?])?;
    write_strings(&config, "layout", &[serde_json::to_string(layout)?])?;

    let rois = config.create_group("rois")?;
    write_strings(&rois, "name", &layout.rois.names())?;
    let mut limits = Array3::<u64>::zeros((layout.rois.len(), ndet, 2));
    for det in 0..ndet {
        limits
            .index_axis_mut(Axis(1), det)
            .assign(&roi_limits(layout, det));
    }
    let ds = create_fixed_dataset::<u64, _>(&rois, "limits", limits.dim())?;
    if !limits.is_empty() {
        ds.write(limits.view())?;
    }

    let calib = config.create_group("mca_calib")?;
    let offset: Vec<f64> = snapshot.calibration.iter().map(|c| c.offset).collect();
    let slope: Vec<f64> = snapshot.calibration.iter().map(|c| c.slope).collect();
    let quad: Vec<f64> = snapshot.calibration.iter().map(|c| c.quad).collect();
    write_values(&calib, "offset", &offset)?;
    write_values(&calib, "slope", &slope)?;
    write_values(&calib, "quad", &quad)?;

    let environ = config.create_group("environ")?;
    let env = &snapshot.environment;
    let titles: Vec<String> = env.iter().map(|e| e.title.clone()).collect();
    let addresses: Vec<String> = env.iter().map(|e| e.address.clone()).collect();
    let values: Vec<String> = env.iter().map(|e| e.value.clone()).collect();
    write_strings(&environ, "name", &titles)?;
    write_strings(&environ, "address", &addresses)?;
    write_strings(&environ, "value", &values)?;

    let roi_names = layout.rois.names();
    for (det, calibration) in snapshot.calibration.iter().enumerate() {
        let group = root.create_group(&detector_group(det))?;
        create_row_dataset3::<u32>(&group, "counts", capacity, npts, nchan, storage)?;
        write_values(&group, "energy", calibration.axis(nchan).as_slice().unwrap_or(&[]))?;
        for name in ["realtime", "livetime", "dtfactor"] {
            create_row_dataset2::<f64>(&group, name, capacity, npts, storage)?;
        }
        write_strings(&group, "roi_name", &roi_names)?;
        write_limits(&group, "roi_limits", &roi_limits(layout, det))?;
    }

    let detsum = root.create_group(DETSUM)?;
    create_row_dataset3::<f64>(&detsum, "counts", capacity, npts, nchan, storage)?;
    let calibration = snapshot.calibration.first().copied().unwrap_or_default();
    write_values(&detsum, "energy", calibration.axis(nchan).as_slice().unwrap_or(&[]))?;
    write_strings(&detsum, "roi_name", &roi_names)?;
    write_limits(&detsum, "roi_limits", &roi_limits(layout, 0))?;

    let roimap = root.create_group(ROIMAP)?;
    let det_names = layout.detector_channel_names();
    let sum_names = layout.summed_channel_names();
    let pos_names = position_names(snapshot);
    write_strings(&roimap, "det_name", &det_names)?;
    write_strings(&roimap, "sum_name", &sum_names)?;
    write_strings(&roimap, "pos_name", &pos_names)?;
    for name in ["det_raw", "det_cor"] {
        create_row_dataset3::<f64>(&roimap, name, capacity, npts, det_names.len(), storage)?;
    }
    for name in ["sum_raw", "sum_cor"] {
        create_row_dataset3::<f64>(&roimap, name, capacity, npts, sum_names.len(), storage)?;
    }
    create_row_dataset3::<f64>(&roimap, "pos", capacity, npts, pos_names.len(), storage)?;

    write_attr(root, "Dimension", &(snapshot.geometry.dimension() as u64))?;
    write_attr(root, "Npts", &(npts as u64))?;
    write_attr_string(root, "Map_Folder", &snapshot.folder)?;
    Ok(())
}

/// Reads the layout recorded by [`create_schema`], `None` before the schema
/// exists.
pub(crate) fn load_layout(root: &Group) -> Result<Option<DetectorLayout>> {
    if !root.link_exists(CONFIG) {
        return Ok(None);
    }
    let config = root.group(CONFIG)?;
    let text = read_strings(&config, "layout")?;
    let first = text.first().ok_or_else(|| Error::NotFound("config/layout".into()))?;
    Ok(Some(serde_json::from_str(first)?))
}

fn write_row2<T: H5Type + Clone>(ds: &Dataset, row: usize, values: ArrayView1<'_, T>) -> Result<()> {
    let values = values.as_standard_layout();
    ds.write_slice(values.view().insert_axis(Axis(0)), s![row..=row, ..])?;
    Ok(())
}

fn write_row3<T: H5Type + Clone>(ds: &Dataset, row: usize, values: ArrayView2<'_, T>) -> Result<()> {
    let values = values.as_standard_layout();
    ds.write_slice(values.view().insert_axis(Axis(0)), s![row..=row, .., ..])?;
    Ok(())
}

/// ROI map columns of one row: scalers, then `roi` values in layout order.
fn roi_columns(
    layout: &DetectorLayout,
    scalers: &Array2<f64>,
    per_detector: &Array3<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let npts = layout.npts;
    let nscaler = layout.scaler_count();
    let nroi = layout.rois.len();
    let mut det = Array2::zeros((npts, nscaler + nroi * layout.sub_detectors));
    let mut sum = Array2::zeros((npts, nscaler + nroi));
    det.slice_mut(s![.., ..nscaler]).assign(scalers);
    sum.slice_mut(s![.., ..nscaler]).assign(scalers);
    for roi in 0..nroi {
        for d in 0..layout.sub_detectors {
            det.column_mut(layout.detector_column(roi, d))
                .assign(&per_detector.slice(s![.., roi, d]));
        }
        sum.column_mut(layout.summed_column(roi))
            .assign(&per_detector.slice(s![.., roi, ..]).sum_axis(Axis(1)));
    }
    (det, sum)
}

/// Writes every per-row dataset at row `index`. Extents must already cover
/// `index`.
pub(crate) fn write_row(
    root: &Group,
    index: usize,
    row: &AcquiredRow,
    layout: &DetectorLayout,
    dimension: usize,
) -> Result<()> {
    for det in 0..layout.sub_detectors {
        let group = root.group(&detector_group(det))?;
        write_row3(&group.dataset("counts")?, index, row.spectra.index_axis(Axis(1), det))?;
        write_row2(&group.dataset("realtime")?, index, row.real_time.column(det))?;
        write_row2(&group.dataset("livetime")?, index, row.live_time.column(det))?;
        write_row2(&group.dataset("dtfactor")?, index, row.dead_time_factor.column(det))?;
    }

    let detsum = root.group(DETSUM)?;
    write_row3(&detsum.dataset("counts")?, index, row.corrected_sum_spectrum().view())?;

    let roimap = root.group(ROIMAP)?;
    let (det_raw, sum_raw) = roi_columns(layout, &row.scalers, &row.roi_raw);
    let (det_cor, sum_cor) = roi_columns(layout, &row.scalers, &row.roi_corrected);
    write_row3(&roimap.dataset("det_raw")?, index, det_raw.view())?;
    write_row3(&roimap.dataset("det_cor")?, index, det_cor.view())?;
    write_row3(&roimap.dataset("sum_raw")?, index, sum_raw.view())?;
    write_row3(&roimap.dataset("sum_cor")?, index, sum_cor.view())?;

    let npos = if dimension > 1 { 4 } else { 3 };
    let mut pos = Array2::<f64>::zeros((layout.npts, npos));
    pos.column_mut(0).assign(&row.fast_positions);
    if dimension > 1 {
        pos.column_mut(1).fill(row.ordinate);
    }
    pos.column_mut(npos - 2).assign(&row.mean_real_time());
    pos.column_mut(npos - 1).assign(&row.mean_live_time());
    write_row3(&roimap.dataset("pos")?, index, pos.view())?;
    Ok(())
}
