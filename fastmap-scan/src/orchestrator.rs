//! The scan orchestrator: sequences rows, redoes bad ones, persists good
//! ones.
//!
//! One [`Orchestrator::start_scan`] call drives a whole scan:
//!
//! 1. validate the geometry against the configured positioners and plan it
//! 2. save positioner values, define the trajectory, create the raw folder
//!    and open the map store
//! 3. per row: move to the row start, arm the detectors, run the line while
//!    the once-per-scan metadata is written, save scaler and gathered
//!    positions together, wait for the spectral file, check the beam, then
//!    read, reconcile and append the row
//! 4. restore the saved positions and close the store
//!
//! A row that fails in a recoverable way is acquired again; a second
//! consecutive failure of the same row ends the scan. Abort is cooperative:
//! it is observed before each row and while waiting for beam recovery.

use crate::error::{Error, Result};
use crate::hardware::{Hardware, Positioner, SpectralDetector};
use crate::pipeline::RowPipeline;
use crate::poll::poll_until;
use crate::status::{AbortHandle, ScanState, ScanStatus, StatusBoard};
use fastmap_core::{AcquisitionConfig, ConfigSnapshot, ScanGeometry, ScanPlan};
use fastmap_io::{MapStore, MasterRow, RoiFile, ScanFolder, StoreOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

const FORWARD: &str = "forward";
const BACKWARD: &str = "backward";
const MAX_FOLDER_NAME: usize = 45;

/// Outcome of a scan that ran to completion or was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub folder: PathBuf,
    pub store: PathBuf,
    /// Rows written to the store.
    pub rows: usize,
    pub planned_rows: usize,
    /// Pixels per row.
    pub npts: usize,
    /// Rows acquired more than once.
    pub redos: u32,
    /// Lines whose motion did not report completion in time.
    pub underruns: u32,
    pub aborted: bool,
}

/// Drives scans on one set of hardware.
#[derive(Debug)]
pub struct Orchestrator {
    hardware: Hardware,
    config: AcquisitionConfig,
    data_root: PathBuf,
    store_options: StoreOptions,
    status: StatusBoard,
    abort: AbortHandle,
    running: AtomicBool,
}

impl Orchestrator {
    /// Creates an idle orchestrator writing scan folders under `data_root`.
    #[must_use]
    pub fn new(hardware: Hardware, config: AcquisitionConfig, data_root: impl Into<PathBuf>) -> Self {
        let store_options = StoreOptions::default().with_growth(config.growth);
        Self {
            hardware,
            config,
            data_root: data_root.into(),
            store_options,
            status: StatusBoard::new(),
            abort: AbortHandle::default(),
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_store_options(mut self, options: StoreOptions) -> Self {
        self.store_options = options;
        self
    }

    #[must_use]
    pub fn status(&self) -> ScanStatus {
        self.status.current()
    }

    /// Subscribes to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    /// A handle that can abort the running scan from another task.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Requests that the running scan stop before its next row.
    pub fn abort_scan(&self) {
        self.abort.abort();
        if self.status.state() != ScanState::Idle {
            self.status.set_state(ScanState::Abort, "Abort requested");
        }
    }

    /// Runs a scan to completion, abort or failure, and returns to idle.
    ///
    /// # Errors
    /// - [`Error::Busy`] if a scan is already running
    /// - [`Error::InvalidPositioner`] if the fast axis is not a configured
    ///   trajectory axis or the slow axis is unknown
    /// - [`Error::TrajectoryRejected`], [`Error::Hardware`]
    /// - [`Error::RowFailed`] when a row exhausts its redo budget
    /// - store and folder errors from `fastmap-io`
    pub async fn start_scan(&self, geometry: ScanGeometry) -> Result<ScanReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let _running = RunningGuard(&self.running);
        self.abort.reset();

        let span = info_span!("scan", file = %geometry.filename);
        let result = self.run_scan(geometry).instrument(span).await;
        match &result {
            Ok(report) if report.aborted => self.status.set_state(
                ScanState::Idle,
                format!("Scan aborted after {} of {} rows", report.rows, report.planned_rows),
            ),
            Ok(report) => self
                .status
                .set_state(ScanState::Idle, format!("Scan complete: {} rows", report.rows)),
            Err(e) => self
                .status
                .set_state(ScanState::Idle, format!("Scan failed: {e}")),
        }
        result
    }

    async fn run_scan(&self, geometry: ScanGeometry) -> Result<ScanReport> {
        let axis = self.check_positioners(&geometry)?;
        let plan = geometry.plan()?;
        let npts = pixels_per_row(&plan);
        let rows = plan.rows();
        self.status.update(|s| {
            s.row = 0;
            s.rows = rows;
            s.npts = npts;
            s.redos = 0;
            s.folder = None;
        });
        #[allow(clippy::cast_precision_loss)]
        let total_time = rows as f64 * geometry.scan_time;
        self.status.set_state(
            ScanState::Pending,
            format!("Will execute {} points in {total_time:.1} s", rows * npts),
        );

        let saved = self.save_positions().await?;
        let result = self.acquire(&geometry, &plan, &axis).await;
        let restored = self.restore_positions(&saved).await;
        let report = result?;
        restored?;
        Ok(report)
    }

    fn check_positioners(&self, geometry: &ScanGeometry) -> Result<String> {
        let fast = &geometry.fast.positioner;
        let axis = self
            .hardware
            .trajectory_axis(fast)
            .filter(|_| self.hardware.positioner(fast).is_some())
            .ok_or_else(|| Error::InvalidPositioner(fast.clone()))?;
        if let Some(slow) = &geometry.slow {
            if self.hardware.positioner(&slow.positioner).is_none() {
                return Err(Error::InvalidPositioner(slow.positioner.clone()));
            }
        }
        Ok(axis.to_string())
    }

    async fn save_positions(&self) -> Result<Vec<(Arc<dyn Positioner>, f64)>> {
        let mut saved = Vec::new();
        for positioner in self.hardware.positioners() {
            let value = positioner.get_value().await?;
            debug!(positioner = positioner.name(), value, "saved position");
            saved.push((Arc::clone(positioner), value));
        }
        Ok(saved)
    }

    async fn restore_positions(&self, saved: &[(Arc<dyn Positioner>, f64)]) -> Result<()> {
        for (positioner, value) in saved {
            positioner.set_value(*value, false).await?;
        }
        debug!(count = saved.len(), "restored positions");
        Ok(())
    }

    async fn acquire(&self, geometry: &ScanGeometry, plan: &ScanPlan, axis: &str) -> Result<ScanReport> {
        let accepted = self
            .hardware
            .trajectory()
            .define_line(axis, plan.fast.start, plan.fast.stop, plan.fast.step, geometry.scan_time)
            .await?;
        if !accepted {
            return Err(Error::TrajectoryRejected(axis.to_string()));
        }
        let rois = self.hardware.detector().rois().await?;

        let root = next_scan_folder(&self.data_root, &geometry.filename)?;
        let store_path = store_path_for(&root);
        let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let setup = {
            let geometry = geometry.clone();
            let plan = *plan;
            let root = root.clone();
            let store_path = store_path.clone();
            let options = self.store_options.clone();
            tokio::task::spawn_blocking(move || -> Result<(ScanFolder, MapStore)> {
                let folder = ScanFolder::create(root)?;
                folder.write_scan(&geometry)?;
                folder.write_master_header(&geometry, &plan, &started)?;
                let store = MapStore::create_or_open_with(store_path, options)?;
                Ok((folder, store))
            })
            .await??
        };
        let (folder, store) = setup;
        info!(folder = %root.display(), store = %store_path.display(), "scan files ready");
        self.status.update(|s| s.folder = Some(root.clone()));

        let snapshot = ConfigSnapshot {
            geometry: geometry.clone(),
            rois: rois.rois.clone(),
            calibration: rois.calibration.clone(),
            environment: Vec::new(),
            folder: root.display().to_string(),
        };
        let pipeline = RowPipeline::new(
            folder.clone(),
            store,
            snapshot,
            &self.config,
            plan.direction_offset,
        );

        let mut scan = RowLoop {
            geometry,
            plan,
            folder: &folder,
            rois: &rois,
            pipeline: Some(pipeline),
            started: Instant::now(),
            stored: 0,
            redos: 0,
            underruns: 0,
        };
        if !self.abort.is_aborted() {
            self.status.set_state(ScanState::Scanning, "Scanning");
        }
        let result = self.run_rows(&mut scan).await;

        let closed = match scan.pipeline.take() {
            Some(mut pipeline) => tokio::task::spawn_blocking(move || pipeline.close()).await?,
            None => {
                warn!("store pipeline lost, store left open");
                Ok(())
            }
        };
        let aborted = result?;
        closed?;
        Ok(ScanReport {
            folder: root,
            store: store_path,
            rows: scan.stored,
            planned_rows: plan.rows(),
            npts: pixels_per_row(plan),
            redos: scan.redos,
            underruns: scan.underruns,
            aborted,
        })
    }

    /// Returns whether the scan was aborted.
    async fn run_rows(&self, scan: &mut RowLoop<'_>) -> Result<bool> {
        let rows = scan.plan.rows();
        let mut row = 0;
        let mut row_redos = 0u32;
        let mut beam_redos = 0u32;
        let mut metadata_written = false;

        while row < rows {
            if self.abort.is_aborted() {
                info!(row, "abort observed before row");
                return Ok(true);
            }
            self.status.update(|s| {
                s.row = row + 1;
                s.message = format!("Row {} of {rows}", row + 1);
            });

            let capture = self
                .acquire_row(scan, row, !metadata_written)
                .instrument(info_span!("row", row))
                .await;
            let capture = match capture {
                Ok(capture) => capture,
                Err(e) if e.is_row_recoverable() => {
                    self.redo_or_fail(row, &e, &mut row_redos, &mut scan.redos)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if capture.underrun {
                scan.underruns += 1;
            }
            if let Some(environment) = capture.environment {
                metadata_written = true;
                if let Some(pipeline) = scan.pipeline.as_mut() {
                    let snapshot = ConfigSnapshot {
                        geometry: scan.geometry.clone(),
                        rois: scan.rois.rois.clone(),
                        calibration: scan.rois.calibration.clone(),
                        environment,
                        folder: scan.folder.path().display().to_string(),
                    };
                    pipeline.set_snapshot(snapshot);
                }
            }

            if !self.beam_ok().await? {
                beam_redos += 1;
                if beam_redos > self.config.max_beam_redos {
                    return Err(Error::RowFailed {
                        row,
                        reason: format!("beam fault persisted through {} redos", beam_redos - 1),
                    });
                }
                scan.redos += 1;
                let redos = scan.redos;
                warn!(row, beam_redos, "beam fault, waiting for recovery");
                self.status.update(|s| {
                    s.redos = redos;
                    s.message = format!("Row {}: beam fault, waiting for recovery", row + 1);
                });
                match self.wait_for_beam().await {
                    Ok(()) => info!(row, "beam recovered, redoing row"),
                    Err(Error::Timeout { waited, .. }) => {
                        warn!(row, ?waited, "beam did not recover in time, redoing row");
                    }
                    Err(Error::Aborted) => return Ok(true),
                    Err(e) => return Err(e),
                }
                continue;
            }

            match self.ingest(scan, row, capture.master).await {
                Ok(stored) => {
                    scan.stored = stored;
                    row += 1;
                    row_redos = 0;
                    beam_redos = 0;
                }
                Err(e) if e.is_row_recoverable() => {
                    self.redo_or_fail(row, &e, &mut row_redos, &mut scan.redos)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    fn redo_or_fail(&self, row: usize, error: &Error, row_redos: &mut u32, total: &mut u32) -> Result<()> {
        *row_redos += 1;
        if *row_redos > self.config.max_row_redos {
            warn!(row, error = %error, "row failed again, giving up");
            return Err(Error::RowFailed {
                row,
                reason: error.to_string(),
            });
        }
        *total += 1;
        let redos = *total;
        warn!(row, error = %error, attempt = *row_redos, "redoing row");
        self.status.update(|s| {
            s.redos = redos;
            s.message = format!("Row {}: {error}; redoing", row + 1);
        });
        Ok(())
    }

    async fn acquire_row(&self, scan: &RowLoop<'_>, row: usize, first: bool) -> Result<RowCapture> {
        let geometry = scan.geometry;
        let plan = scan.plan;
        let files = scan.folder.row_files(row);
        let spectral_path = scan.folder.file(&files.spectral);
        let fast = self
            .hardware
            .positioner(&geometry.fast.positioner)
            .ok_or_else(|| Error::InvalidPositioner(geometry.fast.positioner.clone()))?;
        let slow = match &geometry.slow {
            Some(axis) => Some(
                self.hardware
                    .positioner(&axis.positioner)
                    .ok_or_else(|| Error::InvalidPositioner(axis.positioner.clone()))?,
            ),
            None => None,
        };

        let (from, to) = plan.fast_travel(row);
        let slow_target = slow.zip(plan.slow_position(row));
        tokio::try_join!(fast.set_value(from, true), async {
            match slow_target {
                Some((p, y)) => p.set_value(y, true).await,
                None => Ok(()),
            }
        })?;
        let ordinate = match slow {
            Some(p) => p.get_value().await?,
            None => 0.0,
        };

        let detector: &dyn SpectralDetector = self.hardware.detector().as_ref();
        detector.arm(row, &spectral_path).await?;
        self.hardware.scaler().start().await?;
        poll_until(&self.config.device_ready, "detector to start acquiring", move || async move {
            detector.is_acquiring().await.map_err(Error::from)
        })
        .await?;

        let line = if plan.is_reversed(row) { BACKWARD } else { FORWARD };
        let limit = Duration::from_secs_f64(geometry.scan_time) + self.config.motion_margin();
        let fired = Instant::now();
        let trajectory = Arc::clone(self.hardware.trajectory());
        let mut motion = MotionTask(tokio::spawn(async move { trajectory.run(line).await }));
        debug!(row, line, from, to, "trajectory fired");

        let environment = if first {
            Some(self.write_scan_metadata(scan.folder, scan.rois).await?)
        } else {
            None
        };

        let underrun = match tokio::time::timeout_at(fired + limit, &mut motion.0).await {
            Ok(joined) => {
                joined??;
                false
            }
            Err(_) => {
                warn!(row, ?limit, "trajectory did not report completion, possible under-run");
                true
            }
        };

        fast.set_value(to, false).await?;
        if let Some((p, y)) = slow.zip(plan.slow_position(row + 1).filter(|_| row + 1 < plan.rows())) {
            p.set_value(y, false).await?;
        }

        let npts = pixels_per_row(plan);
        let scaler = self.hardware.scaler();
        let scaler_path = scan.folder.file(&files.scaler);
        let gather_path = scan.folder.file(&files.gather);
        let (scaler_saved, gather_saved) = tokio::join!(
            async {
                scaler.stop().await?;
                scaler.save(&scaler_path, npts).await
            },
            self.hardware.trajectory().save_gathered_positions(&gather_path),
        );
        scaler_saved?;
        gather_saved?;

        poll_until(&self.config.file_write, "spectral file to be written", move || async move {
            detector.file_write_complete().await.map_err(Error::from)
        })
        .await?;
        let reported = detector.last_written_filename().await?;
        if reported.as_deref() != Some(spectral_path.as_path()) {
            return Err(Error::MissingRowFile {
                row,
                expected: spectral_path,
                reported,
            });
        }

        Ok(RowCapture {
            master: MasterRow {
                ordinate,
                spectral_file: files.spectral,
                scaler_file: files.scaler,
                gather_file: files.gather,
                elapsed: scan.started.elapsed().as_secs_f64(),
            },
            environment,
            underrun,
        })
    }

    /// Writes `Rois.json` and `Environ.dat`; returns the environment.
    async fn write_scan_metadata(
        &self,
        folder: &ScanFolder,
        rois: &RoiFile,
    ) -> Result<Vec<fastmap_core::EnvironmentEntry>> {
        let environment = match self.hardware.environment() {
            Some(source) => match source.snapshot().await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "environment snapshot failed, recording none");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let folder = folder.clone();
        let rois = rois.clone();
        let entries = environment.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            folder.write_rois(&rois)?;
            folder.write_environment(&entries)?;
            Ok(())
        })
        .await??;
        debug!(entries = environment.len(), "scan metadata written");
        Ok(environment)
    }

    async fn beam_ok(&self) -> Result<bool> {
        match self.hardware.beam() {
            Some(beam) => Ok(beam.is_ok().await?),
            None => Ok(true),
        }
    }

    async fn wait_for_beam(&self) -> Result<()> {
        let Some(beam) = self.hardware.beam() else {
            return Ok(());
        };
        let beam = beam.as_ref();
        let abort = &self.abort;
        poll_until(&self.config.beam_recovery, "beam recovery", move || async move {
            if abort.is_aborted() {
                return Err(Error::Aborted);
            }
            beam.is_ok().await.map_err(Error::from)
        })
        .await
    }

    /// Reads, reconciles and stores the row on a blocking worker; returns
    /// the stored row count.
    async fn ingest(&self, scan: &mut RowLoop<'_>, row: usize, master: MasterRow) -> Result<usize> {
        let mut pipeline = scan.pipeline.take().ok_or_else(|| Error::RowFailed {
            row,
            reason: "store pipeline lost".into(),
        })?;
        let (pipeline, result) = tokio::task::spawn_blocking(move || {
            let result = pipeline.ingest(row, &master);
            (pipeline, result)
        })
        .await?;
        scan.pipeline = Some(pipeline);
        let report = result?;
        info!(
            row,
            rows = report.rows,
            npts = report.npts,
            adjustments = report.adjustments,
            "row complete"
        );
        Ok(report.rows)
    }
}

/// Per-scan state carried through the row loop.
struct RowLoop<'a> {
    geometry: &'a ScanGeometry,
    plan: &'a ScanPlan,
    folder: &'a ScanFolder,
    rois: &'a RoiFile,
    pipeline: Option<RowPipeline>,
    started: Instant,
    stored: usize,
    redos: u32,
    underruns: u32,
}

struct RowCapture {
    master: MasterRow,
    /// Present for the row that wrote the scan metadata.
    environment: Option<Vec<fastmap_core::EnvironmentEntry>>,
    underrun: bool,
}

/// A running trajectory line; aborted if the row stops waiting for it.
struct MotionTask(JoinHandle<anyhow::Result<()>>);

impl Drop for MotionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Pixels per row: one fewer than the trajectory boundaries.
fn pixels_per_row(plan: &ScanPlan) -> usize {
    plan.fast.npts.saturating_sub(1).max(1)
}

/// Picks a new folder under `base` for a scan named `filename`.
///
/// `name.ext` maps to `name_ext`; when that exists, `name_001`,
/// `name_002` and so on are tried.
///
/// # Errors
/// An I/O error if every candidate already exists.
pub fn next_scan_folder(base: &Path, filename: &str) -> Result<PathBuf> {
    let clean: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let (stem, ext) = clean.split_once('.').unwrap_or((clean.as_str(), "001"));
    let stem: String = stem.chars().take(MAX_FOLDER_NAME).collect();
    let first = base.join(format!("{stem}_{}", ext.replace('.', "_")));
    if !first.exists() {
        return Ok(first);
    }
    (1..10_000)
        .map(|i| base.join(format!("{stem}_{i:03}")))
        .find(|p| !p.exists())
        .ok_or_else(|| {
            let e = std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("no free scan folder for '{filename}' in {}", base.display()),
            );
            Error::Io(e.into())
        })
}

/// The map store sits next to its raw folder: `<folder>.h5`.
#[must_use]
pub fn store_path_for(folder: &Path) -> PathBuf {
    let mut name = folder.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".h5");
    folder.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_next_scan_folder_numbering() {
        let dir = tempdir().unwrap();
        let first = next_scan_folder(dir.path(), "map.001").unwrap();
        assert_eq!(first, dir.path().join("map_001"));
        std::fs::create_dir(&first).unwrap();
        let second = next_scan_folder(dir.path(), "map.001").unwrap();
        assert_eq!(second, dir.path().join("map_002"));
    }

    #[test]
    fn test_next_scan_folder_cleans_and_truncates() {
        let dir = tempdir().unwrap();
        let long = format!("{} x.h5", "a".repeat(60));
        let path = next_scan_folder(dir.path(), &long).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name, format!("{}_h5", "a".repeat(45)));

        let plain = next_scan_folder(dir.path(), "fe map").unwrap();
        assert_eq!(plain, dir.path().join("fe_map_001"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_motion_task_is_aborted() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let motion = MotionTask(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }));
        drop(motion);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_store_path_is_sibling() {
        let path = store_path_for(Path::new("/data/map_001"));
        assert_eq!(path, PathBuf::from("/data/map_001.h5"));
    }
}
