//! Simulated beamline.
//!
//! Every capability trait is implemented against one shared bench state.
//! Running a line sleeps for the row time and then writes a real spectral
//! buffer file; the scaler and trajectory controller write real tables, so
//! scans against the simulator exercise the full read, reconcile and store
//! path. Faults can be injected per row to exercise the redo logic.

use crate::hardware::{
    BeamMonitor, EnvironmentSource, Hardware, Positioner, Scaler, SpectralDetector,
    TrajectoryController,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fastmap_core::{
    EnergyCalibration, EnvironmentEntry, MappingMode, RoiDefinition, RoiTable, SpectralData, Table,
};
use fastmap_io::{format_table, RoiFile};
use fastmap_xmap::BufferEncoder;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Trajectory axis name the simulator drives.
pub const SIM_AXIS: &str = "X";

/// Simulator tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct SimOptions {
    pub sub_detectors: usize,
    pub channels: usize,
    /// Pixels the detector records before the first trajectory pulse.
    pub leading_pixels: usize,
    /// Multiplies the row time spent in [`TrajectoryController::run`].
    pub time_scale: f64,
    pub scaler_names: Vec<String>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            sub_detectors: 4,
            channels: 256,
            leading_pixels: 1,
            time_scale: 1.0,
            scaler_names: vec!["TSCALER".into(), "I0".into(), "I1".into()],
        }
    }
}

/// A fault the simulator applies to one acquisition of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The spectral file holds only a quarter of the row's pixels.
    ShortSpectral,
    /// The detector reports completion without writing the row's file.
    MissingSpectral,
    /// The beam monitor reports a fault for two polls after the row.
    BeamLoss,
    /// The beam monitor reports a fault from this row on.
    BeamOutage,
    /// The line takes one second longer than its row time.
    SlowMotion,
}

const SLOW_MOTION_EXTRA: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Line {
    start: f64,
    stop: f64,
    step: f64,
    total_time: f64,
}

impl Line {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn pixels(&self) -> usize {
        ((self.stop - self.start) / self.step).round().max(1.0) as usize
    }

    #[allow(clippy::cast_precision_loss)]
    fn boundary(&self, k: usize) -> f64 {
        self.start + self.step * k as f64
    }
}

#[derive(Debug, Default)]
struct BenchState {
    line: Option<Line>,
    armed: Option<(usize, PathBuf)>,
    acquiring: bool,
    write_complete: bool,
    last_written: Option<PathBuf>,
    reversed: bool,
    counted: usize,
    beam_bad_polls: u32,
    faults: Vec<(usize, SimFault)>,
    active_fault: Option<SimFault>,
    runs: usize,
}

#[derive(Debug)]
struct Bench {
    options: SimOptions,
    state: Mutex<BenchState>,
}

impl Bench {
    fn state(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle on a simulated beamline; hands out the device set.
#[derive(Debug, Clone)]
pub struct SimBeamline {
    bench: Arc<Bench>,
}

impl Default for SimBeamline {
    fn default() -> Self {
        Self::new(SimOptions::default())
    }
}

impl SimBeamline {
    #[must_use]
    pub fn new(options: SimOptions) -> Self {
        Self {
            bench: Arc::new(Bench {
                options,
                state: Mutex::new(BenchState::default()),
            }),
        }
    }

    /// Applies `fault` to the next acquisition of `row`. Injecting the same
    /// fault twice makes it hit two consecutive attempts.
    pub fn inject(&self, row: usize, fault: SimFault) {
        self.bench.state().faults.push((row, fault));
    }

    /// Lines run so far.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.bench.state().runs
    }

    /// Builds the device set: `fast` is a trajectory axis, `slow` a plain
    /// stepping positioner.
    #[must_use]
    pub fn hardware(&self, fast: &str, slow: &str) -> Hardware {
        let detector = Arc::new(SimDetector {
            bench: Arc::clone(&self.bench),
        });
        let scaler = Arc::new(SimScaler {
            bench: Arc::clone(&self.bench),
        });
        let trajectory = Arc::new(SimTrajectory {
            bench: Arc::clone(&self.bench),
        });
        Hardware::new(trajectory, detector, scaler)
            .with_positioner(Arc::new(SimPositioner::new(fast, 0.0)))
            .with_positioner(Arc::new(SimPositioner::new(slow, 0.0)))
            .with_trajectory_axis(fast, SIM_AXIS)
            .with_beam_monitor(Arc::new(SimBeam {
                bench: Arc::clone(&self.bench),
            }))
            .with_environment(Arc::new(SimEnvironment::default()))
    }
}

/// A positioner that moves instantly.
#[derive(Debug)]
pub struct SimPositioner {
    name: String,
    value: Mutex<f64>,
}

impl SimPositioner {
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(value),
        }
    }

    fn value(&self) -> MutexGuard<'_, f64> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Positioner for SimPositioner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_value(&self) -> Result<f64> {
        Ok(*self.value())
    }

    async fn set_value(&self, value: f64, _wait: bool) -> Result<()> {
        *self.value() = value;
        Ok(())
    }
}

struct SimTrajectory {
    bench: Arc<Bench>,
}

impl SimTrajectory {
    /// Spectral data for one line in acquisition order, leading pixels
    /// included.
    fn spectral(&self, line: &Line, row: usize, fault: Option<SimFault>) -> SpectralData {
        let opts = &self.bench.options;
        let npts = line.pixels();
        let usable = match fault {
            Some(SimFault::ShortSpectral) => npts / 4,
            _ => npts,
        };
        let npix = opts.leading_pixels + usable;
        let mut data = SpectralData::zeros(
            MappingMode::FullSpectrum,
            npix,
            opts.sub_detectors,
            opts.channels,
        );
        #[allow(clippy::cast_precision_loss)]
        let dwell = line.total_time / npts as f64;
        let peak = opts.channels / 4;
        for p in 0..npix {
            for d in 0..opts.sub_detectors {
                let mut total = 0u32;
                for c in 0..opts.channels {
                    let background = u32::try_from((p * 7 + d * 3 + c + row) % 5).unwrap_or(0);
                    let signal = if (peak..peak + 4).contains(&c) {
                        u32::try_from(20 + p + row).unwrap_or(u32::MAX)
                    } else {
                        0
                    };
                    data.counts[[p, d, c]] = background + signal;
                    total += background + signal;
                }
                data.output_counts[[p, d]] = total.max(1);
                data.input_counts[[p, d]] = total.max(1) + total / 10;
                data.real_time[[p, d]] = dwell;
                data.live_time[[p, d]] = dwell * 0.9;
            }
        }
        data
    }

    async fn finish_line(&self, line: Line) -> Result<()> {
        let (armed, fault) = {
            let mut state = self.bench.state();
            (state.armed.take(), state.active_fault)
        };
        let Some((row, path)) = armed else {
            return Ok(());
        };
        let written = if fault == Some(SimFault::MissingSpectral) {
            debug!(row, "simulated detector dropped its file");
            false
        } else {
            let bytes = BufferEncoder::new()
                .encode(&self.spectral(&line, row, fault))
                .context("encoding simulated spectra")?;
            tokio::fs::write(&path, bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            true
        };
        let mut state = self.bench.state();
        state.acquiring = false;
        state.write_complete = true;
        if written {
            state.last_written = Some(path);
        }
        Ok(())
    }
}

#[async_trait]
impl TrajectoryController for SimTrajectory {
    async fn define_line(
        &self,
        axis: &str,
        start: f64,
        stop: f64,
        step: f64,
        total_time: f64,
    ) -> Result<bool> {
        if axis != SIM_AXIS || step <= 0.0 || stop <= start || total_time <= 0.0 {
            return Ok(false);
        }
        self.bench.state().line = Some(Line {
            start,
            stop,
            step,
            total_time,
        });
        Ok(true)
    }

    async fn run(&self, name: &str) -> Result<()> {
        let reversed = match name {
            "forward" => false,
            "backward" => true,
            other => bail!("unknown trajectory '{other}'"),
        };
        // Pulses are counted and positions gathered while the stage moves.
        let (line, fault) = {
            let mut state = self.bench.state();
            let Some(line) = state.line else {
                bail!("no trajectory defined");
            };
            state.runs += 1;
            state.reversed = reversed;
            state.counted = line.pixels();
            (line, state.active_fault)
        };
        let scale = self.bench.options.time_scale.max(0.0);
        let mut duration = Duration::from_secs_f64(line.total_time * scale);
        if fault == Some(SimFault::SlowMotion) {
            duration += SLOW_MOTION_EXTRA;
        }
        tokio::time::sleep(duration).await;
        self.finish_line(line).await
    }

    async fn save_gathered_positions(&self, path: &Path) -> Result<()> {
        let (line, reversed) = {
            let state = self.bench.state();
            (state.line, state.reversed)
        };
        let Some(line) = line else {
            bail!("no trajectory defined");
        };
        let npts = line.pixels();
        let positions: Vec<f64> = (0..=npts)
            .map(|k| line.boundary(if reversed { npts - k } else { k }))
            .collect();
        let table = Table {
            header: vec!["XPS gathered positions".into(), SIM_AXIS.into()],
            values: Array2::from_shape_vec((npts + 1, 1), positions)?,
        };
        tokio::fs::write(path, format_table(&table))
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

struct SimDetector {
    bench: Arc<Bench>,
}

#[async_trait]
impl SpectralDetector for SimDetector {
    async fn arm(&self, row: usize, path: &Path) -> Result<()> {
        let mut state = self.bench.state();
        let fault = state
            .faults
            .iter()
            .position(|&(r, _)| r == row)
            .map(|i| state.faults.remove(i).1);
        match fault {
            Some(SimFault::BeamLoss) => state.beam_bad_polls = 2,
            Some(SimFault::BeamOutage) => state.beam_bad_polls = u32::MAX,
            _ => {}
        }
        state.active_fault = fault;
        state.armed = Some((row, path.to_path_buf()));
        state.acquiring = true;
        state.write_complete = false;
        Ok(())
    }

    async fn is_acquiring(&self) -> Result<bool> {
        Ok(self.bench.state().acquiring)
    }

    async fn file_write_complete(&self) -> Result<bool> {
        Ok(self.bench.state().write_complete)
    }

    async fn last_written_filename(&self) -> Result<Option<PathBuf>> {
        Ok(self.bench.state().last_written.clone())
    }

    async fn rois(&self) -> Result<RoiFile> {
        let opts = &self.bench.options;
        let peak = opts.channels / 4;
        let ndet = opts.sub_detectors;
        Ok(RoiFile {
            rois: RoiTable::new(vec![
                RoiDefinition::uniform("Fe Ka", peak, peak + 4, ndet),
                RoiDefinition::uniform("Background", 0, peak, ndet),
            ]),
            calibration: vec![EnergyCalibration::new(0.0, 0.01, 0.0); ndet],
        })
    }
}

struct SimScaler {
    bench: Arc<Bench>,
}

#[async_trait]
impl Scaler for SimScaler {
    async fn start(&self) -> Result<()> {
        self.bench.state().counted = 0;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    async fn save(&self, path: &Path, npts: usize) -> Result<()> {
        let rows = npts.min(self.bench.state().counted);
        let names = &self.bench.options.scaler_names;
        let values = Array2::from_shape_fn((rows, names.len()), |(p, c)| {
            1000.0 * (c + 1) as f64 + p as f64
        });
        let table = Table {
            header: vec!["Struck MCA data".into(), names.join(" | ")],
            values,
        };
        tokio::fs::write(path, format_table(&table))
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

struct SimBeam {
    bench: Arc<Bench>,
}

#[async_trait]
impl BeamMonitor for SimBeam {
    async fn is_ok(&self) -> Result<bool> {
        let mut state = self.bench.state();
        if state.beam_bad_polls > 0 {
            state.beam_bad_polls -= 1;
            return Ok(false);
        }
        Ok(true)
    }
}

/// Fixed environment values.
#[derive(Debug, Clone)]
pub struct SimEnvironment(pub Vec<EnvironmentEntry>);

impl Default for SimEnvironment {
    fn default() -> Self {
        Self(vec![
            EnvironmentEntry {
                title: "Ring Current".into(),
                address: "SIM:ring_current".into(),
                value: "102.3".into(),
            },
            EnvironmentEntry {
                title: "Mono Energy".into(),
                address: "SIM:mono_energy".into(),
                value: "10000.0".into(),
            },
        ])
    }
}

#[async_trait]
impl EnvironmentSource for SimEnvironment {
    async fn snapshot(&self) -> Result<Vec<EnvironmentEntry>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastmap_io::{read_table, SpectralReader};
    use tempfile::tempdir;

    fn small() -> SimBeamline {
        SimBeamline::new(SimOptions {
            sub_detectors: 1,
            channels: 16,
            time_scale: 0.0,
            ..SimOptions::default()
        })
    }

    #[tokio::test]
    async fn test_line_writes_row_files() {
        let dir = tempdir().unwrap();
        let sim = small();
        let hw = sim.hardware("fine x", "fine y");
        assert!(hw
            .trajectory()
            .define_line(SIM_AXIS, 0.0, 3.0, 1.0, 0.3)
            .await
            .unwrap());

        let spectral = dir.path().join("xmap.0001");
        hw.detector().arm(0, &spectral).await.unwrap();
        hw.scaler().start().await.unwrap();
        assert!(hw.detector().is_acquiring().await.unwrap());
        hw.trajectory().run("backward").await.unwrap();
        assert!(hw.detector().file_write_complete().await.unwrap());
        assert_eq!(
            hw.detector().last_written_filename().await.unwrap(),
            Some(spectral.clone())
        );

        let data = SpectralReader::default().read(&spectral).unwrap();
        assert_eq!(data.pixels(), 4);
        assert_eq!(data.sub_detectors(), 1);

        let gather = dir.path().join("xps.0001");
        hw.trajectory().save_gathered_positions(&gather).await.unwrap();
        let table = read_table(&gather).unwrap();
        assert_eq!(table.values.column(0).to_vec(), vec![3.0, 2.0, 1.0, 0.0]);

        let scaler = dir.path().join("struck.0001");
        hw.scaler().save(&scaler, 3).await.unwrap();
        let table = read_table(&scaler).unwrap();
        assert_eq!(table.values.dim(), (3, 3));
        assert_eq!(table.column_names(), vec!["TSCALER", "I0", "I1"]);
    }

    #[tokio::test]
    async fn test_missing_fault_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let sim = small();
        sim.inject(0, SimFault::MissingSpectral);
        let hw = sim.hardware("fine x", "fine y");
        hw.trajectory()
            .define_line(SIM_AXIS, 0.0, 2.0, 1.0, 0.2)
            .await
            .unwrap();
        let path = dir.path().join("xmap.0001");
        hw.detector().arm(0, &path).await.unwrap();
        hw.trajectory().run("forward").await.unwrap();
        assert!(hw.detector().file_write_complete().await.unwrap());
        assert_eq!(hw.detector().last_written_filename().await.unwrap(), None);
        assert!(!path.exists());

        hw.detector().arm(0, &path).await.unwrap();
        hw.trajectory().run("forward").await.unwrap();
        assert!(path.exists());
        assert_eq!(sim.runs(), 2);
    }

    #[tokio::test]
    async fn test_beam_loss_fault_recovers() {
        let sim = small();
        sim.inject(1, SimFault::BeamLoss);
        let hw = sim.hardware("fine x", "fine y");
        let beam = hw.beam().unwrap();
        hw.detector().arm(1, Path::new("unused")).await.unwrap();
        assert!(!beam.is_ok().await.unwrap());
        assert!(!beam.is_ok().await.unwrap());
        assert!(beam.is_ok().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_motion_fault_delays_file() {
        let dir = tempdir().unwrap();
        let sim = small();
        sim.inject(0, SimFault::SlowMotion);
        let hw = sim.hardware("fine x", "fine y");
        hw.trajectory()
            .define_line(SIM_AXIS, 0.0, 2.0, 1.0, 0.2)
            .await
            .unwrap();
        let path = dir.path().join("xmap.0001");
        hw.detector().arm(0, &path).await.unwrap();
        let start = tokio::time::Instant::now();
        hw.trajectory().run("forward").await.unwrap();
        assert!(start.elapsed() >= SLOW_MOTION_EXTRA);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_rejects_unknown_axis() {
        let hw = small().hardware("fine x", "fine y");
        let accepted = hw
            .trajectory()
            .define_line("Y", 0.0, 1.0, 0.1, 1.0)
            .await
            .unwrap();
        assert!(!accepted);
        assert!(hw.trajectory().run("sideways").await.is_err());
    }
}
