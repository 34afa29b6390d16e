//! Hardware capability traits consumed by the scan orchestrator.
//!
//! The orchestrator never talks to a concrete device. It drives small
//! capability traits, so the same row loop runs against beamline hardware,
//! the simulator in [`crate::sim`], or a test double:
//!
//! - [`Positioner`] - a single motor axis
//! - [`TrajectoryController`] - the motion subsystem that runs a fast-axis line
//!   and records gathered positions
//! - [`SpectralDetector`] - the multi-element detector writing one buffer
//!   file per row
//! - [`Scaler`] - the multi-channel counter writing one table per row
//! - [`BeamMonitor`] - the beam/source quality check, consulted once per row
//! - [`EnvironmentSource`] - process variables recorded once per scan
//!
//! # Device contract
//!
//! Methods are awaited from the orchestrator's task and may be called from
//! several tasks at once (motion runs on a spawned task while the scaler is
//! saved), hence the `Send + Sync` bound. Failures are reported as
//! `anyhow::Error` and surface as [`crate::Error::Hardware`]; a device that
//! is merely not ready yet answers `Ok(false)` to its readiness query and
//! is polled again under the configured budget. The table savers
//! ([`Scaler::save`], [`TrajectoryController::save_gathered_positions`])
//! return once their file is complete; the spectral detector writes in the
//! background and reports completion through
//! [`SpectralDetector::file_write_complete`].

use anyhow::Result;
use async_trait::async_trait;
use fastmap_core::EnvironmentEntry;
use fastmap_io::RoiFile;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A motor axis.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Name the axis is addressed by in scan geometries.
    fn name(&self) -> &str;

    /// Reads the current position.
    async fn get_value(&self) -> Result<f64>;

    /// Moves to `value`; with `wait` the call returns once the move is done.
    async fn set_value(&self, value: f64, wait: bool) -> Result<()>;
}

/// Motion subsystem executing fast-axis lines.
#[async_trait]
pub trait TrajectoryController: Send + Sync {
    /// Defines the "forward" and "backward" lines for `axis`.
    ///
    /// Returns `false` if the controller cannot run the line.
    async fn define_line(
        &self,
        axis: &str,
        start: f64,
        stop: f64,
        step: f64,
        total_time: f64,
    ) -> Result<bool>;

    /// Runs a defined line; resolves when the motion is finished.
    async fn run(&self, name: &str) -> Result<()>;

    /// Writes the positions gathered during the last line to `path`.
    async fn save_gathered_positions(&self, path: &Path) -> Result<()>;
}

/// Spectral detector in mapping mode.
#[async_trait]
pub trait SpectralDetector: Send + Sync {
    /// Arms acquisition of row `row` into `path`.
    async fn arm(&self, row: usize, path: &Path) -> Result<()>;

    async fn is_acquiring(&self) -> Result<bool>;

    /// True once the detector has closed its current output file.
    async fn file_write_complete(&self) -> Result<bool>;

    /// The last file the detector finished writing.
    async fn last_written_filename(&self) -> Result<Option<PathBuf>>;

    /// The detector's current ROI table and energy calibration.
    async fn rois(&self) -> Result<RoiFile>;
}

/// Multi-channel scaler counting per trajectory pulse.
#[async_trait]
pub trait Scaler: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Saves the first `npts` counted pixels as a table to `path`.
    async fn save(&self, path: &Path, npts: usize) -> Result<()>;
}

/// Beam/source quality check.
#[async_trait]
pub trait BeamMonitor: Send + Sync {
    async fn is_ok(&self) -> Result<bool>;
}

/// Beamline state recorded alongside a scan.
#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<EnvironmentEntry>>;
}

/// The set of devices one orchestrator drives.
///
/// Positioners are keyed by name. A positioner may act as the fast axis
/// only if it is mapped to a trajectory axis with
/// [`Hardware::with_trajectory_axis`].
#[derive(Clone)]
pub struct Hardware {
    positioners: BTreeMap<String, Arc<dyn Positioner>>,
    trajectory_axes: BTreeMap<String, String>,
    trajectory: Arc<dyn TrajectoryController>,
    detector: Arc<dyn SpectralDetector>,
    scaler: Arc<dyn Scaler>,
    beam: Option<Arc<dyn BeamMonitor>>,
    environment: Option<Arc<dyn EnvironmentSource>>,
}

impl Hardware {
    #[must_use]
    pub fn new(
        trajectory: Arc<dyn TrajectoryController>,
        detector: Arc<dyn SpectralDetector>,
        scaler: Arc<dyn Scaler>,
    ) -> Self {
        Self {
            positioners: BTreeMap::new(),
            trajectory_axes: BTreeMap::new(),
            trajectory,
            detector,
            scaler,
            beam: None,
            environment: None,
        }
    }

    #[must_use]
    pub fn with_positioner(mut self, positioner: Arc<dyn Positioner>) -> Self {
        self.positioners
            .insert(positioner.name().to_string(), positioner);
        self
    }

    /// Declares that positioner `name` is driven as trajectory axis `axis`.
    #[must_use]
    pub fn with_trajectory_axis(mut self, name: impl Into<String>, axis: impl Into<String>) -> Self {
        self.trajectory_axes.insert(name.into(), axis.into());
        self
    }

    #[must_use]
    pub fn with_beam_monitor(mut self, beam: Arc<dyn BeamMonitor>) -> Self {
        self.beam = Some(beam);
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentSource>) -> Self {
        self.environment = Some(environment);
        self
    }

    #[must_use]
    pub fn positioner(&self, name: &str) -> Option<&Arc<dyn Positioner>> {
        self.positioners.get(name)
    }

    pub fn positioners(&self) -> impl Iterator<Item = &Arc<dyn Positioner>> {
        self.positioners.values()
    }

    /// Trajectory axis for positioner `name`, if it can be the fast axis.
    #[must_use]
    pub fn trajectory_axis(&self, name: &str) -> Option<&str> {
        self.trajectory_axes.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn trajectory(&self) -> &Arc<dyn TrajectoryController> {
        &self.trajectory
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<dyn SpectralDetector> {
        &self.detector
    }

    #[must_use]
    pub fn scaler(&self) -> &Arc<dyn Scaler> {
        &self.scaler
    }

    #[must_use]
    pub fn beam(&self) -> Option<&Arc<dyn BeamMonitor>> {
        self.beam.as_ref()
    }

    #[must_use]
    pub fn environment(&self) -> Option<&Arc<dyn EnvironmentSource>> {
        self.environment.as_ref()
    }
}

impl fmt::Debug for Hardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hardware")
            .field("positioners", &self.positioners.keys().collect::<Vec<_>>())
            .field("trajectory_axes", &self.trajectory_axes)
            .field("beam", &self.beam.is_some())
            .field("environment", &self.environment.is_some())
            .finish_non_exhaustive()
    }
}
