//! fastmap-scan: async orchestration of raster XRF fast maps.
//!
//! The [`Orchestrator`] sequences row acquisition over the hardware
//! capability traits in [`hardware`], hands each row to the reconciler
//! and appends it to the map store. Rows that come back unreliable are
//! acquired again once; a beam fault pauses the row until the beam
//! recovers.
//!
//! # Key Components
//!
//! - [`Orchestrator`] - scan lifecycle: start, per-row loop, abort
//! - [`hardware`] - capability traits and the [`Hardware`] device set
//! - [`ScanStatus`] - operator-facing status published on a watch channel
//! - [`sim`] - simulated beamline writing real raw files

mod error;
pub mod hardware;
mod orchestrator;
mod pipeline;
pub mod poll;
pub mod sim;
mod status;

pub use error::{Error, Result};
pub use hardware::Hardware;
pub use orchestrator::{next_scan_folder, store_path_for, Orchestrator, ScanReport};
pub use status::{AbortHandle, ScanState, ScanStatus};
