//! fastmap-core: Core types and row reconciliation for raster XRF mapping.
//!
//! This crate holds the data model shared by the readers, the structured
//! store and the scan orchestrator, plus the Row Reconciler that turns one
//! row's heterogeneous hardware output into a single [`AcquiredRow`].

pub mod config;
pub mod error;
pub mod geometry;
pub mod layout;
pub mod reconcile;
pub mod retry;
pub mod roi;
pub mod row;

pub use config::{AcquisitionConfig, GrowthPolicy};
pub use error::{Error, Result};
pub use geometry::{AxisRange, AxisSpec, ConfigSnapshot, EnvironmentEntry, ScanGeometry, ScanPlan};
pub use layout::{DetectorLayout, MappingMode};
pub use reconcile::{Adjustment, ReconcileConfig, ReconciledRow, Reconciler, RowSources};
pub use retry::RetryPolicy;
pub use roi::{EnergyCalibration, RoiDefinition, RoiTable};
pub use row::{AcquiredRow, SourceKind, SpectralData, Table};
