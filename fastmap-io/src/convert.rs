//! Raw folder to map store conversion.
//!
//! Appends every row listed in the folder's master index that the store
//! does not hold yet. The same pass serves offline conversion and an append
//! session resuming after a crash.

use crate::folder::{MasterIndex, ScanFolder};
use crate::spectral::SpectralReader;
use crate::store::{MapStore, StoreOptions};
use crate::{Error, Result};
use fastmap_core::{AcquisitionConfig, Reconciler};
use std::ops::Range;
use std::path::Path;
use tracing::{info, info_span, warn};

/// Rows present in the folder but not in the store.
#[must_use]
pub fn rows_pending(store: &MapStore, index: &MasterIndex) -> Range<usize> {
    store.rows().min(index.rows.len())..index.rows.len()
}

/// Outcome of a conversion pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConvertReport {
    /// Rows appended by this pass.
    pub appended: usize,
    /// Rows in the store afterwards.
    pub rows: usize,
    /// Row at which the pass stopped early, with the reason.
    pub stopped: Option<(usize, String)>,
}

/// Converts raw scan folders into map stores.
#[derive(Debug, Clone, Default)]
pub struct Converter {
    config: AcquisitionConfig,
    options: StoreOptions,
}

impl Converter {
    #[must_use]
    pub fn new(config: AcquisitionConfig) -> Self {
        Self {
            options: StoreOptions::default().with_growth(config.growth),
            config,
        }
    }

    #[must_use]
    pub fn with_store_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Opens (or creates) the store at `store_path`, appends pending rows
    /// and closes it.
    ///
    /// # Errors
    /// See [`Converter::append`]; also store open and close errors.
    pub fn convert<P: AsRef<Path>>(&self, folder: &ScanFolder, store_path: P) -> Result<ConvertReport> {
        let mut store = MapStore::create_or_open_with(store_path, self.options.clone())?;
        let result = self.append(folder, &mut store);
        let closed = store.close();
        let report = result?;
        closed?;
        Ok(report)
    }

    /// Appends the rows of `folder` that `store` is missing.
    ///
    /// A row that is not complete yet (unavailable source, too few pixels)
    /// ends the pass early and is reported in [`ConvertReport::stopped`];
    /// a later pass resumes from it.
    ///
    /// # Errors
    /// Folder metadata errors, format and shape errors, and store errors.
    pub fn append(&self, folder: &ScanFolder, store: &mut MapStore) -> Result<ConvertReport> {
        let _span = info_span!("convert", folder = %folder.path().display()).entered();
        let index = folder.read_master()?;
        let snapshot = folder.snapshot()?;
        let plan = snapshot.geometry.plan()?;
        let reader = SpectralReader::new(self.config.spectral_read);

        let mut reconciler = Reconciler::new(
            self.config.reconcile(),
            snapshot.rois.clone(),
            snapshot.geometry.fast_column,
        )
        .with_direction_offset(plan.direction_offset);
        if let Some(layout) = store.layout() {
            reconciler = reconciler.with_layout(layout.clone());
        }

        let pending = rows_pending(store, &index);
        info!(from = pending.start, to = pending.end, "rows pending");
        let mut report = ConvertReport::default();
        for i in pending {
            let reconciled = match folder
                .read_row(&index.rows[i], &reader)
                .and_then(|sources| Ok(reconciler.reconcile(i, sources)?))
            {
                Ok(reconciled) => reconciled,
                Err(e) if e.is_row_recoverable() => {
                    warn!(row = i, error = %e, "stopping at incomplete row");
                    report.stopped = Some((i, e.to_string()));
                    break;
                }
                Err(e) => return Err(e),
            };
            if !store.is_initialized() {
                let layout = reconciler.layout().ok_or(Error::NotInitialized)?;
                store.initialize_schema(&reconciled.row, layout, &snapshot)?;
            }
            store.append_row(&reconciled.row)?;
            report.appended += 1;
        }
        report.rows = store.rows();
        info!(appended = report.appended, rows = report.rows, "conversion pass done");
        Ok(report)
    }
}
