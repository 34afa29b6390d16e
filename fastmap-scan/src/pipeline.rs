//! Blocking half of the row loop: read, reconcile, append.
//!
//! File reads and HDF5 writes block, so the orchestrator moves the whole
//! pipeline into `spawn_blocking` for each row and gets it back afterwards.

use crate::error::Result;
use fastmap_core::{AcquisitionConfig, ConfigSnapshot, Reconciler};
use fastmap_io::{MapStore, MasterRow, ScanFolder, SpectralReader};
use tracing::{debug, info, warn};

/// What one ingested row contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IngestReport {
    pub rows: usize,
    pub npts: usize,
    pub adjustments: usize,
}

#[derive(Debug)]
pub(crate) struct RowPipeline {
    folder: ScanFolder,
    reader: SpectralReader,
    reconciler: Reconciler,
    store: MapStore,
    snapshot: ConfigSnapshot,
}

impl RowPipeline {
    pub(crate) fn new(
        folder: ScanFolder,
        store: MapStore,
        snapshot: ConfigSnapshot,
        config: &AcquisitionConfig,
        direction_offset: usize,
    ) -> Self {
        let reconciler = Reconciler::new(
            config.reconcile(),
            snapshot.rois.clone(),
            snapshot.geometry.fast_column,
        )
        .with_direction_offset(direction_offset);
        Self {
            folder,
            reader: SpectralReader::new(config.spectral_read),
            reconciler,
            store,
            snapshot,
        }
    }

    /// Replaces the parts of the snapshot learned while the first row ran.
    pub(crate) fn set_snapshot(&mut self, snapshot: ConfigSnapshot) {
        self.snapshot = snapshot;
    }

    /// Reads row `index` from the folder, reconciles it and appends it to
    /// the store, initializing the schema on the first row. The master
    /// line is written only after the store accepted the row.
    pub(crate) fn ingest(&mut self, index: usize, master: &MasterRow) -> Result<IngestReport> {
        let sources = self.folder.read_row(master, &self.reader)?;
        let reconciled = self.reconciler.reconcile(index, sources)?;
        for adj in &reconciled.adjustments {
            warn!(row = index, ?adj, "row conformed");
        }
        if !self.store.is_initialized() {
            let layout = self
                .reconciler
                .layout()
                .ok_or(fastmap_io::Error::NotInitialized)?;
            self.store
                .initialize_schema(&reconciled.row, layout, &self.snapshot)?;
        }
        let rows = self.store.append_row(&reconciled.row)?;
        self.folder.append_master_row(master)?;
        debug!(row = index, rows, "row stored");
        Ok(IngestReport {
            rows,
            npts: reconciled.row.pixels(),
            adjustments: reconciled.adjustments.len(),
        })
    }

    /// Trims and releases the store.
    pub(crate) fn close(&mut self) -> Result<()> {
        self.store.close()?;
        info!(
            path = %self.store.path().display(),
            rows = self.store.rows(),
            "store closed"
        );
        Ok(())
    }
}
