//! HDF5 map store: an incrementally grown, single-writer container for
//! reconciled rows.
//!
//! The schema is created from the first row's [`DetectorLayout`] and is
//! immutable afterwards. Per-row datasets grow in batches following the
//! [`GrowthPolicy`] and are trimmed to the written row count on
//! [`MapStore::close`].

mod ownership;
mod query;
mod schema;

pub use ownership::Owner;
pub use query::StoreSummary;

use crate::{Error, Result};
use fastmap_core::{AcquiredRow, ConfigSnapshot, DetectorLayout, GrowthPolicy};
use hdf5::{File, Group};
use ownership::{read_owner, write_owner};
use schema::{
    create_schema, load_layout, read_attr, row_capacity, set_row_extent, write_attr,
    write_attr_string, write_row, Storage, FORMAT_VERSION, ROOT, ROWS_ATTR,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];

/// Store creation and growth options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub growth: GrowthPolicy,
    /// Deflate level for per-row datasets, `None` to disable.
    pub compression: Option<u8>,
    pub shuffle: bool,
    /// Identity claimed on open.
    pub owner: Owner,
    pub title: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            growth: GrowthPolicy::default(),
            compression: Some(4),
            shuffle: true,
            owner: Owner::current(),
            title: "Fast XRF Map".to_string(),
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn with_growth(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Option<u8>) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    fn storage(&self) -> Storage {
        Storage {
            compression: self.compression,
            shuffle: self.shuffle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug)]
struct SchemaState {
    layout: DetectorLayout,
    dimension: usize,
    capacity: usize,
    rows: usize,
}

/// Handle on one map store file.
#[derive(Debug)]
pub struct MapStore {
    path: PathBuf,
    file: Option<File>,
    access: Access,
    options: StoreOptions,
    schema: Option<SchemaState>,
}

impl MapStore {
    /// Creates the store, or opens an existing one, and claims ownership
    /// as the current process.
    ///
    /// # Errors
    /// [`Error::NotThisFormat`] for a file that is not a map store,
    /// [`Error::OwnershipConflict`] when another process owns it, and
    /// HDF5 errors.
    pub fn create_or_open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_or_open_with(path, StoreOptions::default())
    }

    /// [`MapStore::create_or_open`] with explicit options.
    ///
    /// # Errors
    /// See [`MapStore::create_or_open`].
    pub fn create_or_open_with<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let mut store = Self::open_unowned(path, options)?;
        if !store.claim_ownership()? {
            let owner = store
                .owner()?
                .map_or_else(|| "unknown".to_string(), |o| o.to_string());
            return Err(Error::OwnershipConflict { owner });
        }
        Ok(store)
    }

    /// Creates or opens the store for writing without claiming ownership.
    ///
    /// Mutations fail with [`Error::NotOwner`] until
    /// [`MapStore::claim_ownership`] or [`MapStore::take_over`] succeeds.
    ///
    /// # Errors
    /// [`Error::NotThisFormat`] and HDF5 errors.
    pub fn open_unowned<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.exists() {
            open_existing(path, Access::ReadWrite)?
        } else {
            create_new(path, &options)?
        };
        let mut store = Self {
            path: path.to_path_buf(),
            file: Some(file),
            access: Access::ReadWrite,
            options,
            schema: None,
        };
        store.load_schema()?;
        Ok(store)
    }

    /// Opens an existing store for reading.
    ///
    /// # Errors
    /// [`Error::NotThisFormat`] and HDF5 errors.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = open_existing(path, Access::ReadOnly)?;
        let mut store = Self {
            path: path.to_path_buf(),
            file: Some(file),
            access: Access::ReadOnly,
            options: StoreOptions::default(),
            schema: None,
        };
        store.load_schema()?;
        Ok(store)
    }

    fn load_schema(&mut self) -> Result<()> {
        let root = self.root()?;
        self.schema = match load_layout(&root)? {
            Some(layout) => {
                let rows = read_attr::<u64>(&root, ROWS_ATTR)?.unwrap_or(0);
                let dimension = read_attr::<u64>(&root, "Dimension")?.unwrap_or(1);
                Some(SchemaState {
                    layout,
                    dimension: usize::try_from(dimension).unwrap_or(1),
                    capacity: row_capacity(&root)?,
                    rows: usize::try_from(rows).unwrap_or(0),
                })
            }
            None => None,
        };
        Ok(())
    }

    pub(crate) fn root(&self) -> Result<Group> {
        let file = self.file.as_ref().ok_or(Error::Unwritable("closed"))?;
        Ok(file.group(ROOT)?)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.schema.as_ref().map_or(0, |s| s.rows)
    }

    /// Rows currently allocated in every per-row dataset.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.schema.as_ref().map_or(0, |s| s.capacity)
    }

    /// The layout fixed by [`MapStore::initialize_schema`].
    #[must_use]
    pub fn layout(&self) -> Option<&DetectorLayout> {
        self.schema.as_ref().map(|s| &s.layout)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.schema.is_some()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Identity this handle claims with.
    #[must_use]
    pub fn identity(&self) -> &Owner {
        &self.options.owner
    }

    /// The recorded owner, `None` when unowned.
    ///
    /// # Errors
    /// HDF5 errors, or a closed handle.
    pub fn owner(&self) -> Result<Option<Owner>> {
        read_owner(&self.root()?)
    }

    fn flush(&self) -> Result<()> {
        if let Some(file) = &self.file {
            file.flush()?;
        }
        Ok(())
    }

    /// Claims write ownership if the store is unowned.
    ///
    /// Returns `true` if this handle now holds, or already held, ownership
    /// and `false` if another identity holds it. Repeated calls are
    /// harmless.
    ///
    /// # Errors
    /// HDF5 errors, or a read-only or closed handle.
    pub fn claim_ownership(&mut self) -> Result<bool> {
        if self.access == Access::ReadOnly {
            return Err(Error::Unwritable("read-only"));
        }
        let root = self.root()?;
        match read_owner(&root)? {
            Some(owner) if owner == self.options.owner => Ok(true),
            Some(owner) => {
                debug!(path = %self.path.display(), %owner, "store owned by another process");
                Ok(false)
            }
            None => {
                write_owner(&root, Some(&self.options.owner))?;
                self.flush()?;
                info!(path = %self.path.display(), owner = %self.options.owner, "claimed store");
                Ok(true)
            }
        }
    }

    /// Claims ownership unconditionally, superseding a stale owner.
    ///
    /// Returns the previous owner.
    ///
    /// # Errors
    /// HDF5 errors, or a read-only or closed handle.
    pub fn take_over(&mut self) -> Result<Option<Owner>> {
        if self.access == Access::ReadOnly {
            return Err(Error::Unwritable("read-only"));
        }
        let root = self.root()?;
        let previous = read_owner(&root)?;
        write_owner(&root, Some(&self.options.owner))?;
        self.flush()?;
        if let Some(previous) = previous.as_ref().filter(|p| **p != self.options.owner) {
            warn!(
                path = %self.path.display(),
                %previous,
                owner = %self.options.owner,
                "took over store ownership"
            );
        }
        Ok(previous)
    }

    /// Re-reads the ownership record before a mutation.
    fn ensure_owner(&self) -> Result<Group> {
        if self.access == Access::ReadOnly {
            return Err(Error::Unwritable("read-only"));
        }
        let root = self.root()?;
        match read_owner(&root)? {
            Some(owner) if owner == self.options.owner => Ok(root),
            other => Err(Error::NotOwner {
                owner: other.map_or_else(|| "nobody".to_string(), |o| o.to_string()),
            }),
        }
    }

    /// Creates every group and dataset from the first row's layout and
    /// writes the configuration subtree.
    ///
    /// `first_row` is checked against `layout` but not written.
    ///
    /// # Errors
    /// [`Error::AlreadyInitialized`], [`Error::NotOwner`],
    /// [`Error::ShapeMismatch`] and HDF5 errors.
    pub fn initialize_schema(
        &mut self,
        first_row: &AcquiredRow,
        layout: &DetectorLayout,
        snapshot: &ConfigSnapshot,
    ) -> Result<()> {
        let root = self.ensure_owner()?;
        if self.schema.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        check_row_shape(layout, first_row)?;
        let capacity = self.options.growth.initial_rows.max(1);
        create_schema(&root, layout, snapshot, capacity, self.options.storage())?;
        write_attr(&root, ROWS_ATTR, &0u64)?;
        self.flush()?;
        info!(
            path = %self.path.display(),
            npts = layout.npts,
            sub_detectors = layout.sub_detectors,
            channels = layout.channels,
            rois = layout.rois.len(),
            capacity,
            "initialized store schema"
        );
        self.schema = Some(SchemaState {
            layout: layout.clone(),
            dimension: snapshot.geometry.dimension(),
            capacity,
            rows: 0,
        });
        Ok(())
    }

    /// Appends `row` after the last written row, growing the per-row
    /// datasets in a batch when capacity runs out.
    ///
    /// Returns the new row count.
    ///
    /// # Errors
    /// [`Error::NotOwner`], [`Error::NotInitialized`],
    /// [`Error::ShapeMismatch`], [`Error::RowOrder`] and HDF5 errors.
    pub fn append_row(&mut self, row: &AcquiredRow) -> Result<usize> {
        let root = self.ensure_owner()?;
        let growth = self.options.growth;
        let state = self.schema.as_mut().ok_or(Error::NotInitialized)?;
        check_row_shape(&state.layout, row)?;
        if row.index != state.rows {
            return Err(Error::RowOrder {
                expected: state.rows,
                got: row.index,
            });
        }

        let needed = growth.next_capacity(state.capacity, state.rows);
        if needed != state.capacity {
            set_row_extent(&root, &state.layout, needed)?;
            debug!(from = state.capacity, to = needed, "grew store");
            state.capacity = needed;
        }
        write_row(&root, state.rows, row, &state.layout, state.dimension)?;
        state.rows += 1;
        write_attr(&root, ROWS_ATTR, &(state.rows as u64))?;
        let rows = state.rows;
        self.flush()?;
        debug!(row = row.index, rows, "appended row");
        Ok(rows)
    }

    /// Trims per-row datasets to the written rows, clears ownership,
    /// flushes and releases the file. Later calls do nothing.
    ///
    /// A handle that does not own the store only releases the file.
    ///
    /// # Errors
    /// HDF5 errors.
    pub fn close(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if self.access == Access::ReadWrite {
            let root = file.group(ROOT)?;
            if read_owner(&root)?.as_ref() == Some(&self.options.owner) {
                if let Some(state) = self.schema.as_mut() {
                    set_row_extent(&root, &state.layout, state.rows)?;
                    state.capacity = state.rows;
                }
                write_attr_string(&root, "Stop_Time", &timestamp())?;
                write_owner(&root, None)?;
            }
            file.flush()?;
        }
        info!(path = %self.path.display(), rows = self.rows(), "closed store");
        Ok(())
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn has_hdf5_signature(path: &Path) -> bool {
    let mut magic = [0u8; 8];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .is_ok()
        && magic == HDF5_SIGNATURE
}

fn open_existing(path: &Path, access: Access) -> Result<File> {
    if !has_hdf5_signature(path) {
        return Err(Error::NotThisFormat(path.to_path_buf()));
    }
    let file = match access {
        Access::ReadWrite => File::open_rw(path)?,
        Access::ReadOnly => File::open(path)?,
    };
    if !file.link_exists(ROOT) {
        return Err(Error::NotThisFormat(path.to_path_buf()));
    }
    Ok(file)
}

fn create_new(path: &Path, options: &StoreOptions) -> Result<File> {
    let file = File::create(path)?;
    let root = file.create_group(ROOT)?;
    write_attr_string(&root, "Version", FORMAT_VERSION)?;
    write_attr_string(&root, "Title", &options.title)?;
    write_attr_string(&root, "Start_Time", &timestamp())?;
    write_attr_string(&root, "Stop_Time", "")?;
    write_attr_string(&root, "Map_Folder", "")?;
    write_attr_string(&root, "Correct_Deadtime", "True")?;
    write_attr(&root, "Dimension", &1u64)?;
    write_attr(&root, "Npts", &0u64)?;
    write_attr(&root, ROWS_ATTR, &0u64)?;
    write_owner(&root, None)?;
    file.flush()?;
    debug!(path = %path.display(), "created store");
    Ok(file)
}

fn check_row_shape(layout: &DetectorLayout, row: &AcquiredRow) -> Result<()> {
    let expected = (layout.npts, layout.sub_detectors, layout.channels);
    let got = row.spectra.dim();
    if got != expected {
        return Err(Error::shape(
            "spectra [pixel, sub-detector, channel]",
            format!("{expected:?}"),
            format!("{got:?}"),
        ));
    }
    let scalers = (layout.npts, layout.scaler_count());
    if row.scalers.dim() != scalers {
        return Err(Error::shape(
            "scalers [pixel, channel]",
            format!("{scalers:?}"),
            format!("{:?}", row.scalers.dim()),
        ));
    }
    let rois = (layout.npts, layout.rois.len(), layout.sub_detectors);
    if row.roi_raw.dim() != rois || row.roi_corrected.dim() != rois {
        return Err(Error::shape(
            "roi sums [pixel, roi, sub-detector]",
            format!("{rois:?}"),
            format!("{:?}", row.roi_raw.dim()),
        ));
    }
    if row.fast_positions.len() != layout.npts {
        return Err(Error::shape("positions", layout.npts, row.fast_positions.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_hdf5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.h5");
        std::fs::write(&path, b"plain text, not a store").unwrap();
        assert!(matches!(
            MapStore::create_or_open(&path),
            Err(Error::NotThisFormat(_))
        ));
    }

    #[test]
    fn test_rejects_foreign_hdf5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.h5");
        File::create(&path).unwrap().create_group("entry").unwrap();
        assert!(matches!(
            MapStore::open_read_only(&path),
            Err(Error::NotThisFormat(_))
        ));
    }

    #[test]
    fn test_new_store_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.h5");
        let mut store = MapStore::create_or_open(&path).unwrap();
        assert!(!store.is_initialized());
        assert_eq!(store.owner().unwrap(), Some(Owner::current()));
        let root = store.root().unwrap();
        assert_eq!(
            schema::read_attr_string(&root, "Version").unwrap().as_deref(),
            Some(FORMAT_VERSION)
        );
        drop(root);
        store.close().unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
    }

    #[test]
    fn test_read_only_cannot_claim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.h5");
        MapStore::create_or_open(&path).unwrap().close().unwrap();
        let mut reader = MapStore::open_read_only(&path).unwrap();
        assert!(matches!(reader.claim_ownership(), Err(Error::Unwritable(_))));
        assert_eq!(reader.owner().unwrap(), None);
    }
}
