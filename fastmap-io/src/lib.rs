//! fastmap-io: raw scan folder readers and the HDF5 map store.
//!
//! Spectral row files are memory-mapped via memmap2 and decoded with
//! `fastmap-xmap`; scaler and gather files are small text tables. The map
//! store (feature `hdf5`) holds reconciled rows under an advisory
//! single-writer ownership record.

#[cfg(feature = "hdf5")]
pub mod convert;
mod error;
pub mod folder;
mod spectral;
#[cfg(feature = "hdf5")]
pub mod store;
pub mod table;

#[cfg(feature = "hdf5")]
pub use convert::{rows_pending, ConvertReport, Converter};
pub use error::{Error, Result};
pub use folder::{MasterIndex, MasterRow, RoiFile, RowFiles, ScanFolder};
pub use spectral::{MappedFileReader, SpectralReader};
#[cfg(feature = "hdf5")]
pub use store::{MapStore, Owner, StoreOptions, StoreSummary};
pub use table::{format_table, parse_table, read_table, write_table};
