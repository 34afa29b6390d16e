//! fastmap-xmap: mapping-buffer decoder for multi-element spectral detectors.
//!
//! A row's spectral output is a stream of buffer records. Each record is a
//! 256-word buffer header followed by one block per pixel holding 32-bit
//! timing/count statistics (stored as pairs of 16-bit words) and either a
//! full spectrum per channel or per-ROI sums.
//!
//! # Key Components
//!
//! - [`BufferHeader`] / [`PixelHeader`] - typed header decode over a byte slice
//! - [`BufferDecoder`] - two-phase decoder producing [`fastmap_core::SpectralData`]
//! - [`BufferEncoder`] - the inverse, for simulated detectors and tests

mod buffer;
mod encode;
mod error;
pub mod header;

pub use buffer::{decode, discover_records, BufferDecoder, RecordSpan, StreamGeometry};
pub use encode::BufferEncoder;
pub use error::{Error, Result};
pub use header::{BufferHeader, ChannelStats, PixelHeader, Words, CLOCK_TICK};
