//! Buffer and pixel header layouts.
//!
//! The stream is a sequence of little-endian 16-bit words. 32-bit fields are
//! stored as two consecutive words, low word first.

use crate::{Error, Result};
use fastmap_core::MappingMode;

/// Words in a buffer header.
pub const BUFFER_HEADER_WORDS: usize = 256;
/// Words in a full-spectrum pixel header; spectra start right after it.
pub const PIXEL_HEADER_WORDS: usize = 256;
/// Word offset of ROI-only data inside a pixel block.
pub const ROI_DATA_OFFSET: usize = 64;
/// Channels (sub-detector slots) per module.
pub const CHANNELS_PER_MODULE: usize = 4;
/// Highest module count a stream may declare.
pub const MAX_MODULES: usize = 32;
/// Duration of one timing tick in seconds.
pub const CLOCK_TICK: f64 = 320e-9;

pub const BUFFER_TAG0: u16 = 0x55AA;
pub const BUFFER_TAG1: u16 = 0xAA55;
pub const PIXEL_TAG0: u16 = 0x33CC;
pub const PIXEL_TAG1: u16 = 0xCC33;

/// Word offset of the sixteen timing/count values in a pixel block.
const STATS_OFFSET: usize = 32;

/// Little-endian 16-bit word view over a byte slice.
#[derive(Debug, Clone, Copy)]
pub struct Words<'a> {
    bytes: &'a [u8],
}

impl<'a> Words<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Number of complete words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len() / 2
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Word at `index`. Callers check bounds against [`Words::len`].
    #[inline]
    #[must_use]
    pub fn word(&self, index: usize) -> u16 {
        u16::from_le_bytes([self.bytes[2 * index], self.bytes[2 * index + 1]])
    }

    /// 32-bit value stored at `index` (low word) and `index + 1` (high word).
    #[inline]
    #[must_use]
    pub fn long(&self, index: usize) -> u32 {
        join_words(self.word(index), self.word(index + 1))
    }

    /// Fails with [`Error::Truncated`] unless `count` words exist from `start`.
    pub fn require(&self, start: usize, count: usize) -> Result<()> {
        let needed = start + count;
        if needed > self.len() {
            return Err(Error::Truncated {
                needed,
                available: self.len(),
            });
        }
        Ok(())
    }
}

/// Joins two 16-bit words into a 32-bit value, low word first.
#[inline]
#[must_use]
pub fn join_words(lo: u16, hi: u16) -> u32 {
    u32::from(lo) | (u32::from(hi) << 16)
}

/// Splits a 32-bit value into `(lo, hi)` words.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn split_long(value: u32) -> (u16, u16) {
    ((value & 0xFFFF) as u16, (value >> 16) as u16)
}

/// Decoded buffer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHeader {
    pub mapping_mode: MappingMode,
    pub run_number: u16,
    pub buffer_number: u32,
    /// 0 = buffer A, 1 = buffer B.
    pub buffer_id: u16,
    pub num_pixels: usize,
    pub starting_pixel: u32,
    pub module: usize,
    /// Per-channel sizes; 0 marks an unused channel slot.
    pub channel_sizes: [u16; CHANNELS_PER_MODULE],
    pub buffer_errors: u16,
}

impl BufferHeader {
    /// Parses the header at word `offset`.
    ///
    /// # Errors
    /// [`Error::Truncated`] if fewer than 256 words remain, [`Error::Format`]
    /// for bad tags, header size or mapping mode.
    pub fn parse(words: &Words<'_>, offset: usize) -> Result<Self> {
        words.require(offset, BUFFER_HEADER_WORDS)?;
        let w = |i: usize| words.word(offset + i);
        if w(0) != BUFFER_TAG0 || w(1) != BUFFER_TAG1 {
            return Err(Error::format(
                offset,
                format!("bad buffer tags {:#06x} {:#06x}", w(0), w(1)),
            ));
        }
        if usize::from(w(2)) != BUFFER_HEADER_WORDS {
            return Err(Error::format(
                offset + 2,
                format!("buffer header size {} (expected 256)", w(2)),
            ));
        }
        let mapping_mode = MappingMode::from_code(w(3)).ok_or_else(|| {
            Error::format(offset + 3, format!("unsupported mapping mode {}", w(3)))
        })?;
        let module = usize::from(w(11));
        if module >= MAX_MODULES {
            return Err(Error::format(
                offset + 11,
                format!("module number {module} (at most {MAX_MODULES} modules)"),
            ));
        }
        Ok(Self {
            mapping_mode,
            run_number: w(4),
            buffer_number: words.long(offset + 5),
            buffer_id: w(7),
            num_pixels: usize::from(w(8)),
            starting_pixel: words.long(offset + 9),
            module,
            channel_sizes: [w(20), w(21), w(22), w(23)],
            buffer_errors: w(24),
        })
    }

    /// Number of leading channel slots in use.
    ///
    /// # Errors
    /// [`Error::Format`] when no slot is in use or a used slot follows an
    /// unused one.
    pub fn active_channels(&self, offset: usize) -> Result<usize> {
        let active = self.channel_sizes.iter().take_while(|&&s| s > 0).count();
        if active == 0 || self.channel_sizes[active..].iter().any(|&s| s > 0) {
            return Err(Error::format(
                offset + 20,
                format!("invalid channel sizes {:?}", self.channel_sizes),
            ));
        }
        Ok(active)
    }

    /// Writes this header into `out` (256 words).
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, out: &mut Vec<u16>) {
        let start = out.len();
        out.resize(start + BUFFER_HEADER_WORDS, 0);
        let h = &mut out[start..];
        h[0] = BUFFER_TAG0;
        h[1] = BUFFER_TAG1;
        h[2] = BUFFER_HEADER_WORDS as u16;
        h[3] = self.mapping_mode.code();
        h[4] = self.run_number;
        (h[5], h[6]) = split_long(self.buffer_number);
        h[7] = self.buffer_id;
        h[8] = u16::try_from(self.num_pixels).unwrap_or(u16::MAX);
        (h[9], h[10]) = split_long(self.starting_pixel);
        h[11] = u16::try_from(self.module).unwrap_or(u16::MAX);
        for (c, size) in self.channel_sizes.iter().enumerate() {
            h[12 + 2 * c] = u16::try_from(c).unwrap_or(0);
            h[20 + c] = *size;
        }
        h[24] = self.buffer_errors;
    }
}

/// Timing and count totals of one channel for one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    pub real_ticks: u32,
    pub live_ticks: u32,
    pub input_counts: u32,
    pub output_counts: u32,
}

/// Decoded pixel header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelHeader {
    pub mapping_mode: MappingMode,
    pub pixel_number: u32,
    /// Total block size in words, header included.
    pub block_size: usize,
    /// ROI count per channel (ROI-only mode).
    pub roi_counts: [u16; CHANNELS_PER_MODULE],
    pub stats: [ChannelStats; CHANNELS_PER_MODULE],
}

impl PixelHeader {
    /// Parses the pixel block header at word `offset`.
    ///
    /// # Errors
    /// [`Error::Truncated`] if the header runs past the stream,
    /// [`Error::Format`] for bad tags or mapping mode.
    pub fn parse(words: &Words<'_>, offset: usize) -> Result<Self> {
        words.require(offset, ROI_DATA_OFFSET)?;
        let w = |i: usize| words.word(offset + i);
        if w(0) != PIXEL_TAG0 || w(1) != PIXEL_TAG1 {
            return Err(Error::format(
                offset,
                format!("bad pixel tags {:#06x} {:#06x}", w(0), w(1)),
            ));
        }
        let mapping_mode = MappingMode::from_code(w(3)).ok_or_else(|| {
            Error::format(offset + 3, format!("unsupported pixel mapping mode {}", w(3)))
        })?;
        let block_size = usize::try_from(words.long(offset + 6)).unwrap_or(usize::MAX);
        if block_size < ROI_DATA_OFFSET {
            return Err(Error::format(
                offset + 6,
                format!("pixel block size {block_size} smaller than its header"),
            ));
        }
        let mut stats = [ChannelStats::default(); CHANNELS_PER_MODULE];
        for (c, s) in stats.iter_mut().enumerate() {
            let base = offset + STATS_OFFSET + 8 * c;
            *s = ChannelStats {
                real_ticks: words.long(base),
                live_ticks: words.long(base + 2),
                input_counts: words.long(base + 4),
                output_counts: words.long(base + 6),
            };
        }
        Ok(Self {
            mapping_mode,
            pixel_number: words.long(offset + 4),
            block_size,
            roi_counts: [w(8), w(9), w(10), w(11)],
            stats,
        })
    }

    /// Writes the first 64 header words into `out`; the caller appends the
    /// remainder of the block.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, out: &mut Vec<u16>) {
        let start = out.len();
        out.resize(start + ROI_DATA_OFFSET, 0);
        let h = &mut out[start..];
        h[0] = PIXEL_TAG0;
        h[1] = PIXEL_TAG1;
        h[2] = PIXEL_HEADER_WORDS as u16;
        h[3] = self.mapping_mode.code();
        (h[4], h[5]) = split_long(self.pixel_number);
        (h[6], h[7]) = split_long(u32::try_from(self.block_size).unwrap_or(u32::MAX));
        h[8..12].copy_from_slice(&self.roi_counts);
        for (c, s) in self.stats.iter().enumerate() {
            let base = STATS_OFFSET + 8 * c;
            (h[base], h[base + 1]) = split_long(s.real_ticks);
            (h[base + 2], h[base + 3]) = split_long(s.live_ticks);
            (h[base + 4], h[base + 5]) = split_long(s.input_counts);
            (h[base + 6], h[base + 7]) = split_long(s.output_counts);
        }
    }
}
