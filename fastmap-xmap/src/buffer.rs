//! Two-phase mapping-buffer decoding.
//!
//! 1. **Discovery (sequential)**: walk buffer headers and pixel block
//!    headers to find every record, its destination pixel rows and the
//!    detector geometry.
//! 2. **Decode (parallel)**: extract timing statistics and channel data of
//!    each record independently, then merge into one [`SpectralData`].

use crate::header::{
    BufferHeader, ChannelStats, PixelHeader, Words, BUFFER_HEADER_WORDS, CHANNELS_PER_MODULE,
    CLOCK_TICK, PIXEL_HEADER_WORDS, ROI_DATA_OFFSET,
};
use crate::{Error, Result};
use fastmap_core::{MappingMode, SpectralData};
use ndarray::{s, Array3};
use rayon::prelude::*;
use tracing::debug;

/// One buffer record located in the stream.
#[derive(Debug, Clone)]
pub struct RecordSpan {
    /// Word offset of the buffer header.
    pub offset: usize,
    pub header: BufferHeader,
    /// Word offset of each pixel block.
    pub pixel_offsets: Vec<usize>,
    /// Destination pixel row of the first pixel in this record.
    pub first_row: usize,
}

/// Geometry shared by all records of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub mapping_mode: MappingMode,
    pub modules: usize,
    /// Channel slots in use per module.
    pub active_channels: usize,
    /// Spectrum length (full spectrum) or ROI count (ROI-only).
    pub channels: usize,
    /// Complete pixels, counted on module 0.
    pub pixels: usize,
    pub first_pixel: u32,
}

impl StreamGeometry {
    /// Sub-detectors across all modules.
    #[must_use]
    pub fn sub_detectors(&self) -> usize {
        self.modules * self.active_channels
    }
}

/// Locates every record in the stream (phase 1).
///
/// # Errors
/// [`Error::Truncated`] when the stream ends inside a record or holds no
/// record at all; [`Error::Format`] for inconsistent headers.
pub fn discover_records(words: &Words<'_>) -> Result<(StreamGeometry, Vec<RecordSpan>)> {
    let mut records = Vec::new();
    let mut cursors: Vec<usize> = Vec::new();
    let mut geometry: Option<StreamGeometry> = None;
    let mut offset = 0;

    while offset < words.len() {
        let header = BufferHeader::parse(words, offset)?;
        let active = header.active_channels(offset)?;

        let mut pixel_offsets = Vec::with_capacity(header.num_pixels);
        let mut pos = offset + BUFFER_HEADER_WORDS;
        let mut first_pixel_header = None;
        for _ in 0..header.num_pixels {
            let pixel = PixelHeader::parse(words, pos)?;
            if pixel.mapping_mode != header.mapping_mode {
                return Err(Error::format(pos + 3, "pixel mapping mode differs from buffer"));
            }
            words.require(pos, pixel.block_size)?;
            pixel_offsets.push(pos);
            pos += pixel.block_size;
            first_pixel_header.get_or_insert(pixel);
        }

        let channels = match header.mapping_mode {
            MappingMode::FullSpectrum => {
                let size = header.channel_sizes[0];
                if header.channel_sizes[..active].iter().any(|&s| s != size) {
                    return Err(Error::format(
                        offset + 20,
                        format!("unequal channel sizes {:?}", header.channel_sizes),
                    ));
                }
                usize::from(size)
            }
            MappingMode::RoiOnly => first_pixel_header
                .as_ref()
                .map_or(0, |p| p.roi_counts[..active].iter().copied().max().unwrap_or(0).into()),
        };

        let geom = geometry.get_or_insert(StreamGeometry {
            mapping_mode: header.mapping_mode,
            modules: 0,
            active_channels: active,
            channels,
            pixels: 0,
            first_pixel: header.starting_pixel,
        });
        if header.mapping_mode != geom.mapping_mode || active != geom.active_channels {
            return Err(Error::format(offset, "record geometry differs from first record"));
        }
        if geom.channels == 0 {
            geom.channels = channels;
        } else if channels != 0 && channels != geom.channels {
            return Err(Error::format(
                offset,
                format!("{channels} channels, first record had {}", geom.channels),
            ));
        }

        if cursors.len() <= header.module {
            cursors.resize(header.module + 1, 0);
        }
        let first_row = cursors[header.module];
        cursors[header.module] += header.num_pixels;

        records.push(RecordSpan {
            offset,
            header,
            pixel_offsets,
            first_row,
        });
        offset = pos;
    }

    let mut geometry = geometry.ok_or(Error::Truncated {
        needed: BUFFER_HEADER_WORDS,
        available: words.len(),
    })?;
    geometry.modules = cursors.len();
    geometry.pixels = cursors.first().copied().unwrap_or(0);
    for (module, &count) in cursors.iter().enumerate() {
        if count == 0 {
            return Err(Error::format(
                0,
                format!("module {module} has no records, {} modules declared", cursors.len()),
            ));
        }
        if count > geometry.pixels {
            return Err(Error::format(
                0,
                format!(
                    "module {module} holds {count} pixels, module 0 only {}",
                    geometry.pixels
                ),
            ));
        }
        if count < geometry.pixels {
            // Modules are written in turn; a lagging module means the
            // stream stopped between records.
            return Err(Error::Truncated {
                needed: words.len() + BUFFER_HEADER_WORDS,
                available: words.len(),
            });
        }
    }
    Ok((geometry, records))
}

/// Pixels decoded from one record.
#[derive(Debug)]
struct RecordPixels {
    module: usize,
    first_row: usize,
    /// `[pixel, channel_slot, channel]`
    counts: Array3<u32>,
    stats: Vec<[ChannelStats; CHANNELS_PER_MODULE]>,
}

fn decode_record(
    words: &Words<'_>,
    record: &RecordSpan,
    geometry: &StreamGeometry,
) -> Result<RecordPixels> {
    let active = geometry.active_channels;
    let nchan = geometry.channels;
    let npix = record.pixel_offsets.len();
    let mut counts = Array3::<u32>::zeros((npix, active, nchan));
    let mut stats = Vec::with_capacity(npix);

    for (i, &pos) in record.pixel_offsets.iter().enumerate() {
        let pixel = PixelHeader::parse(words, pos)?;
        match geometry.mapping_mode {
            MappingMode::FullSpectrum => {
                let needed = PIXEL_HEADER_WORDS + active * nchan;
                if pixel.block_size < needed {
                    return Err(Error::format(
                        pos + 6,
                        format!("block of {} words, spectra need {needed}", pixel.block_size),
                    ));
                }
                for slot in 0..active {
                    let base = pos + PIXEL_HEADER_WORDS + slot * nchan;
                    for chan in 0..nchan {
                        counts[[i, slot, chan]] = u32::from(words.word(base + chan));
                    }
                }
            }
            MappingMode::RoiOnly => {
                let needed = ROI_DATA_OFFSET + 2 * active * nchan;
                if pixel.block_size < needed {
                    return Err(Error::format(
                        pos + 6,
                        format!("block of {} words, ROI data need {needed}", pixel.block_size),
                    ));
                }
                for slot in 0..active {
                    let base = pos + ROI_DATA_OFFSET + 2 * slot * nchan;
                    for roi in 0..nchan {
                        counts[[i, slot, roi]] = words.long(base + 2 * roi);
                    }
                }
            }
        }
        stats.push(pixel.stats);
    }

    Ok(RecordPixels {
        module: record.header.module,
        first_row: record.first_row,
        counts,
        stats,
    })
}

/// Mapping-buffer decoder.
#[derive(Debug, Clone)]
pub struct BufferDecoder {
    parallel: bool,
}

impl Default for BufferDecoder {
    fn default() -> Self {
        Self { parallel: true }
    }
}

impl BufferDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether records are decoded in parallel.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Decodes a complete mapping-buffer stream.
    ///
    /// # Errors
    /// [`Error::Truncated`] if the stream is incomplete, [`Error::Format`]
    /// if a header is malformed.
    pub fn decode(&self, bytes: &[u8]) -> Result<SpectralData> {
        let words = Words::new(bytes);
        let (geometry, records) = discover_records(&words)?;

        let decoded: Vec<RecordPixels> = if self.parallel && records.len() > 1 {
            records
                .par_iter()
                .map(|r| decode_record(&words, r, &geometry))
                .collect::<Result<_>>()?
        } else {
            records
                .iter()
                .map(|r| decode_record(&words, r, &geometry))
                .collect::<Result<_>>()?
        };

        let mut data = SpectralData::zeros(
            geometry.mapping_mode,
            geometry.pixels,
            geometry.sub_detectors(),
            geometry.channels,
        );
        data.first_pixel = geometry.first_pixel;

        let active = geometry.active_channels;
        for rec in decoded {
            let det0 = rec.module * active;
            let rows = rec.first_row..rec.first_row + rec.stats.len();
            data.counts
                .slice_mut(s![rows.clone(), det0..det0 + active, ..])
                .assign(&rec.counts);
            for (i, stats) in rec.stats.iter().enumerate() {
                let pix = rows.start + i;
                for (slot, st) in stats.iter().take(active).enumerate() {
                    let det = det0 + slot;
                    data.real_time[[pix, det]] = f64::from(st.real_ticks) * CLOCK_TICK;
                    data.live_time[[pix, det]] = f64::from(st.live_ticks) * CLOCK_TICK;
                    data.input_counts[[pix, det]] = st.input_counts;
                    data.output_counts[[pix, det]] = st.output_counts;
                }
            }
        }

        debug!(
            records = records.len(),
            pixels = geometry.pixels,
            sub_detectors = geometry.sub_detectors(),
            channels = geometry.channels,
            "decoded mapping buffer"
        );
        Ok(data)
    }
}

/// Decodes a mapping-buffer stream with the default decoder.
///
/// # Errors
/// See [`BufferDecoder::decode`].
pub fn decode(bytes: &[u8]) -> Result<SpectralData> {
    BufferDecoder::new().decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::BufferEncoder;
    use approx::assert_relative_eq;

    #[allow(clippy::cast_possible_truncation)]
    fn sample(mode: MappingMode, npix: usize, ndet: usize, nchan: usize) -> SpectralData {
        let mut data = SpectralData::zeros(mode, npix, ndet, nchan);
        for ((p, d, c), v) in data.counts.indexed_iter_mut() {
            *v = match mode {
                MappingMode::FullSpectrum => (p * 7 + d * 3 + c) as u32,
                MappingMode::RoiOnly => 70_000 + (p * 100 + d * 10 + c) as u32,
            };
        }
        for ((p, d), v) in data.input_counts.indexed_iter_mut() {
            *v = 100_000 + (p * 4 + d) as u32;
        }
        for ((p, d), v) in data.output_counts.indexed_iter_mut() {
            *v = 90_000 + (p * 4 + d) as u32;
        }
        data.real_time.fill(0.1);
        data.live_time.fill(0.08);
        data
    }

    #[test]
    fn test_decode_single_module() {
        let src = sample(MappingMode::FullSpectrum, 5, 4, 16);
        let bytes = BufferEncoder::new().with_pixels_per_buffer(2).encode(&src).unwrap();
        let out = decode(&bytes).unwrap();
        assert_eq!(out.counts, src.counts);
        assert_eq!(out.input_counts, src.input_counts);
        assert_eq!(out.output_counts, src.output_counts);
        assert_relative_eq!(out.real_time[[3, 2]], 0.1, epsilon = CLOCK_TICK);
        assert_relative_eq!(out.live_time[[4, 0]], 0.08, epsilon = CLOCK_TICK);
    }

    #[test]
    fn test_decode_two_modules_sequential_and_parallel() {
        let src = sample(MappingMode::FullSpectrum, 7, 8, 4);
        let bytes = BufferEncoder::new().with_pixels_per_buffer(3).encode(&src).unwrap();
        let seq = BufferDecoder::new().with_parallel(false).decode(&bytes).unwrap();
        let par = BufferDecoder::new().with_parallel(true).decode(&bytes).unwrap();
        assert_eq!(seq, par);
        assert_eq!(seq.counts, src.counts);
        assert_eq!(seq.sub_detectors(), 8);
    }

    #[test]
    fn test_decode_roi_mode_long_values() {
        let src = sample(MappingMode::RoiOnly, 3, 1, 2);
        let bytes = BufferEncoder::new().encode(&src).unwrap();
        let out = decode(&bytes).unwrap();
        assert_eq!(out.mapping_mode, MappingMode::RoiOnly);
        assert_eq!(out.counts[[2, 0, 1]], 70_201);
        assert_eq!(out.counts, src.counts);
    }

    #[test]
    fn test_truncated_stream() {
        let src = sample(MappingMode::FullSpectrum, 4, 4, 8);
        let bytes = BufferEncoder::new().encode(&src).unwrap();
        let cut = &bytes[..bytes.len() - 10];
        let err = decode(cut).unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[test]
    fn test_empty_stream_is_truncated() {
        assert!(matches!(decode(&[]), Err(Error::Truncated { available: 0, .. })));
    }

    #[test]
    fn test_corrupt_pixel_tag() {
        let src = sample(MappingMode::FullSpectrum, 2, 4, 8);
        let mut bytes = BufferEncoder::new().encode(&src).unwrap();
        let pixel_start = 2 * BUFFER_HEADER_WORDS;
        bytes[pixel_start] = 0;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        assert!(!err.is_transient());
    }

    /// Rewrites the module number (word 11) of the record at `record`.
    fn set_module(bytes: &mut [u8], record: usize, record_words: usize, module: u16) {
        let at = 2 * (record * record_words + 11);
        bytes[at..at + 2].copy_from_slice(&module.to_le_bytes());
    }

    #[test]
    fn test_module_gap_is_format_error() {
        // 2 pixels x 8 sub-detectors: one record per module.
        let src = sample(MappingMode::FullSpectrum, 2, 8, 4);
        let mut bytes = BufferEncoder::new().encode(&src).unwrap();
        let record_words = bytes.len() / 2 / 2;
        set_module(&mut bytes, 1, record_words, 9);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Format { .. }), "{err}");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_module_number_over_limit_is_format_error() {
        let src = sample(MappingMode::FullSpectrum, 2, 4, 4);
        let mut bytes = BufferEncoder::new().encode(&src).unwrap();
        let record_words = bytes.len() / 2;
        set_module(&mut bytes, 0, record_words, u16::MAX);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Format { offset: 11, .. }), "{err}");
    }

    #[test]
    fn test_lagging_module_is_truncated() {
        // Records alternate module 0, module 1; drop the last module-1 record.
        let src = sample(MappingMode::FullSpectrum, 4, 8, 4);
        let bytes = BufferEncoder::new().with_pixels_per_buffer(2).encode(&src).unwrap();
        let record_bytes = bytes.len() / 4;
        let err = decode(&bytes[..3 * record_bytes]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }), "{err}");
        assert!(err.is_transient());
    }

    #[test]
    fn test_discover_records_rows() {
        let src = sample(MappingMode::FullSpectrum, 5, 4, 4);
        let bytes = BufferEncoder::new().with_pixels_per_buffer(2).encode(&src).unwrap();
        let words = Words::new(&bytes);
        let (geometry, records) = discover_records(&words).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(geometry.pixels, 5);
        assert_eq!(
            records.iter().map(|r| r.first_row).collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
    }
}
