//! Mapping-buffer encoder, used by simulated detectors and tests.

use crate::header::{
    split_long, BufferHeader, ChannelStats, PixelHeader, CHANNELS_PER_MODULE, CLOCK_TICK,
    PIXEL_HEADER_WORDS, ROI_DATA_OFFSET,
};
use crate::{Error, Result};
use fastmap_core::{MappingMode, SpectralData};

/// Writes [`SpectralData`] in the detector's mapping-buffer layout.
#[derive(Debug, Clone)]
pub struct BufferEncoder {
    pixels_per_buffer: usize,
    run_number: u16,
}

impl Default for BufferEncoder {
    fn default() -> Self {
        Self {
            pixels_per_buffer: 124,
            run_number: 0,
        }
    }
}

impl BufferEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of pixels per buffer record.
    #[must_use]
    pub fn with_pixels_per_buffer(mut self, pixels: usize) -> Self {
        self.pixels_per_buffer = pixels.max(1);
        self
    }

    #[must_use]
    pub fn with_run_number(mut self, run: u16) -> Self {
        self.run_number = run;
        self
    }

    /// Encodes `data` as a byte stream.
    ///
    /// Up to four sub-detectors fit in one module; more must be a multiple
    /// of four.
    ///
    /// # Errors
    /// [`Error::Format`] if the sub-detector or channel count cannot be
    /// represented.
    pub fn encode(&self, data: &SpectralData) -> Result<Vec<u8>> {
        let words = self.encode_words(data)?;
        Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
    }

    fn encode_words(&self, data: &SpectralData) -> Result<Vec<u16>> {
        let ndet = data.sub_detectors();
        let nchan = data.channels();
        let (modules, active) = match ndet {
            0 => return Err(Error::format(0, "no sub-detectors to encode")),
            n if n <= CHANNELS_PER_MODULE => (1, n),
            n if n % CHANNELS_PER_MODULE == 0 => (n / CHANNELS_PER_MODULE, CHANNELS_PER_MODULE),
            n => {
                return Err(Error::format(
                    0,
                    format!("{n} sub-detectors do not fill whole modules"),
                ))
            }
        };
        let size = u16::try_from(nchan)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| Error::format(20, format!("cannot encode {nchan} channels")))?;
        let mut channel_sizes = [0u16; CHANNELS_PER_MODULE];
        channel_sizes[..active].fill(size);

        let block_size = match data.mapping_mode {
            MappingMode::FullSpectrum => PIXEL_HEADER_WORDS + active * nchan,
            MappingMode::RoiOnly => ROI_DATA_OFFSET + 2 * active * nchan,
        };

        let npix = data.pixels();
        let mut out = Vec::new();
        let mut buffer_number = 0u32;
        let mut chunk_start = 0;
        while chunk_start < npix {
            let chunk_end = (chunk_start + self.pixels_per_buffer).min(npix);
            let starting_pixel = data.first_pixel + u32::try_from(chunk_start).unwrap_or(u32::MAX);
            for module in 0..modules {
                BufferHeader {
                    mapping_mode: data.mapping_mode,
                    run_number: self.run_number,
                    buffer_number,
                    buffer_id: u16::from(buffer_number % 2 == 1),
                    num_pixels: chunk_end - chunk_start,
                    starting_pixel,
                    module,
                    channel_sizes,
                    buffer_errors: 0,
                }
                .encode(&mut out);

                for pix in chunk_start..chunk_end {
                    let det0 = module * active;
                    let mut stats = [ChannelStats::default(); CHANNELS_PER_MODULE];
                    for (slot, st) in stats.iter_mut().take(active).enumerate() {
                        let det = det0 + slot;
                        *st = ChannelStats {
                            real_ticks: ticks(data.real_time[[pix, det]]),
                            live_ticks: ticks(data.live_time[[pix, det]]),
                            input_counts: data.input_counts[[pix, det]],
                            output_counts: data.output_counts[[pix, det]],
                        };
                    }
                    let mut roi_counts = [0u16; CHANNELS_PER_MODULE];
                    if data.mapping_mode == MappingMode::RoiOnly {
                        roi_counts[..active].fill(size);
                    }
                    PixelHeader {
                        mapping_mode: data.mapping_mode,
                        pixel_number: starting_pixel
                            + u32::try_from(pix - chunk_start).unwrap_or(u32::MAX),
                        block_size,
                        roi_counts,
                        stats,
                    }
                    .encode(&mut out);

                    match data.mapping_mode {
                        MappingMode::FullSpectrum => {
                            out.resize(out.len() + PIXEL_HEADER_WORDS - ROI_DATA_OFFSET, 0);
                            for slot in 0..active {
                                out.extend((0..nchan).map(|c| {
                                    u16::try_from(data.counts[[pix, det0 + slot, c]])
                                        .unwrap_or(u16::MAX)
                                }));
                            }
                        }
                        MappingMode::RoiOnly => {
                            for slot in 0..active {
                                for roi in 0..nchan {
                                    let (lo, hi) = split_long(data.counts[[pix, det0 + slot, roi]]);
                                    out.push(lo);
                                    out.push(hi);
                                }
                            }
                        }
                    }
                }
            }
            buffer_number += 1;
            chunk_start = chunk_end;
        }
        Ok(out)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ticks(seconds: f64) -> u32 {
    (seconds / CLOCK_TICK).round().clamp(0.0, f64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Words, BUFFER_HEADER_WORDS};

    #[test]
    fn test_block_layout_full_spectrum() {
        let data = SpectralData::zeros(MappingMode::FullSpectrum, 3, 2, 10);
        let bytes = BufferEncoder::new().encode(&data).unwrap();
        let words = Words::new(&bytes);
        assert_eq!(words.len(), BUFFER_HEADER_WORDS + 3 * (PIXEL_HEADER_WORDS + 2 * 10));
        assert_eq!(words.word(8), 3);
        assert_eq!(words.word(20), 10);
        assert_eq!(words.word(22), 0);
    }

    #[test]
    fn test_rejects_partial_module() {
        let data = SpectralData::zeros(MappingMode::FullSpectrum, 1, 6, 4);
        assert!(BufferEncoder::new().encode(&data).is_err());
    }

    #[test]
    fn test_ticks_rounding() {
        assert_eq!(ticks(0.1), 312_500);
        assert_eq!(ticks(-1.0), 0);
    }
}
