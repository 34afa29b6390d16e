//! Detector layout fixed by the first reconciled row.

use crate::roi::RoiTable;
use serde::{Deserialize, Serialize};

/// Spectral detector mapping mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingMode {
    /// Full spectrum per pixel.
    FullSpectrum,
    /// Only per-ROI sums per pixel.
    RoiOnly,
}

impl MappingMode {
    /// Mode code as written in buffer headers.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            MappingMode::FullSpectrum => 1,
            MappingMode::RoiOnly => 2,
        }
    }

    /// Parses a buffer header mode code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(MappingMode::FullSpectrum),
            2 => Some(MappingMode::RoiOnly),
            _ => None,
        }
    }
}

/// Array dimensions and channel naming shared by every row of a scan.
///
/// Produced once by the reconciler from row 0 and passed to the store and
/// to every later reconciliation instead of being re-derived from data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorLayout {
    /// Pixels per row.
    pub npts: usize,
    /// Number of sub-detectors.
    pub sub_detectors: usize,
    /// Channels per sub-detector spectrum.
    pub channels: usize,
    pub mapping_mode: MappingMode,
    /// Scaler channel labels, in column order.
    pub scaler_names: Vec<String>,
    pub rois: RoiTable,
}

impl DetectorLayout {
    #[must_use]
    pub fn scaler_count(&self) -> usize {
        self.scaler_names.len()
    }

    /// Names of the per-sub-detector ROI map columns: scalers first, then
    /// each ROI for every sub-detector.
    #[must_use]
    pub fn detector_channel_names(&self) -> Vec<String> {
        let mut names = self.scaler_names.clone();
        for roi in self.rois.iter() {
            for det in 0..self.sub_detectors {
                names.push(format!("{} (mca{})", roi.name, det + 1));
            }
        }
        names
    }

    /// Names of the summed ROI map columns: scalers, then each ROI.
    #[must_use]
    pub fn summed_channel_names(&self) -> Vec<String> {
        let mut names = self.scaler_names.clone();
        names.extend(self.rois.names());
        names
    }

    /// Column of `roi` on `sub_detector` in the per-sub-detector map.
    #[must_use]
    pub fn detector_column(&self, roi: usize, sub_detector: usize) -> usize {
        self.scaler_count() + roi * self.sub_detectors + sub_detector
    }

    /// Column of `roi` in the summed map.
    #[must_use]
    pub fn summed_column(&self, roi: usize) -> usize {
        self.scaler_count() + roi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi::RoiDefinition;

    fn layout() -> DetectorLayout {
        DetectorLayout {
            npts: 3,
            sub_detectors: 2,
            channels: 16,
            mapping_mode: MappingMode::FullSpectrum,
            scaler_names: vec!["I0".into(), "I1".into()],
            rois: RoiTable::new(vec![
                RoiDefinition::uniform("Fe", 1, 4, 2),
                RoiDefinition::uniform("Zn", 6, 9, 2),
            ]),
        }
    }

    #[test]
    fn test_channel_names() {
        let l = layout();
        assert_eq!(
            l.detector_channel_names(),
            vec!["I0", "I1", "Fe (mca1)", "Fe (mca2)", "Zn (mca1)", "Zn (mca2)"]
        );
        assert_eq!(l.summed_channel_names(), vec!["I0", "I1", "Fe", "Zn"]);
        assert_eq!(l.detector_column(1, 1), 5);
        assert_eq!(l.summed_column(1), 3);
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(MappingMode::from_code(2), Some(MappingMode::RoiOnly));
        assert_eq!(MappingMode::from_code(3), None);
        assert_eq!(MappingMode::FullSpectrum.code(), 1);
    }
}
