//! Raw scan folder: per-row hardware files plus the per-scan index and
//! metadata files.
//!
//! ```text
//! <folder>/Master.dat     header + one line per completed row
//! <folder>/Environ.dat    "; title (address) = value"
//! <folder>/Rois.json      ROI table and per-sub-detector calibration
//! <folder>/Scan.json      requested geometry
//! <folder>/xmap.NNNN      spectral buffer file (1-based row number)
//! <folder>/struck.NNNN    scaler table
//! <folder>/xps.NNNN       gathered positions table
//! ```

use crate::spectral::SpectralReader;
use crate::table::read_table;
use crate::{Error, Result};
use fastmap_core::{
    ConfigSnapshot, EnergyCalibration, EnvironmentEntry, RoiTable, RowSources, ScanGeometry,
    ScanPlan,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MASTER_FILE: &str = "Master.dat";
pub const ENVIRON_FILE: &str = "Environ.dat";
pub const ROIS_FILE: &str = "Rois.json";
pub const SCAN_FILE: &str = "Scan.json";

const STARTED_PREFIX: &str = "SCAN started at";

/// ROI table and calibration as stored in `Rois.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoiFile {
    pub rois: RoiTable,
    /// One calibration per sub-detector.
    #[serde(default)]
    pub calibration: Vec<EnergyCalibration>,
}

/// File names of one row, relative to the folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFiles {
    pub spectral: String,
    pub scaler: String,
    pub gather: String,
}

/// One completed row as listed in `Master.dat`.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterRow {
    /// Slow-axis position.
    pub ordinate: f64,
    pub spectral_file: String,
    pub scaler_file: String,
    pub gather_file: String,
    /// Seconds since the scan started.
    pub elapsed: f64,
}

/// Parsed `Master.dat`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MasterIndex {
    /// Header lines, `#` stripped.
    pub header: Vec<String>,
    pub start_time: Option<String>,
    pub rows: Vec<MasterRow>,
}

/// A raw scan folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFolder {
    root: PathBuf,
}

impl ScanFolder {
    /// Refers to an existing or future folder without touching the disk.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Creates the folder (and parents) if needed.
    ///
    /// # Errors
    /// I/O errors.
    pub fn create<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let folder = Self::new(root);
        fs::create_dir_all(&folder.root)?;
        Ok(folder)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// File names for 0-based row `row`.
    #[must_use]
    pub fn row_files(&self, row: usize) -> RowFiles {
        let n = row + 1;
        RowFiles {
            spectral: format!("xmap.{n:04}"),
            scaler: format!("struck.{n:04}"),
            gather: format!("xps.{n:04}"),
        }
    }

    /// Writes `Scan.json`.
    ///
    /// # Errors
    /// I/O and JSON errors.
    pub fn write_scan(&self, geometry: &ScanGeometry) -> Result<()> {
        fs::write(self.file(SCAN_FILE), serde_json::to_string_pretty(geometry)?)?;
        Ok(())
    }

    /// Reads `Scan.json`.
    ///
    /// # Errors
    /// I/O and JSON errors.
    pub fn read_scan(&self) -> Result<ScanGeometry> {
        let text = fs::read_to_string(self.file(SCAN_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes `Rois.json`.
    ///
    /// # Errors
    /// I/O and JSON errors.
    pub fn write_rois(&self, rois: &RoiFile) -> Result<()> {
        fs::write(self.file(ROIS_FILE), serde_json::to_string_pretty(rois)?)?;
        Ok(())
    }

    /// Reads `Rois.json`.
    ///
    /// # Errors
    /// I/O and JSON errors.
    pub fn read_rois(&self) -> Result<RoiFile> {
        let text = fs::read_to_string(self.file(ROIS_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes `Environ.dat`.
    ///
    /// # Errors
    /// I/O errors.
    pub fn write_environment(&self, entries: &[EnvironmentEntry]) -> Result<()> {
        let mut out = String::new();
        for e in entries {
            let _ = writeln!(out, "; {} ({}) = {}", e.title, e.address, e.value);
        }
        fs::write(self.file(ENVIRON_FILE), out)?;
        Ok(())
    }

    /// Reads `Environ.dat`; a missing file is an empty environment.
    ///
    /// # Errors
    /// I/O errors and [`Error::Format`] for lines without `=`.
    pub fn read_environment(&self) -> Result<Vec<EnvironmentEntry>> {
        let path = self.file(ENVIRON_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .enumerate()
            .map(|(i, line)| {
                parse_environ_line(line)
                    .ok_or_else(|| Error::format(&path, format!("entry {}: {line:?}", i + 1)))
            })
            .collect()
    }

    /// Starts `Master.dat` with the scan header.
    ///
    /// # Errors
    /// I/O errors.
    pub fn write_master_header(
        &self,
        geometry: &ScanGeometry,
        plan: &ScanPlan,
        started: &str,
    ) -> Result<()> {
        let mut out = String::new();
        let _ = writeln!(out, "#{STARTED_PREFIX} {started}");
        let _ = writeln!(out, "#SCAN file name = {}", geometry.filename);
        let _ = writeln!(out, "#SCAN dimension = {}", geometry.dimension());
        let _ = writeln!(out, "#SCAN nrows (expected) = {}", plan.rows());
        let _ = writeln!(out, "#SCAN time per row (expected) = {:.2}", geometry.scan_time);
        let _ = writeln!(
            out,
            "#X positioner = {} : {:.4} {:.4} {:.4}",
            geometry.fast.positioner, plan.fast.start, plan.fast.stop, plan.fast.step
        );
        if let (Some(axis), Some(range)) = (&geometry.slow, &plan.slow) {
            let _ = writeln!(out, "#Y positioner = {}", axis.positioner);
            let _ = writeln!(
                out,
                "#Y start, stop, step = {:.4} {:.4} {:.4}",
                range.start, range.stop, range.step
            );
        }
        let _ = writeln!(out, "#------------------------------------");
        let _ = writeln!(out, "# yposition  xmap_file  struck_file  xps_file    time");
        fs::write(self.file(MASTER_FILE), out)?;
        Ok(())
    }

    /// Appends one completed row to `Master.dat`.
    ///
    /// # Errors
    /// I/O errors.
    pub fn append_master_row(&self, row: &MasterRow) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.file(MASTER_FILE))?;
        writeln!(
            file,
            "{:.4} {} {} {} {:9.2}",
            row.ordinate, row.spectral_file, row.scaler_file, row.gather_file, row.elapsed
        )?;
        Ok(())
    }

    /// Reads `Master.dat`.
    ///
    /// # Errors
    /// I/O errors and [`Error::Format`] for malformed row lines.
    pub fn read_master(&self) -> Result<MasterIndex> {
        let path = self.file(MASTER_FILE);
        let text = fs::read_to_string(&path)?;
        let mut index = MasterIndex::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                if let Some(time) = rest.strip_prefix(STARTED_PREFIX) {
                    index.start_time = Some(time.trim().to_string());
                }
                index.header.push(rest.to_string());
                continue;
            }
            let row = parse_master_row(line)
                .ok_or_else(|| Error::format(&path, format!("line {}: {line:?}", lineno + 1)))?;
            index.rows.push(row);
        }
        Ok(index)
    }

    /// Reads the three source files of `row`, the spectral file in
    /// parallel with the two tables.
    ///
    /// # Errors
    /// Errors from [`SpectralReader::read`] and the table readers.
    pub fn read_row(&self, row: &MasterRow, spectral: &SpectralReader) -> Result<RowSources> {
        let (spectral, tables) = rayon::join(
            || spectral.read(self.file(&row.spectral_file)),
            || -> Result<_> {
                let scaler = read_table(self.file(&row.scaler_file))?;
                let gather = read_table(self.file(&row.gather_file))?;
                Ok((scaler, gather))
            },
        );
        let spectral = spectral?;
        let (scaler, gather) = tables?;
        debug!(
            file = %row.spectral_file,
            spectral = spectral.pixels(),
            scaler = scaler.rows(),
            gather = gather.rows(),
            "read row sources"
        );
        Ok(RowSources {
            ordinate: row.ordinate,
            spectral,
            scaler,
            gather,
        })
    }

    /// Builds the configuration snapshot from `Scan.json`, `Rois.json` and
    /// `Environ.dat`.
    ///
    /// # Errors
    /// I/O, JSON and format errors.
    pub fn snapshot(&self) -> Result<ConfigSnapshot> {
        let rois = self.read_rois()?;
        Ok(ConfigSnapshot {
            geometry: self.read_scan()?,
            rois: rois.rois,
            calibration: rois.calibration,
            environment: self.read_environment()?,
            folder: self.root.display().to_string(),
        })
    }
}

fn parse_master_row(line: &str) -> Option<MasterRow> {
    let mut fields = line.split_whitespace();
    let ordinate = fields.next()?.parse().ok()?;
    let spectral_file = fields.next()?.to_string();
    let scaler_file = fields.next()?.to_string();
    let gather_file = fields.next()?.to_string();
    let elapsed = fields.next().map_or(Some(0.0), |f| f.parse().ok())?;
    Some(MasterRow {
        ordinate,
        spectral_file,
        scaler_file,
        gather_file,
        elapsed,
    })
}

fn parse_environ_line(line: &str) -> Option<EnvironmentEntry> {
    let body = line.strip_prefix(';').unwrap_or(line).trim();
    let (label, value) = body.split_once(" = ").or_else(|| body.split_once('='))?;
    let label = label.trim();
    let (title, address) = match label.rfind('(') {
        Some(open) if label.ends_with(')') => (
            label[..open].trim(),
            &label[open + 1..label.len() - 1],
        ),
        _ => (label, ""),
    };
    Some(EnvironmentEntry {
        title: title.to_string(),
        address: address.to_string(),
        value: value.trim().to_string(),
    })
}
