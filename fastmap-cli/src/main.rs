//! fastmap command-line interface.
//!
//! Converts raw scan folders into map stores, inspects stores, releases a
//! stale owner, and runs scans against the simulated beamline.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand};
use fastmap_core::{AcquisitionConfig, AxisSpec, ScanGeometry};
use fastmap_io::{Converter, MapStore, ScanFolder, StoreOptions};
use fastmap_scan::sim::{SimBeamline, SimOptions};
use fastmap_scan::{store_path_for, Orchestrator};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Store(#[from] fastmap_io::Error),

    #[error("configuration error: {0}")]
    Core(#[from] fastmap_core::Error),

    #[error("scan error: {0}")]
    Scan(#[from] fastmap_scan::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raster XRF fast-map acquisition and conversion.
#[derive(Parser)]
#[command(name = "fastmap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert (or resume converting) a raw scan folder into a map store
    Convert {
        /// Raw scan folder
        folder: PathBuf,

        /// Store file (default: <folder>.h5)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Acquisition configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show a summary of a map store
    Info {
        /// Store file
        store: PathBuf,
    },

    /// Print a ROI or scaler map as rows of numbers
    RoiMap {
        /// Store file
        store: PathBuf,

        /// ROI or scaler channel name
        name: String,

        /// Single sub-detector (0-based) instead of the sum
        #[arg(short, long)]
        detector: Option<usize>,

        /// Dead-time corrected values
        #[arg(short, long)]
        corrected: bool,

        /// Emit JSON instead of whitespace-separated rows
        #[arg(long)]
        json: bool,
    },

    /// Take over a store left owned by a stopped process and release it
    Release {
        /// Store file
        store: PathBuf,
    },

    /// Run a scan against the simulated beamline
    Simulate {
        /// Directory receiving the raw folder and the store
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Scan name
        #[arg(long, default_value = "sim_map.001")]
        name: String,

        /// Number of rows
        #[arg(long, default_value = "5")]
        rows: usize,

        /// Pixels per row (at least 2)
        #[arg(long, default_value = "20", value_parser = clap::value_parser!(u16).range(2..))]
        npts: u16,

        /// Seconds per row
        #[arg(long, default_value = "0.5")]
        scan_time: f64,

        /// Sub-detectors (up to 4, or a multiple of 4)
        #[arg(long, default_value = "4")]
        detectors: usize,

        /// Spectral channels
        #[arg(long, default_value = "256")]
        channels: usize,

        /// Acquisition configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<AcquisitionConfig> {
    Ok(match path {
        Some(path) => AcquisitionConfig::from_file(path)?,
        None => AcquisitionConfig::default(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Convert {
            folder,
            output,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let output = output.unwrap_or_else(|| store_path_for(&folder));
            let start = Instant::now();
            let report = Converter::new(config).convert(&ScanFolder::new(&folder), &output)?;
            println!("Store: {}", output.display());
            println!("Rows appended: {}", report.appended);
            println!("Rows in store: {}", report.rows);
            if let Some((row, reason)) = &report.stopped {
                println!("Stopped at row {}: {}", row, reason);
            }
            println!("Time: {:.2}s", start.elapsed().as_secs_f64());
        }

        Commands::Info { store } => {
            let store = MapStore::open_read_only(&store)?;
            print!("{}", store.summary()?);
        }

        Commands::RoiMap {
            store,
            name,
            detector,
            corrected,
            json,
        } => {
            let store = MapStore::open_read_only(&store)?;
            let map = store.roi_map(&name, detector, corrected)?;
            if json {
                let rows: Vec<Vec<f64>> = map.rows().into_iter().map(|r| r.to_vec()).collect();
                println!("{}", serde_json::to_string(&rows)?);
            } else {
                for row in map.rows() {
                    let cells: Vec<String> = row.iter().map(|v| format!("{:.6}", v)).collect();
                    println!("{}", cells.join(" "));
                }
            }
        }

        Commands::Release { store } => {
            let mut handle = MapStore::open_unowned(&store, StoreOptions::default())?;
            let previous = handle.take_over()?;
            handle.close()?;
            match previous {
                Some(owner) => println!("Released {} (was owned by {})", store.display(), owner),
                None => println!("{} was not owned", store.display()),
            }
        }

        Commands::Simulate {
            out,
            name,
            rows,
            npts,
            scan_time,
            detectors,
            channels,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let sim = SimBeamline::new(SimOptions {
                sub_detectors: detectors,
                channels,
                ..SimOptions::default()
            });
            let geometry = ScanGeometry {
                filename: name,
                fast: AxisSpec {
                    positioner: "fine x".into(),
                    start: 0.0,
                    stop: 0.01 * f64::from(npts - 1),
                    step: 0.01,
                },
                slow: (rows > 1).then(|| AxisSpec {
                    positioner: "fine y".into(),
                    start: 0.0,
                    stop: 0.01 * (rows - 1) as f64,
                    step: 0.01,
                }),
                scan_time,
                fast_column: 0,
            };
            std::fs::create_dir_all(&out)?;
            let orchestrator = Orchestrator::new(sim.hardware("fine x", "fine y"), config, &out);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let start = Instant::now();
            let report = runtime.block_on(orchestrator.start_scan(geometry))?;
            info!(rows = report.rows, redos = report.redos, "simulated scan finished");
            println!("Folder: {}", report.folder.display());
            println!("Store: {}", report.store.display());
            println!("Rows: {} of {} ({} pixels each)", report.rows, report.planned_rows, report.npts);
            println!("Redos: {}", report.redos);
            println!("Under-runs: {}", report.underruns);
            println!("Time: {:.2}s", start.elapsed().as_secs_f64());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_convert_defaults_store_beside_folder() {
        let cli = Cli::parse_from(["fastmap", "convert", "/data/fe_map_001"]);
        let Commands::Convert { folder, output, .. } = cli.command else {
            panic!("expected convert");
        };
        assert_eq!(output, None);
        assert_eq!(
            store_path_for(&folder),
            PathBuf::from("/data/fe_map_001.h5")
        );
    }

    #[test]
    fn test_simulate_rejects_single_pixel_rows() {
        assert!(Cli::try_parse_from(["fastmap", "simulate", "--npts", "1"]).is_err());
        assert!(Cli::try_parse_from(["fastmap", "simulate", "--npts", "0"]).is_err());
        let cli = Cli::try_parse_from(["fastmap", "simulate", "--npts", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Simulate { npts: 2, .. }));
    }

    #[test]
    fn test_parse_roi_map_arguments() {
        let cli = Cli::parse_from(["fastmap", "roi-map", "map.h5", "Fe Ka", "-d", "2", "--corrected"]);
        match cli.command {
            Commands::RoiMap {
                name,
                detector,
                corrected,
                json,
                ..
            } => {
                assert_eq!(name, "Fe Ka");
                assert_eq!(detector, Some(2));
                assert!(corrected);
                assert!(!json);
            }
            _ => panic!("expected roi-map"),
        }
    }
}
