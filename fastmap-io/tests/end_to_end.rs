//! Folder conversion and map store scenarios.

use approx::assert_relative_eq;
use fastmap_core::{
    AcquiredRow, AcquisitionConfig, AxisSpec, ConfigSnapshot, DetectorLayout, EnergyCalibration,
    GrowthPolicy, MappingMode, RetryPolicy, RoiDefinition, RoiTable, ScanGeometry, SpectralData,
    Table,
};
use fastmap_io::{
    rows_pending, write_table, Converter, Error, MapStore, MasterRow, Owner, RoiFile, ScanFolder,
    StoreOptions,
};
use fastmap_xmap::BufferEncoder;
use ndarray::{array, Array1, Array2, Array3, Ix3};
use std::path::Path;
use std::time::Duration;

/// One pixel as written by the detector: spectrum, input and output counts.
type Pixel = ([u32; 4], u32, u32);

fn geometry() -> ScanGeometry {
    ScanGeometry {
        filename: "map.h5".into(),
        fast: AxisSpec {
            positioner: "fine x".into(),
            start: 0.5,
            stop: 2.5,
            step: 1.0,
        },
        slow: Some(AxisSpec {
            positioner: "fine y".into(),
            start: 0.0,
            stop: 0.1,
            step: 0.1,
        }),
        scan_time: 1.0,
        fast_column: 0,
    }
}

fn rois() -> RoiTable {
    RoiTable::new(vec![
        RoiDefinition::uniform("A", 0, 2, 1),
        RoiDefinition::uniform("B", 2, 4, 1),
    ])
}

fn start_folder(root: &Path) -> ScanFolder {
    let folder = ScanFolder::create(root).unwrap();
    let geometry = geometry();
    folder.write_scan(&geometry).unwrap();
    folder
        .write_rois(&RoiFile {
            rois: rois(),
            calibration: vec![EnergyCalibration::new(1.0, 0.5, 0.0)],
        })
        .unwrap();
    folder
        .write_master_header(&geometry, &geometry.plan().unwrap(), "2026-10-17 10:00:00")
        .unwrap();
    folder
}

/// Writes the three row files and the master line. The spectral file gets
/// one leading pixel that the reconciler discards.
fn write_raw_row(folder: &ScanFolder, index: usize, pixels: &[Pixel], scaler: &[f64], gather: &[f64]) {
    let files = folder.row_files(index);
    let mut data = SpectralData::zeros(MappingMode::FullSpectrum, pixels.len() + 1, 1, 4);
    data.counts[[0, 0, 0]] = 999;
    data.input_counts[[0, 0]] = 1000;
    data.output_counts[[0, 0]] = 1;
    for (p, (spectrum, icr, ocr)) in pixels.iter().enumerate() {
        for (c, &v) in spectrum.iter().enumerate() {
            data.counts[[p + 1, 0, c]] = v;
        }
        data.input_counts[[p + 1, 0]] = *icr;
        data.output_counts[[p + 1, 0]] = *ocr;
        data.real_time[[p + 1, 0]] = 0.1;
        data.live_time[[p + 1, 0]] = 0.08;
    }
    std::fs::write(
        folder.file(&files.spectral),
        BufferEncoder::new().encode(&data).unwrap(),
    )
    .unwrap();

    let scaler = Table {
        header: vec!["I0".into()],
        values: Array2::from_shape_vec((scaler.len(), 1), scaler.to_vec()).unwrap(),
    };
    write_table(folder.file(&files.scaler), &scaler).unwrap();
    let gather = Table {
        header: vec!["fine x".into()],
        values: Array2::from_shape_vec((gather.len(), 1), gather.to_vec()).unwrap(),
    };
    write_table(folder.file(&files.gather), &gather).unwrap();

    folder
        .append_master_row(&MasterRow {
            ordinate: 0.1 * index as f64,
            spectral_file: files.spectral,
            scaler_file: files.scaler,
            gather_file: files.gather,
            elapsed: 1.5 * (index + 1) as f64,
        })
        .unwrap();
}

fn write_row_0(folder: &ScanFolder) {
    write_raw_row(
        folder,
        0,
        &[([1, 2, 3, 4], 10, 5), ([0, 1, 0, 1], 4, 4), ([5, 5, 0, 0], 30, 10)],
        &[10.0, 20.0, 30.0],
        &[0.0, 1.0, 2.0, 3.0],
    );
}

/// Second row travels backwards: its pixels are listed in acquisition
/// order and end up reversed in the store.
fn write_row_1(folder: &ScanFolder) {
    write_raw_row(
        folder,
        1,
        &[([2, 0, 0, 0], 1, 1), ([0, 0, 3, 3], 8, 4), ([1, 1, 1, 1], 9, 3)],
        &[7.0, 8.0, 9.0],
        &[3.0, 2.0, 1.0, 0.0],
    );
}

fn options(owner: &str) -> StoreOptions {
    StoreOptions::default()
        .with_owner(Owner::new(owner, 1))
        .with_growth(GrowthPolicy {
            initial_rows: 1,
            growth_factor: 2,
        })
}

#[test]
fn test_two_row_scan_produces_literal_maps() {
    let dir = tempfile::tempdir().unwrap();
    let folder = start_folder(&dir.path().join("raw"));
    write_row_0(&folder);
    write_row_1(&folder);
    let store_path = dir.path().join("map.h5");

    let report = Converter::new(AcquisitionConfig::default())
        .with_store_options(options("converter"))
        .convert(&folder, &store_path)
        .unwrap();
    assert_eq!(report.appended, 2);
    assert_eq!(report.rows, 2);
    assert_eq!(report.stopped, None);

    let store = MapStore::open_read_only(&store_path).unwrap();
    assert_eq!(store.rows(), 2);
    assert_eq!(
        store.roi_map("A", None, false).unwrap(),
        array![[3.0, 1.0, 10.0], [2.0, 0.0, 2.0]]
    );
    assert_eq!(
        store.roi_map("A", None, true).unwrap(),
        array![[6.0, 1.0, 30.0], [6.0, 0.0, 2.0]]
    );
    assert_eq!(
        store.roi_map("B", None, false).unwrap(),
        array![[7.0, 1.0, 0.0], [2.0, 6.0, 0.0]]
    );
    assert_eq!(
        store.roi_map("B", Some(0), true).unwrap(),
        array![[14.0, 1.0, 0.0], [6.0, 12.0, 0.0]]
    );
    assert_eq!(
        store.roi_map("I0", None, false).unwrap(),
        array![[10.0, 20.0, 30.0], [9.0, 8.0, 7.0]]
    );
    assert_eq!(store.energy_axis(None).unwrap(), array![1.0, 1.5, 2.0, 2.5]);
    assert_eq!(store.energy_axis(Some(0)).unwrap(), array![1.0, 1.5, 2.0, 2.5]);

    assert_eq!(
        store.spectrum_over_region(0..3, 0..1, Some(0)).unwrap(),
        array![6.0, 8.0, 3.0, 5.0]
    );
    assert_eq!(
        store.spectrum_over_region(0..3, 0..1, None).unwrap(),
        array![17.0, 20.0, 6.0, 9.0]
    );
    assert_eq!(
        store.spectrum_over_region(1..10, 1..10, Some(0)).unwrap(),
        array![2.0, 0.0, 3.0, 3.0]
    );

    assert!(matches!(store.roi_map("Zn", None, false), Err(Error::NotFound(_))));
    assert!(matches!(store.energy_axis(Some(3)), Err(Error::NotFound(_))));

    let summary = store.summary().unwrap();
    assert_eq!(summary.dimension, 2);
    assert_eq!(summary.npts, 3);
    assert_eq!(summary.roi_names, vec!["A", "B"]);
    assert_eq!(summary.owner, None);
    assert!(summary.folder.ends_with("raw"));
    assert!(!summary.stop_time.is_empty());
}

#[test]
fn test_positions_and_trimmed_extent() {
    let dir = tempfile::tempdir().unwrap();
    let folder = start_folder(&dir.path().join("raw"));
    write_row_0(&folder);
    write_row_1(&folder);
    let store_path = dir.path().join("map.h5");
    Converter::new(AcquisitionConfig::default())
        .with_store_options(options("converter"))
        .convert(&folder, &store_path)
        .unwrap();

    let file = hdf5::File::open(&store_path).unwrap();
    let counts = file.dataset("xrfmap/det1/counts").unwrap();
    assert_eq!(counts.shape(), vec![2, 3, 4]);
    let pos = file
        .dataset("xrfmap/roimap/pos")
        .unwrap()
        .read::<f64, Ix3>()
        .unwrap();
    assert_eq!(pos.shape(), &[2, 3, 4]);
    for row in 0..2 {
        for (pix, x) in [0.5, 1.5, 2.5].into_iter().enumerate() {
            assert_relative_eq!(pos[[row, pix, 0]], x);
        }
    }
    assert_relative_eq!(pos[[1, 0, 1]], 0.1);
    assert_relative_eq!(pos[[0, 2, 2]], 0.1, epsilon = 1e-6);
    assert_relative_eq!(pos[[0, 2, 3]], 0.08, epsilon = 1e-6);
}

#[test]
fn test_append_session_resumes_after_incomplete_row() {
    let dir = tempfile::tempdir().unwrap();
    let folder = start_folder(&dir.path().join("raw"));
    write_row_0(&folder);
    write_row_1(&folder);
    let missing = folder.file(&folder.row_files(1).spectral);
    let spectral = std::fs::read(&missing).unwrap();
    std::fs::remove_file(&missing).unwrap();

    let config = AcquisitionConfig {
        spectral_read: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(20))
            .with_max_attempts(2),
        ..AcquisitionConfig::default()
    };
    let converter = Converter::new(config).with_store_options(options("converter"));
    let store_path = dir.path().join("map.h5");

    let first = converter.convert(&folder, &store_path).unwrap();
    assert_eq!(first.appended, 1);
    assert_eq!(first.stopped.as_ref().map(|s| s.0), Some(1));

    std::fs::write(&missing, spectral).unwrap();
    let mut store = MapStore::create_or_open_with(&store_path, options("converter")).unwrap();
    let index = folder.read_master().unwrap();
    assert_eq!(rows_pending(&store, &index), 1..2);
    let second = converter.append(&folder, &mut store).unwrap();
    assert_eq!(second.appended, 1);
    assert_eq!(second.rows, 2);
    assert_eq!(rows_pending(&store, &index), 2..2);
    store.close().unwrap();

    let store = MapStore::open_read_only(&store_path).unwrap();
    assert_eq!(
        store.roi_map("A", None, true).unwrap(),
        array![[6.0, 1.0, 30.0], [6.0, 0.0, 2.0]]
    );
}

fn layout() -> DetectorLayout {
    DetectorLayout {
        npts: 3,
        sub_detectors: 1,
        channels: 4,
        mapping_mode: MappingMode::FullSpectrum,
        scaler_names: vec!["I0".into()],
        rois: rois(),
    }
}

fn snapshot() -> ConfigSnapshot {
    ConfigSnapshot {
        geometry: geometry(),
        rois: rois(),
        calibration: vec![EnergyCalibration::default()],
        environment: Vec::new(),
        folder: "/data/raw".into(),
    }
}

fn synthetic_row(index: usize, npts: usize) -> AcquiredRow {
    let spectra = Array3::from_elem((npts, 1, 4), index as u32 + 1);
    let roi_raw = Array3::from_elem((npts, 2, 1), 2.0 * (index as f64 + 1.0));
    AcquiredRow {
        index,
        ordinate: 0.1 * index as f64,
        fast_positions: Array1::linspace(0.5, 2.5, npts),
        spectra,
        real_time: Array2::from_elem((npts, 1), 0.1),
        live_time: Array2::from_elem((npts, 1), 0.09),
        input_counts: Array2::from_elem((npts, 1), 5),
        output_counts: Array2::from_elem((npts, 1), 5),
        dead_time_factor: Array2::ones((npts, 1)),
        scalers: Array2::from_elem((npts, 1), 100.0),
        roi_corrected: roi_raw.clone(),
        roi_raw,
    }
}

#[test]
fn test_growth_keeps_exactly_the_written_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.h5");
    let opts = options("writer").with_growth(GrowthPolicy {
        initial_rows: 2,
        growth_factor: 2,
    });
    let mut store = MapStore::create_or_open_with(&path, opts).unwrap();
    store
        .initialize_schema(&synthetic_row(0, 3), &layout(), &snapshot())
        .unwrap();
    assert_eq!(store.capacity(), 2);

    let mut capacities = Vec::new();
    for i in 0..5 {
        assert_eq!(store.append_row(&synthetic_row(i, 3)).unwrap(), i + 1);
        capacities.push(store.capacity());
    }
    assert_eq!(capacities, vec![2, 2, 4, 4, 8]);
    assert_eq!(store.roi_map("A", None, false).unwrap().dim(), (5, 3));
    store.close().unwrap();

    let file = hdf5::File::open(&path).unwrap();
    for name in ["det1/counts", "det1/dtfactor", "detsum/counts", "roimap/sum_cor", "roimap/pos"] {
        let shape = file.dataset(&format!("xrfmap/{name}")).unwrap().shape();
        assert_eq!(shape[0], 5, "{name}");
    }
    drop(file);

    let store = MapStore::open_read_only(&path).unwrap();
    assert_eq!(store.rows(), 5);
    let a = store.roi_map("A", None, false).unwrap();
    assert_eq!(a.column(0).to_vec(), vec![2.0, 4.0, 6.0, 8.0, 10.0]);
}

#[test]
fn test_one_row_past_capacity_grows_and_trims() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edge.h5");
    let opts = options("writer").with_growth(GrowthPolicy {
        initial_rows: 3,
        growth_factor: 3,
    });
    let mut store = MapStore::create_or_open_with(&path, opts).unwrap();
    store
        .initialize_schema(&synthetic_row(0, 3), &layout(), &snapshot())
        .unwrap();
    for i in 0..3 {
        store.append_row(&synthetic_row(i, 3)).unwrap();
    }
    assert_eq!(store.capacity(), 3);

    assert_eq!(store.append_row(&synthetic_row(3, 3)).unwrap(), 4);
    assert_eq!(store.capacity(), 9);
    store.close().unwrap();

    let file = hdf5::File::open(&path).unwrap();
    for name in ["det1/counts", "det1/realtime", "detsum/counts", "roimap/det_raw", "roimap/pos"] {
        let shape = file.dataset(&format!("xrfmap/{name}")).unwrap().shape();
        assert_eq!(shape[0], 4, "{name}");
    }
    drop(file);

    let store = MapStore::open_read_only(&path).unwrap();
    assert_eq!(store.rows(), 4);
    let a = store.roi_map("A", None, false).unwrap();
    assert_eq!(a.row(3).to_vec(), vec![8.0, 8.0, 8.0]);
}

#[test]
fn test_schema_is_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schema.h5");
    let mut store = MapStore::create_or_open_with(&path, options("writer")).unwrap();
    assert!(matches!(
        store.append_row(&synthetic_row(0, 3)),
        Err(Error::NotInitialized)
    ));
    store
        .initialize_schema(&synthetic_row(0, 3), &layout(), &snapshot())
        .unwrap();
    assert!(matches!(
        store.initialize_schema(&synthetic_row(0, 3), &layout(), &snapshot()),
        Err(Error::AlreadyInitialized)
    ));
    assert!(matches!(
        store.append_row(&synthetic_row(0, 2)),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(
        store.append_row(&synthetic_row(1, 3)),
        Err(Error::RowOrder { expected: 0, got: 1 })
    ));
    store.append_row(&synthetic_row(0, 3)).unwrap();
    store.close().unwrap();

    let mut reopened = MapStore::create_or_open_with(&path, options("writer")).unwrap();
    assert_eq!(reopened.rows(), 1);
    assert!(matches!(
        reopened.initialize_schema(&synthetic_row(0, 3), &layout(), &snapshot()),
        Err(Error::AlreadyInitialized)
    ));
    reopened.close().unwrap();
}

#[test]
fn test_ownership_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("owned.h5");

    let mut first = MapStore::create_or_open_with(&path, options("host-a")).unwrap();
    let mut second = MapStore::open_unowned(&path, options("host-b")).unwrap();
    assert!(first.claim_ownership().unwrap());
    assert!(!second.claim_ownership().unwrap());
    assert!(first.claim_ownership().unwrap());
    assert!(matches!(
        MapStore::create_or_open_with(&path, options("host-c")),
        Err(Error::OwnershipConflict { .. })
    ));
    assert!(matches!(
        second.initialize_schema(&synthetic_row(0, 3), &layout(), &snapshot()),
        Err(Error::NotOwner { .. })
    ));

    first.close().unwrap();
    let mut third = MapStore::open_unowned(&path, options("host-c")).unwrap();
    assert!(third.claim_ownership().unwrap());
    assert!(!second.claim_ownership().unwrap());
    third.close().unwrap();
    second.close().unwrap();
}

#[test]
fn test_take_over_supersedes_stale_owner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.h5");
    let mut stale = MapStore::create_or_open_with(&path, options("crashed")).unwrap();
    stale
        .initialize_schema(&synthetic_row(0, 3), &layout(), &snapshot())
        .unwrap();

    let mut operator = MapStore::open_unowned(&path, options("operator")).unwrap();
    assert_eq!(operator.take_over().unwrap(), Some(Owner::new("crashed", 1)));
    assert!(matches!(
        stale.append_row(&synthetic_row(0, 3)),
        Err(Error::NotOwner { .. })
    ));
    stale.close().unwrap();
    assert_eq!(operator.owner().unwrap(), Some(Owner::new("operator", 1)));
    operator.close().unwrap();

    let reader = MapStore::open_read_only(&path).unwrap();
    assert_eq!(reader.owner().unwrap(), None);
}
