//! End-to-end scans against the built-in test backend.

use std::thread;
use std::time::Duration;

use scan_capture::encoder::PnmKind;
use scan_capture::mock::{Fault, MockBackend, MockDevice, TestPattern};
use scan_capture::option::{names, OptionValue};
use scan_capture::output::{output_path, part_path};
use scan_capture::validation::{read_pnm, validate_color_bars, validate_gradient};
use scan_capture::{
    acquire, apply_config, scan_to_file, AcquireOptions, FrameFormat, PaperSize, ReadStatus,
    Runtime, ScanConfig, ScanError, SessionState,
};

fn runtime_with(devices: Vec<MockDevice>) -> Runtime<MockBackend> {
    let mut runtime = Runtime::new(MockBackend::with_devices(devices));
    runtime.init(None).expect("init should succeed");
    runtime
}

fn default_runtime() -> Runtime<MockBackend> {
    let mut runtime = Runtime::new(MockBackend::new());
    runtime.init(None).expect("init should succeed");
    runtime
}

fn config(device: &str, mode: &str) -> ScanConfig {
    ScanConfig {
        device: device.to_owned(),
        mode: Some(mode.to_owned()),
        ..ScanConfig::default()
    }
}

#[test]
fn test_flatbed_color_scan_to_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = default_runtime();
    let cfg = config("test:0", "Color");
    let mut session = runtime.open(&cfg.device).expect("open");
    apply_config(&mut session, &cfg).expect("apply config");

    let output = scan_to_file(&mut session, dir.path(), &cfg).expect("scan");
    assert_eq!(
        output.path,
        output_path(dir.path(), "scan", std::process::id())
    );
    assert!(!part_path(&output.path).exists());

    let image = read_pnm(&output.path).expect("read output");
    assert_eq!(image.header.kind, PnmKind::Pixmap);
    assert_eq!((image.header.width, image.header.height), (206, 292));
    validate_color_bars(&image).expect("color bars");
}

#[test]
fn test_handheld_gradient_of_unknown_height() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = runtime_with(vec![
        MockDevice::handheld("test:1").with_pattern(TestPattern::Gradient)
    ]);
    let cfg = config("test:1", "Gray");
    let mut session = runtime.open(&cfg.device).expect("open");
    apply_config(&mut session, &cfg).expect("apply config");
    assert_eq!(session.parameters().expect("params").lines, None);

    let output = scan_to_file(&mut session, dir.path(), &cfg).expect("scan");
    assert!(output.summary.buffered);
    assert_eq!(output.summary.height, 292);

    let image = read_pnm(&output.path).expect("read output");
    assert_eq!(image.header.kind, PnmKind::Graymap);
    assert_eq!(image.header.height, 292);
    validate_gradient(&image).expect("gradient");
}

#[test]
fn test_three_pass_color_is_composed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = default_runtime();
    let cfg = config("test:2", "Color");
    let mut session = runtime.open(&cfg.device).expect("open");
    apply_config(&mut session, &cfg).expect("apply config");
    assert_eq!(
        session.parameters().expect("params").format,
        FrameFormat::Red
    );

    let output = scan_to_file(&mut session, dir.path(), &cfg).expect("scan");
    assert_eq!(output.summary.frames, 3);
    assert_eq!(output.summary.format, FrameFormat::Rgb);

    let image = read_pnm(&output.path).expect("read output");
    assert_eq!(image.header.kind, PnmKind::Pixmap);
    validate_color_bars(&image).expect("color bars");
}

#[test]
fn test_rescan_after_cancel_between_passes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = default_runtime();
    let cfg = config("test:2", "Color");
    let mut session = runtime.open(&cfg.device).expect("open");
    apply_config(&mut session, &cfg).expect("apply config");

    session.start().expect("start red pass");
    let mut buf = vec![0u8; 8192];
    while let ReadStatus::Data(_) = session.read(&mut buf).expect("read") {}
    assert!(session.in_sequence());

    session.cancel();
    assert!(matches!(session.read(&mut buf), Err(ScanError::Cancelled)));

    let output = scan_to_file(&mut session, dir.path(), &cfg).expect("scan");
    assert_eq!(output.summary.frames, 3);
    validate_color_bars(&read_pnm(&output.path).expect("read output")).expect("color bars");
}

#[test]
fn test_lineart_scan_writes_bitmap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = default_runtime();
    let cfg = config("test:0", "Lineart");
    let mut session = runtime.open(&cfg.device).expect("open");
    apply_config(&mut session, &cfg).expect("apply config");

    let output = scan_to_file(&mut session, dir.path(), &cfg).expect("scan");
    let image = read_pnm(&output.path).expect("read output");
    assert_eq!(image.header.kind, PnmKind::Bitmap);
    assert_eq!(image.header.max_value, None);
    validate_color_bars(&image).expect("thresholded bars");
}

#[test]
fn test_sixteen_bit_scan_is_big_endian() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = runtime_with(vec![MockDevice::flatbed("test:0")
        .with_pattern(TestPattern::Solid(0x12))
        .with_chunk_size(4097)]);
    let cfg = config("test:0", "Gray");
    let mut session = runtime.open(&cfg.device).expect("open");
    apply_config(&mut session, &cfg).expect("apply config");
    session
        .set_by_name(names::DEPTH, OptionValue::Int(16))
        .expect("set depth");

    let output = scan_to_file(&mut session, dir.path(), &cfg).expect("scan");
    let image = read_pnm(&output.path).expect("read output");
    assert_eq!(image.header.max_value, Some(65535));
    assert_eq!(&image.data[..4], &[0x12, 0x12, 0x12, 0x12]);
    assert_eq!(image.data.len(), 206 * 292 * 2);
}

#[test]
fn test_paper_preset_and_resolution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = default_runtime();
    let cfg = ScanConfig {
        device: "test:0".to_owned(),
        mode: Some("Color".to_owned()),
        resolution: Some(75),
        paper: Some(PaperSize::A5),
        ..ScanConfig::default()
    };
    let mut session = runtime.open(&cfg.device).expect("open");
    apply_config(&mut session, &cfg).expect("apply config");

    let output = scan_to_file(&mut session, dir.path(), &cfg).expect("scan");
    assert_eq!((output.summary.width, output.summary.height), (437, 620));
    validate_color_bars(&read_pnm(&output.path).expect("read output")).expect("color bars");
}

#[test]
fn test_jam_leaves_part_file_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = runtime_with(vec![
        MockDevice::handheld("test:1").with_read_fault_after(8192, Fault::Jammed)
    ]);
    let cfg = ScanConfig {
        device: "test:1".to_owned(),
        ..ScanConfig::default()
    };
    let mut session = runtime.open(&cfg.device).expect("open");

    let err = scan_to_file(&mut session, dir.path(), &cfg).expect_err("scan should fail");
    assert!(matches!(err, ScanError::Jammed));

    let path = output_path(dir.path(), &cfg.output_base, std::process::id());
    assert!(!path.exists());
    assert!(part_path(&path).exists());
    assert_eq!(session.state(), SessionState::Opened);
}

#[test]
fn test_cancel_from_another_thread() {
    let runtime = runtime_with(vec![MockDevice::flatbed("test:0").with_stall_after(1000)]);
    let mut session = runtime.open("test:0").expect("open");
    session.start().expect("start");

    let canceller = session.canceller();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        canceller.cancel();
    });

    let result = acquire(&mut session, Vec::new(), &AcquireOptions::default());
    worker.join().expect("canceller thread");
    assert!(matches!(result, Err(ScanError::Cancelled)));

    // reported once; the session is idle again
    assert_eq!(session.state(), SessionState::Opened);
    let mut buf = [0u8; 16];
    assert!(matches!(
        session.read(&mut buf),
        Err(ScanError::InvalidState { .. })
    ));
}

#[test]
fn test_non_blocking_stall_returns_zero_bytes() {
    let runtime = runtime_with(vec![MockDevice::flatbed("test:0").with_stall_after(100)]);
    let mut session = runtime.open("test:0").expect("open");
    session.set_io_mode(true).expect("non-blocking");
    session.start().expect("start");

    let mut buf = [0u8; 256];
    assert_eq!(session.read(&mut buf).expect("read"), ReadStatus::Data(100));
    assert_eq!(session.read(&mut buf).expect("read"), ReadStatus::Data(0));

    session.cancel();
    assert!(matches!(session.read(&mut buf), Err(ScanError::Cancelled)));
}

#[test]
fn test_terminate_and_reinitialize() {
    let mut runtime = default_runtime();
    {
        let session = runtime.open("").expect("open");
        session.close();
    }
    runtime.terminate();
    assert!(runtime.open("test:0").is_err());
    runtime.init(None).expect("re-init");
    assert_eq!(runtime.devices(true).expect("devices").len(), 3);
}
