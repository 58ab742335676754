//! Scan-capture binary: acquire one image into `{base}{pid}.pnm`.
//!
//! Usage: `scan-capture [config.json]`. Device names starting with `test:`
//! use the built-in test backend; everything else goes through V4L2.

use std::path::Path;

use scan_capture::mock::MockBackend;
use scan_capture::{apply_config, scan_to_file, Backend, Runtime, ScanConfig, V4l2Backend};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run() {
        error!(error = %err, "Scan failed");
        std::process::exit(1);
    }
}

fn run() -> scan_capture::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ScanConfig::from_json_file(path)?,
        None => ScanConfig::default(),
    };

    if config.device.starts_with("test:") {
        scan(MockBackend::new(), &config)
    } else {
        scan(V4l2Backend::new(), &config)
    }
}

fn scan<B: Backend>(backend: B, config: &ScanConfig) -> scan_capture::Result<()> {
    let mut runtime = Runtime::new(backend);
    let version = runtime.init(None)?;
    info!(%version, "Backend ready");

    for device in runtime.devices(false)? {
        info!(
            name = %device.name,
            vendor = %device.vendor,
            model = %device.model,
            kind = %device.kind,
            "Found device"
        );
    }

    let mut session = runtime.open(&config.device)?;
    apply_config(&mut session, config)?;
    let params = session.parameters()?;
    info!(?params, "Parameters negotiated");

    let output = scan_to_file(&mut session, Path::new("."), config)?;
    println!("{}", output.path.display());
    Ok(())
}
