//! Writing scans to disk and applying presets before a scan.
//!
//! Images land in `{base}{pid}.pnm`. Data is written to a `.part` sibling
//! first and renamed only once the image is complete, so a file with the
//! final name is never partial.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::acquire::{acquire, cancel_and_confirm, ScanSummary};
use crate::config::{PaperSize, ScanConfig};
use crate::error::{Result, ScanError};
use crate::option::{names, Fixed, Info, OptionValue, ValueType};
use crate::session::Session;
use crate::traits::DeviceHandle;

/// Suffix of an image still being written.
pub const PART_SUFFIX: &str = ".part";

/// A completed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutput {
    /// Final file path.
    pub path: PathBuf,
    /// What was written.
    pub summary: ScanSummary,
}

/// Final path for an image: `{dir}/{base}{pid}.pnm`.
pub fn output_path(dir: &Path, base: &str, pid: u32) -> PathBuf {
    dir.join(format!("{base}{pid}.pnm"))
}

/// Path of the in-progress file for `path`.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn numeric_value(value_type: ValueType, value: i32) -> OptionValue {
    match value_type {
        ValueType::Fixed => OptionValue::Fixed(Fixed::from_int(value)),
        _ => OptionValue::Int(value),
    }
}

fn set_numeric<H: DeviceHandle>(
    session: &mut Session<'_, H>,
    name: &str,
    value: i32,
) -> Result<Option<Info>> {
    let Some((_, desc)) = session.find_option(name)? else {
        return Ok(None);
    };
    let outcome = session.set_by_name(name, numeric_value(desc.value_type, value))?;
    Ok(outcome.map(|o| o.info))
}

/// Set the bottom-right corner of the scan area to a paper preset.
pub fn apply_paper<H: DeviceHandle>(
    session: &mut Session<'_, H>,
    paper: PaperSize,
) -> Result<Info> {
    let (width, height) = paper.dimensions_mm();
    let mut info = Info::NONE;
    for (name, mm) in [(names::BR_X, width), (names::BR_Y, height)] {
        match set_numeric(session, name, mm)? {
            Some(bits) => info |= bits,
            None => {
                warn!(option = name, %paper, "Device has no scan area option");
                return Err(ScanError::Unsupported);
            }
        }
    }
    debug!(%paper, width, height, "Paper size applied");
    Ok(info)
}

fn set_string<H: DeviceHandle>(
    session: &mut Session<'_, H>,
    name: &str,
    value: &str,
) -> Result<Info> {
    match session.set_by_name(name, OptionValue::String(value.to_owned()))? {
        Some(outcome) => Ok(outcome.info),
        None => {
            warn!(option = name, value, "Option unavailable; leaving device default");
            Ok(Info::NONE)
        }
    }
}

/// Apply the option presets of `config` to an idle session.
///
/// Mode goes first since it can change which other options exist. The
/// descriptors are re-read whenever a set asks for it.
pub fn apply_config<H: DeviceHandle>(
    session: &mut Session<'_, H>,
    config: &ScanConfig,
) -> Result<Info> {
    let mut info = Info::NONE;

    if let Some(mode) = &config.mode {
        info |= set_string(session, names::MODE, mode)?;
        refresh(session)?;
    }
    if let Some(source) = &config.source {
        info |= set_string(session, names::SOURCE, source)?;
        refresh(session)?;
    }
    if let Some(dpi) = config.resolution {
        match set_numeric(session, names::RESOLUTION, dpi)? {
            Some(bits) => info |= bits,
            None => warn!(dpi, "Device has no resolution option"),
        }
        refresh(session)?;
    }
    if let Some(paper) = config.paper {
        info |= apply_paper(session, paper)?;
    }
    if config.non_blocking {
        session.set_io_mode(true)?;
    }
    Ok(info)
}

fn refresh<H: DeviceHandle>(session: &mut Session<'_, H>) -> Result<()> {
    if session.needs_reload() {
        let count = session.descriptors()?.len();
        debug!(count, "Option descriptors reloaded");
    }
    Ok(())
}

/// Acquire one image from `session` into `{dir}/{base}{pid}.pnm`.
///
/// The image is written to `{path}.part`, synced, and renamed into place.
/// On failure the acquisition is cancelled and the `.part` file is left
/// in place; the final name is only created by a successful rename.
///
/// # Arguments
///
/// * `session` - Idle session, already configured
/// * `dir` - Directory receiving the image
/// * `config` - Supplies the file name prefix and acquisition tuning
///
/// # Returns
///
/// * `Ok(ScanOutput)` with the final path and what was written
///
/// # Errors
///
/// Returns `AccessDenied` if the output file cannot be created, `Output`
/// for write, sync and rename failures, and any session or device error
/// from the acquisition unchanged.
pub fn scan_to_file<H: DeviceHandle>(
    session: &mut Session<'_, H>,
    dir: &Path,
    config: &ScanConfig,
) -> Result<ScanOutput> {
    let path = output_path(dir, &config.output_base, std::process::id());
    let part = part_path(&path);

    session.start()?;

    let file = match File::create(&part) {
        Ok(file) => file,
        Err(err) => {
            error!(path = %part.display(), error = %err, "Cannot create output file");
            cancel_and_confirm(session);
            return Err(ScanError::AccessDenied);
        }
    };

    let (summary, writer) = acquire(session, BufWriter::new(file), &config.acquire_options())?;
    let file = writer
        .into_inner()
        .map_err(|err| ScanError::Output(err.into_error()))?;
    file.sync_all()?;
    drop(file);

    fs::rename(&part, &path)?;
    info!(path = %path.display(), width = summary.width, height = summary.height, "Scan written");
    Ok(ScanOutput { path, summary })
}
