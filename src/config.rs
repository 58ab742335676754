//! Scan configuration, loadable from JSON.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::acquire::{AcquireOptions, DEFAULT_READ_BUFFER};
use crate::buffer::DEFAULT_MAX_BYTES;
use crate::encoder::SWAP_16_BIT;
use crate::error::{Result, ScanError};

/// ISO paper presets for the scan area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperSize {
    /// 420 x 594 mm.
    A2,
    /// 297 x 420 mm.
    A3,
    /// 210 x 297 mm.
    A4,
    /// 148 x 210 mm.
    A5,
    /// 105 x 144 mm.
    A6,
}

impl PaperSize {
    /// Width and height in millimeters.
    pub const fn dimensions_mm(self) -> (i32, i32) {
        match self {
            Self::A2 => (420, 594),
            Self::A3 => (297, 420),
            Self::A4 => (210, 297),
            Self::A5 => (148, 210),
            Self::A6 => (105, 144),
        }
    }

    /// Parse a preset name such as `"A4"`, case-insensitively.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "A2" => Ok(Self::A2),
            "A3" => Ok(Self::A3),
            "A4" => Ok(Self::A4),
            "A5" => Ok(Self::A5),
            "A6" => Ok(Self::A6),
            _ => Err(ScanError::Unsupported),
        }
    }
}

impl fmt::Display for PaperSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Everything needed to run one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Device name; empty picks the first available device.
    pub device: String,
    /// Output file name prefix.
    #[serde(alias = "outputBase")]
    pub output_base: String,
    /// Maximum bytes per read.
    #[serde(alias = "readBufferSize")]
    pub read_buffer_size: usize,
    /// Use non-blocking reads.
    #[serde(alias = "nonBlocking")]
    pub non_blocking: bool,
    /// Scan mode, e.g. `Color`.
    pub mode: Option<String>,
    /// Resolution in dpi.
    pub resolution: Option<i32>,
    /// Document source, e.g. `Flatbed`.
    pub source: Option<String>,
    /// Paper preset for the scan area.
    pub paper: Option<PaperSize>,
    /// Ceiling on buffered image size.
    #[serde(alias = "maxBufferBytes")]
    pub max_buffer_bytes: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            output_base: "scan".to_owned(),
            read_buffer_size: DEFAULT_READ_BUFFER,
            non_blocking: false,
            mode: None,
            resolution: None,
            source: None,
            paper: None,
            max_buffer_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl ScanConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| ScanError::invalid(format!("bad config: {err}")))
    }

    /// Load a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Acquisition tuning derived from this config.
    pub const fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            read_buffer_size: self.read_buffer_size,
            max_buffer_bytes: self.max_buffer_bytes,
            swap_16_bit: SWAP_16_BIT,
        }
    }
}
