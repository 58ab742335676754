//! Test pattern verification for written PNM images.
//!
//! Parses the files produced by the encoder and checks that they carry the
//! synthetic patterns of the test backend. Useful for end-to-end tests and
//! for checking a virtual camera's output.

use std::path::Path;

use crate::encoder::{PnmHeader, PnmKind};
use crate::error::{Result, ScanError};
use crate::mock::{luma, COLOR_BARS};

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u8 = 15;

/// Minimum luminance rise across a gradient.
const MIN_GRADIENT_RISE: f32 = 50.0;

/// A decoded PNM image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnmImage {
    /// Parsed header.
    pub header: PnmHeader,
    /// Raster bytes following the header.
    pub data: Vec<u8>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn skip_space_and_comments(&mut self) {
        while let Some(&byte) = self.bytes.get(self.pos) {
            if byte == b'#' {
                while let Some(&c) = self.bytes.get(self.pos) {
                    self.pos += 1;
                    if c == b'\n' {
                        break;
                    }
                }
            } else if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn token(&mut self) -> Result<&'a [u8]> {
        self.skip_space_and_comments();
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| !b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
        self.bytes
            .get(start..self.pos)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ScanError::invalid("truncated PNM header"))
    }

    fn number(&mut self) -> Result<usize> {
        let token = self.token()?;
        std::str::from_utf8(token)
            .ok()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| ScanError::invalid("bad number in PNM header"))
    }
}

/// Parse a binary PNM (`P4`, `P5` or `P6`) image.
pub fn parse_pnm(bytes: &[u8]) -> Result<PnmImage> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let kind = match cursor.token()? {
        b"P4" => PnmKind::Bitmap,
        b"P5" => PnmKind::Graymap,
        b"P6" => PnmKind::Pixmap,
        other => {
            return Err(ScanError::invalid(format!(
                "unknown PNM magic {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };
    let width = cursor.number()?;
    let height = cursor.number()?;
    let max_value = match kind {
        PnmKind::Bitmap => None,
        _ => Some(
            u32::try_from(cursor.number()?)
                .map_err(|_| ScanError::invalid("PNM max value out of range"))?,
        ),
    };
    // exactly one whitespace byte separates header and raster
    let data = bytes
        .get(cursor.pos + 1..)
        .ok_or_else(|| ScanError::invalid("PNM image has no raster"))?
        .to_vec();

    let image = PnmImage {
        header: PnmHeader {
            kind,
            width,
            height,
            max_value,
        },
        data,
    };
    if image.data.len() != image.row_bytes() * height {
        return Err(ScanError::invalid(format!(
            "PNM raster holds {} bytes, header implies {}",
            image.data.len(),
            image.row_bytes() * height
        )));
    }
    Ok(image)
}

/// Read and parse a PNM file.
pub fn read_pnm<P: AsRef<Path>>(path: P) -> Result<PnmImage> {
    parse_pnm(&std::fs::read(path)?)
}

impl PnmImage {
    fn sample_size(&self) -> usize {
        if self.header.max_value.unwrap_or(1) > 255 {
            2
        } else {
            1
        }
    }

    fn channels(&self) -> usize {
        if self.header.kind == PnmKind::Pixmap {
            3
        } else {
            1
        }
    }

    /// Bytes per raster row.
    pub fn row_bytes(&self) -> usize {
        match self.header.kind {
            PnmKind::Bitmap => self.header.width.div_ceil(8),
            _ => self.header.width * self.channels() * self.sample_size(),
        }
    }

    /// Pixel at `(x, y)` as 8-bit RGB; 16-bit samples keep their high byte.
    pub fn pixel_rgb(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= self.header.width || y >= self.header.height {
            return None;
        }
        let row = self
            .data
            .get(y * self.row_bytes()..(y + 1) * self.row_bytes())?;

        if self.header.kind == PnmKind::Bitmap {
            let bit = (row.get(x / 8)? >> (7 - x % 8)) & 1;
            return Some(if bit == 1 { [0; 3] } else { [255; 3] });
        }

        let size = self.sample_size();
        let channels = self.channels();
        // big-endian samples: the first byte is the high byte
        let sample = |c: usize| row.get((x * channels + c) * size).copied();
        if channels == 3 {
            Some([sample(0)?, sample(1)?, sample(2)?])
        } else {
            Some([sample(0)?; 3])
        }
    }

    fn expected(&self, rgb: [u8; 3]) -> [u8; 3] {
        match self.header.kind {
            PnmKind::Pixmap => rgb,
            PnmKind::Graymap => [luma(rgb); 3],
            PnmKind::Bitmap if luma(rgb) < 128 => [0; 3],
            PnmKind::Bitmap => [255; 3],
        }
    }
}

/// Validates that an image contains the color bar pattern.
///
/// Samples the center of each of the eight vertical bars on the middle
/// row. Gray and bitmap images are compared against the luma of each bar.
///
/// # Errors
///
/// Returns `Invalid` if any bar doesn't match within tolerance.
pub fn validate_color_bars(image: &PnmImage) -> Result<()> {
    validate_color_bars_within(image, COLOR_TOLERANCE)
}

/// [`validate_color_bars`] with an explicit per-channel tolerance, for
/// sources that render bars at studio levels.
///
/// # Errors
///
/// Returns `Invalid` if any bar doesn't match within `tolerance`.
pub fn validate_color_bars_within(image: &PnmImage, tolerance: u8) -> Result<()> {
    let width = image.header.width;
    let center_y = image.header.height / 2;
    let bars = COLOR_BARS.len();

    for (bar, rgb) in COLOR_BARS.iter().enumerate() {
        let x = (2 * bar + 1) * width / (2 * bars);
        let actual = image
            .pixel_rgb(x, center_y)
            .ok_or_else(|| ScanError::invalid(format!("no pixel at ({x}, {center_y})")))?;
        let expected = image.expected(*rgb);
        if !colors_match(actual, expected, tolerance) {
            return Err(ScanError::invalid(format!(
                "color bar {bar} mismatch at ({x}, {center_y}): \
                 expected RGB{expected:?}, got RGB{actual:?}"
            )));
        }
    }
    Ok(())
}

/// Validates that an image contains a left-to-right gradient.
///
/// Luminance along the middle row must never drop by more than rounding
/// and must rise significantly overall.
///
/// # Errors
///
/// Returns `Invalid` if the luminance falls or barely changes.
pub fn validate_gradient(image: &PnmImage) -> Result<()> {
    let center_y = image.header.height / 2;
    let mut first: Option<f32> = None;
    let mut prev: Option<f32> = None;

    for x in (0..image.header.width).step_by(10) {
        let [r, g, b] = image
            .pixel_rgb(x, center_y)
            .ok_or_else(|| ScanError::invalid(format!("no pixel at ({x}, {center_y})")))?;
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = prev {
            if luminance < prev - 1.0 {
                return Err(ScanError::invalid(format!(
                    "gradient falls at x={x}: luminance {luminance} < previous {prev}"
                )));
            }
        }
        if first.is_none() {
            first = Some(luminance);
        }
        prev = Some(luminance);
    }

    let rise = prev.zip(first).map_or(0.0, |(last, first)| last - first);
    if rise < MIN_GRADIENT_RISE {
        return Err(ScanError::invalid(format!(
            "insufficient luminance change for gradient: {rise}"
        )));
    }
    Ok(())
}

fn colors_match(actual: [u8; 3], expected: [u8; 3], tolerance: u8) -> bool {
    actual
        .iter()
        .zip(expected)
        .all(|(a, e)| a.abs_diff(e) <= tolerance)
}
