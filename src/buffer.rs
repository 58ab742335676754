//! Growable frame buffer for images that cannot be streamed directly.
//!
//! Used when the final height is unknown up front or when an image is
//! composed from separate red, green and blue frames.

use tracing::{debug, trace};

use crate::error::{Result, ScanError};

/// Default ceiling on buffered image size.
pub const DEFAULT_MAX_BYTES: usize = 512 * 1024 * 1024;

/// Byte buffer holding one logical image, row-major.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    row_bytes: usize,
    high_water: usize,
    max_bytes: usize,
}

impl FrameBuffer {
    /// Allocate room for `height_hint` rows of `row_bytes` each.
    ///
    /// The hint only sizes the initial allocation; writes past it grow
    /// the buffer.
    pub fn allocate(row_bytes: usize, height_hint: usize, max_bytes: usize) -> Result<Self> {
        if row_bytes == 0 {
            return Err(ScanError::invalid("frame buffer row width is zero"));
        }
        let initial = row_bytes
            .checked_mul(height_hint.max(1))
            .filter(|len| *len <= max_bytes)
            .unwrap_or(row_bytes);
        let mut data = Vec::new();
        data.try_reserve_exact(initial).map_err(|_| ScanError::NoMem)?;
        trace!(row_bytes, height_hint, initial, "Frame buffer allocated");
        Ok(Self {
            data,
            row_bytes,
            high_water: 0,
            max_bytes,
        })
    }

    /// Bytes per buffered row.
    pub const fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    /// One past the highest byte offset written so far.
    pub const fn high_water(&self) -> usize {
        self.high_water
    }

    /// Rows touched so far, counting a partial last row.
    pub const fn rows(&self) -> usize {
        self.high_water.div_ceil(self.row_bytes)
    }

    fn ensure_len(&mut self, len: usize) -> Result<()> {
        if len > self.max_bytes {
            return Err(ScanError::NoMem);
        }
        if len > self.data.len() {
            if len > self.data.capacity() {
                let target = len.max(self.data.capacity().saturating_mul(2)).min(self.max_bytes);
                self.data
                    .try_reserve_exact(target - self.data.len())
                    .map_err(|_| ScanError::NoMem)?;
            }
            self.data.resize(len, 0);
        }
        Ok(())
    }

    /// Copy `bytes` to `offset`, growing the buffer as needed.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset.checked_add(bytes.len()).ok_or(ScanError::NoMem)?;
        self.ensure_len(end)?;
        self.data
            .get_mut(offset..end)
            .ok_or(ScanError::NoMem)?
            .copy_from_slice(bytes);
        self.high_water = self.high_water.max(end);
        Ok(())
    }

    /// Scatter band data into interleaved position.
    ///
    /// `bytes` continue a band stream at byte index `start`; every sample of
    /// `sample_size` bytes lands at sample slot `index * bands + band`, so
    /// reading the buffer row-major yields interleaved pixels.
    pub fn write_band(
        &mut self,
        start: usize,
        bytes: &[u8],
        band: usize,
        bands: usize,
        sample_size: usize,
    ) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if band >= bands || sample_size == 0 {
            return Err(ScanError::invalid(format!(
                "band {band} of {bands} with sample size {sample_size}"
            )));
        }

        let band_offset = |i: usize| {
            let pos = start + i;
            ((pos / sample_size) * bands + band) * sample_size + pos % sample_size
        };
        let last = band_offset(bytes.len() - 1);
        self.ensure_len(last + 1)?;

        for (i, byte) in bytes.iter().enumerate() {
            if let Some(slot) = self.data.get_mut(band_offset(i)) {
                *slot = *byte;
            }
        }
        self.high_water = self.high_water.max(last + 1);
        Ok(())
    }

    /// Fix the height and hand out exactly `height` rows.
    ///
    /// Missing bytes are zero rows; nothing written is dropped, so `height`
    /// smaller than [`FrameBuffer::rows`] is rejected.
    pub fn finalize(mut self, height: usize) -> Result<Vec<u8>> {
        if height < self.rows() {
            return Err(ScanError::invalid(format!(
                "height {height} would truncate {} buffered rows",
                self.rows()
            )));
        }
        let len = height.checked_mul(self.row_bytes).ok_or(ScanError::NoMem)?;
        self.ensure_len(len)?;
        self.data.truncate(len);
        Ok(self.data)
    }

    /// Drop the buffered data.
    pub fn release(self) {
        debug!(bytes = self.high_water, "Buffered image discarded");
    }
}
