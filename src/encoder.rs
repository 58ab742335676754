//! PNM stream encoder.
//!
//! Picks the header for a frame format and depth and normalizes 16-bit
//! samples from host order to the big-endian order PNM requires.

use std::io::Write;

use crate::error::Result;
use crate::traits::FrameFormat;

/// Whether 16-bit samples must be byte-swapped on this host.
pub const SWAP_16_BIT: bool = cfg!(target_endian = "little");

/// PNM variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnmKind {
    /// `P4`, packed 1-bit bitmap.
    Bitmap,
    /// `P5`, grayscale.
    Graymap,
    /// `P6`, color.
    Pixmap,
}

/// PNM file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnmHeader {
    /// Variant.
    pub kind: PnmKind,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Maximum sample value; absent for bitmaps.
    pub max_value: Option<u32>,
}

impl PnmHeader {
    /// Header for an image of the given layout.
    ///
    /// Single-band frames describe a composed color image.
    pub const fn for_frame(format: FrameFormat, width: usize, height: usize, depth: u32) -> Self {
        let max_value = if depth <= 8 { 255 } else { 65535 };
        let (kind, max_value) = match format {
            FrameFormat::Red | FrameFormat::Green | FrameFormat::Blue | FrameFormat::Rgb => {
                (PnmKind::Pixmap, Some(max_value))
            }
            FrameFormat::Gray if depth == 1 => (PnmKind::Bitmap, None),
            FrameFormat::Gray => (PnmKind::Graymap, Some(max_value)),
        };
        Self {
            kind,
            width,
            height,
            max_value,
        }
    }

    /// Header text.
    pub fn to_bytes(&self) -> Vec<u8> {
        let magic = match self.kind {
            PnmKind::Bitmap => "P4",
            PnmKind::Graymap => "P5",
            PnmKind::Pixmap => "P6",
        };
        let mut text = format!(
            "{magic}\n# SANE data follows\n{} {}\n",
            self.width, self.height
        );
        if let Some(max) = self.max_value {
            text.push_str(&max.to_string());
            text.push('\n');
        }
        text.into_bytes()
    }
}

/// Pairwise byte swapper that carries a dangling odd byte between calls.
#[derive(Debug, Default)]
pub struct ByteSwapper {
    pending: Option<u8>,
}

impl ByteSwapper {
    /// Create a swapper with nothing held over.
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Byte held over from the previous chunk, if any.
    pub const fn pending(&self) -> Option<u8> {
        self.pending
    }

    /// Swap `chunk` pairwise, continuing any pair left open by the previous
    /// call, and append the result to `out`.
    pub fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        let mut rest = chunk;
        if let Some(held) = self.pending {
            let Some((&first, tail)) = rest.split_first() else {
                return;
            };
            out.extend_from_slice(&[first, held]);
            self.pending = None;
            rest = tail;
        }

        let mut pairs = rest.chunks_exact(2);
        for pair in pairs.by_ref() {
            if let [hi, lo] = pair {
                out.extend_from_slice(&[*lo, *hi]);
            }
        }
        self.pending = pairs.remainder().first().copied();
    }

    /// Flush the held-over byte, unpaired.
    pub fn finish(&mut self) -> Option<u8> {
        self.pending.take()
    }
}

/// Swap every byte pair of `data` in place; a trailing odd byte stays put.
pub fn swap_pairs_in_place(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Drops the padding at the end of every device line, across chunk
/// boundaries.
#[derive(Debug)]
pub struct RowPacker {
    stride: usize,
    keep: usize,
    column: usize,
}

impl RowPacker {
    /// Packer for lines of `stride` bytes of which the first `keep` are
    /// pixel data.
    pub const fn new(stride: usize, keep: usize) -> Self {
        Self {
            stride,
            keep,
            column: 0,
        }
    }

    /// Append the pixel bytes of `chunk` to `out`.
    pub fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        if self.stride == 0 {
            out.extend_from_slice(chunk);
            return;
        }
        let mut rest = chunk;
        while !rest.is_empty() {
            let take = (self.stride - self.column).min(rest.len());
            let (part, tail) = rest.split_at(take);
            let wanted = self.keep.saturating_sub(self.column).min(take);
            out.extend_from_slice(part.get(..wanted).unwrap_or_default());
            self.column = (self.column + take) % self.stride;
            rest = tail;
        }
    }
}

/// Keep the first `keep` bytes of every `stride`-byte row of `data`.
pub fn pack_rows(data: Vec<u8>, stride: usize, keep: usize) -> Vec<u8> {
    if stride == 0 || keep >= stride {
        return data;
    }
    data.chunks(stride)
        .flat_map(|row| row.get(..keep).unwrap_or(row))
        .copied()
        .collect()
}

/// Writes a PNM header followed by sample data.
#[derive(Debug)]
pub struct StreamEncoder<W: Write> {
    out: W,
    swapper: Option<ByteSwapper>,
    packer: Option<RowPacker>,
    scratch: Vec<u8>,
    packed: Vec<u8>,
    header_written: bool,
    bytes_written: u64,
}

impl<W: Write> StreamEncoder<W> {
    /// Encoder for samples of `depth` bits, swapping 16-bit samples when
    /// the host is little-endian.
    pub fn new(out: W, depth: u32) -> Self {
        Self::with_swap(out, depth > 8 && SWAP_16_BIT)
    }

    /// Encoder with explicit control over byte swapping.
    pub fn with_swap(out: W, swap: bool) -> Self {
        Self {
            out,
            swapper: swap.then(ByteSwapper::new),
            packer: None,
            scratch: Vec::new(),
            packed: Vec::new(),
            header_written: false,
            bytes_written: 0,
        }
    }

    /// Drop bytes past `keep` in every `stride`-byte line written through
    /// [`StreamEncoder::write_samples`]. A no-op when lines carry no padding.
    pub fn set_row_padding(&mut self, stride: usize, keep: usize) {
        self.packer = (keep < stride).then(|| RowPacker::new(stride, keep));
    }

    /// Whether samples are byte-swapped.
    pub const fn swaps(&self) -> bool {
        self.swapper.is_some()
    }

    /// Whether the header has been emitted.
    pub const fn header_written(&self) -> bool {
        self.header_written
    }

    /// Bytes written so far, header included.
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Emit the header. Must precede all sample data.
    pub fn write_header(&mut self, header: &PnmHeader) -> Result<()> {
        let bytes = header.to_bytes();
        self.out.write_all(&bytes)?;
        self.bytes_written += bytes.len() as u64;
        self.header_written = true;
        Ok(())
    }

    /// Write a chunk of samples as delivered by the device.
    pub fn write_samples(&mut self, chunk: &[u8]) -> Result<()> {
        let samples: &[u8] = match self.packer.as_mut() {
            Some(packer) => {
                self.packed.clear();
                packer.process(chunk, &mut self.packed);
                &self.packed
            }
            None => chunk,
        };
        match self.swapper.as_mut() {
            Some(swapper) => {
                self.scratch.clear();
                swapper.process(samples, &mut self.scratch);
                self.out.write_all(&self.scratch)?;
                self.bytes_written += self.scratch.len() as u64;
            }
            None => {
                self.out.write_all(samples)?;
                self.bytes_written += samples.len() as u64;
            }
        }
        Ok(())
    }

    /// Write a complete, already normalized image body.
    pub fn write_image(&mut self, data: &[u8]) -> Result<()> {
        self.out.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Emit any held-over byte, flush and return the writer.
    pub fn finish(mut self) -> Result<W> {
        if let Some(byte) = self.swapper.as_mut().and_then(ByteSwapper::finish) {
            self.out.write_all(&[byte])?;
            self.bytes_written += 1;
        }
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swap_chunks(chunks: &[&[u8]]) -> Vec<u8> {
        let mut swapper = ByteSwapper::new();
        let mut out = Vec::new();
        for chunk in chunks {
            swapper.process(chunk, &mut out);
        }
        out.extend(swapper.finish());
        out
    }

    fn reference_swap(data: &[u8]) -> Vec<u8> {
        let mut expected = data.to_vec();
        swap_pairs_in_place(&mut expected);
        expected
    }

    #[test]
    fn test_header_selection() {
        let header = PnmHeader::for_frame(FrameFormat::Rgb, 4, 2, 8);
        assert_eq!(header.to_bytes(), b"P6\n# SANE data follows\n4 2\n255\n");

        let header = PnmHeader::for_frame(FrameFormat::Green, 4, 2, 16);
        assert_eq!(header.kind, PnmKind::Pixmap);
        assert_eq!(header.max_value, Some(65535));

        let header = PnmHeader::for_frame(FrameFormat::Gray, 9, 3, 1);
        assert_eq!(header.to_bytes(), b"P4\n# SANE data follows\n9 3\n");

        let header = PnmHeader::for_frame(FrameFormat::Gray, 5, 5, 8);
        assert_eq!(header.to_bytes(), b"P5\n# SANE data follows\n5 5\n255\n");

        let header = PnmHeader::for_frame(FrameFormat::Gray, 5, 5, 16);
        assert_eq!(header.to_bytes(), b"P5\n# SANE data follows\n5 5\n65535\n");
    }

    #[test]
    fn test_odd_byte_carried_across_chunks() {
        // samples 0x0102 0x0304 0x0506 0x0708 split as 3, 1, 4 bytes
        let out = swap_chunks(&[&[0x01, 0x02, 0x03], &[0x04], &[0x05, 0x06, 0x07, 0x08]]);
        assert_eq!(out, [0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07]);
    }

    #[test]
    fn test_held_byte_pairs_with_next_chunk() {
        let mut swapper = ByteSwapper::new();
        let mut out = Vec::new();
        swapper.process(&[0x01, 0x02, 0x03, 0x04, 0x05], &mut out);
        assert_eq!(out, [0x02, 0x01, 0x04, 0x03]);
        assert_eq!(swapper.pending(), Some(0x05));

        swapper.process(&[], &mut out);
        assert_eq!(swapper.pending(), Some(0x05));

        swapper.process(&[0x06, 0x07, 0x08, 0x09, 0x0a], &mut out);
        assert_eq!(
            out,
            [0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07, 0x0a, 0x09]
        );
        assert_eq!(swapper.pending(), None);
    }

    #[test]
    fn test_dangling_byte_emitted_at_end() {
        let out = swap_chunks(&[&[0x01, 0x02], &[0x03]]);
        assert_eq!(out, [0x02, 0x01, 0x03]);
    }

    #[test]
    fn test_swap_independent_of_chunking() {
        // every split of 1..=n bytes into chunks, n up to 11
        for len in 0..=11usize {
            #[allow(clippy::cast_possible_truncation)]
            let data: Vec<u8> = (1..=len as u8).collect();
            let expected = reference_swap(&data);
            let cuts = len.saturating_sub(1);
            for mask in 0..(1u32 << cuts) {
                let mut chunks: Vec<&[u8]> = Vec::new();
                let mut start = 0;
                for cut in 0..cuts {
                    if mask & (1 << cut) != 0 {
                        chunks.push(&data[start..=cut]);
                        start = cut + 1;
                    }
                }
                chunks.push(&data[start..]);
                assert_eq!(
                    swap_chunks(&chunks),
                    expected,
                    "len {len} split mask {mask:b}"
                );
            }
        }
    }

    #[test]
    fn test_swap_with_empty_chunks_interleaved() {
        let data = [1u8, 2, 3, 4, 5, 6, 7];
        let out = swap_chunks(&[&[], &data[..1], &[], &data[1..4], &[], &data[4..], &[]]);
        assert_eq!(out, reference_swap(&data));
        assert_eq!(out.len(), data.len());
    }

    #[test]
    fn test_row_padding_dropped_across_chunks() {
        // three rows of 4 bytes, the last byte of each is padding
        let data = [1u8, 2, 3, 0, 4, 5, 6, 0, 7, 8, 9, 0];
        for split in 0..=data.len() {
            let mut packer = RowPacker::new(4, 3);
            let mut out = Vec::new();
            let (head, tail) = data.split_at(split);
            packer.process(head, &mut out);
            packer.process(tail, &mut out);
            assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9], "split at {split}");
        }
        assert_eq!(pack_rows(data.to_vec(), 4, 3), [1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(pack_rows(data.to_vec(), 4, 4), data);
    }

    #[test]
    fn test_encoder_packs_then_swaps() {
        // 16-bit rows of one sample plus two padding bytes
        let mut encoder = StreamEncoder::with_swap(Vec::new(), true);
        encoder.set_row_padding(4, 2);
        encoder.write_samples(&[0x01, 0x02, 0xee]).expect("samples");
        encoder.write_samples(&[0xee, 0x03]).expect("samples");
        encoder.write_samples(&[0x04, 0xee, 0xee]).expect("samples");
        let out = encoder.finish().expect("finish");
        assert_eq!(out, [0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn test_encoder_counts_bytes() {
        let mut encoder = StreamEncoder::with_swap(Vec::new(), false);
        let header = PnmHeader::for_frame(FrameFormat::Gray, 2, 1, 8);
        encoder.write_header(&header).expect("header");
        encoder.write_samples(&[9, 8]).expect("samples");
        assert_eq!(encoder.bytes_written(), header.to_bytes().len() as u64 + 2);
        let out = encoder.finish().expect("finish");
        assert!(out.ends_with(&[9, 8]));
    }

    #[test]
    fn test_encoder_swaps_and_flushes_carry() {
        let mut encoder = StreamEncoder::with_swap(Vec::new(), true);
        assert!(encoder.swaps());
        encoder.write_samples(&[1, 2, 3]).expect("samples");
        encoder.write_samples(&[4, 5]).expect("samples");
        let out = encoder.finish().expect("finish");
        assert_eq!(out, [2, 1, 4, 3, 5]);
    }

    #[test]
    fn test_eight_bit_never_swaps() {
        let encoder = StreamEncoder::new(Vec::new(), 8);
        assert!(!encoder.swaps());
        let encoder = StreamEncoder::new(Vec::new(), 16);
        assert_eq!(encoder.swaps(), SWAP_16_BIT);
    }
}
