//! Acquisition loop: pulls frames from a session and routes every chunk
//! either straight to the encoder or through a frame buffer.

use std::io::Write;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::buffer::{FrameBuffer, DEFAULT_MAX_BYTES};
use crate::encoder::{pack_rows, swap_pairs_in_place, PnmHeader, StreamEncoder, SWAP_16_BIT};
use crate::error::{Result, ScanError};
use crate::session::{Session, SessionState};
use crate::traits::{DeviceHandle, FrameFormat, Parameters, ReadStatus};

/// Default size of one read request.
pub const DEFAULT_READ_BUFFER: usize = 32 * 1024;

/// Height hint for buffered images of unknown height.
const STRIP_HEIGHT: usize = 256;

/// Wait between empty non-blocking reads.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Tuning for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Maximum bytes requested per read.
    pub read_buffer_size: usize,
    /// Ceiling on the frame buffer.
    pub max_buffer_bytes: usize,
    /// Byte-swap 16-bit samples.
    pub swap_16_bit: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER,
            max_buffer_bytes: DEFAULT_MAX_BYTES,
            swap_16_bit: SWAP_16_BIT,
        }
    }
}

/// What was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    /// Layout of the written image (`Gray` or `Rgb`).
    pub format: FrameFormat,
    /// Width in pixels.
    pub width: usize,
    /// Height in lines.
    pub height: usize,
    /// Bits per sample.
    pub depth: u32,
    /// Device frames consumed.
    pub frames: usize,
    /// Sample bytes received from the device.
    pub bytes_read: u64,
    /// Whether the image went through the frame buffer.
    pub buffered: bool,
}

enum Route {
    Direct,
    Buffered { buffer: FrameBuffer, bands: usize },
}

/// Advisory progress in percent, `None` when the height is unknown.
pub fn progress_percent(total: u64, params: &Parameters) -> Option<f64> {
    let band_factor = if params.format.is_band() { 3 } else { 1 };
    let expected = params
        .lines?
        .checked_mul(params.bytes_per_line)?
        .checked_mul(band_factor)?;
    if expected == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let percent = total as f64 * 100.0 / expected as f64;
    Some(percent.min(100.0))
}

fn check_first_frame(params: &Parameters) -> Result<()> {
    let ok = match params.format {
        FrameFormat::Gray => matches!(params.depth, 1 | 8 | 16),
        FrameFormat::Rgb | FrameFormat::Red | FrameFormat::Green | FrameFormat::Blue => {
            matches!(params.depth, 8 | 16)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(ScanError::invalid(format!(
            "{} frames at depth {} are not supported",
            params.format, params.depth
        )))
    }
}

fn check_next_frame(first: &Parameters, params: &Parameters) -> Result<()> {
    if !params.format.is_band() {
        return Err(ScanError::invalid(format!(
            "follow-up frame has format {}",
            params.format
        )));
    }
    if params.depth != first.depth
        || params.pixels_per_line != first.pixels_per_line
        || params.bytes_per_line != first.bytes_per_line
    {
        return Err(ScanError::invalid(format!(
            "frame geometry changed from {first:?} to {params:?}"
        )));
    }
    Ok(())
}

/// Run the acquisition loop for one logical image.
///
/// The first frame must already be started on `session`. Follow-up frames
/// of a multi-frame image are started here. Single-band frames are composed
/// into one color image and images of unknown height are buffered until the
/// last byte arrives; everything else streams straight to `out`. Row padding
/// beyond the pixel data is dropped. In non-blocking mode empty reads are
/// retried every [`POLL_INTERVAL`].
///
/// # Arguments
///
/// * `session` - Session with its first frame started
/// * `out` - Destination for the PNM header and samples
/// * `options` - Read size, buffer ceiling and byte-swap policy
///
/// # Returns
///
/// * `Ok((summary, out))` with the encoder flushed
///
/// # Errors
///
/// Returns `InvalidState` if no frame is started and `Invalid` for frame
/// layouts that cannot be encoded or composed. Device and output failures
/// are returned unchanged after the acquisition has been cancelled and the
/// cancel confirmed.
pub fn acquire<H: DeviceHandle, W: Write>(
    session: &mut Session<'_, H>,
    out: W,
    options: &AcquireOptions,
) -> Result<(ScanSummary, W)> {
    if !matches!(
        session.state(),
        SessionState::Acquiring | SessionState::Cancelling
    ) {
        return Err(ScanError::InvalidState {
            operation: "acquire",
            state: "idle",
        });
    }

    match run(session, out, options) {
        Ok(result) => Ok(result),
        Err(err) => {
            cancel_and_confirm(session);
            Err(err)
        }
    }
}

/// Cancel whatever is in flight and wait for the confirming read.
pub fn cancel_and_confirm<H: DeviceHandle>(session: &mut Session<'_, H>) {
    session.cancel();
    if session.state() == SessionState::Cancelling {
        let mut scratch = [0u8; 1];
        match session.read(&mut scratch) {
            Err(ScanError::Cancelled) => {}
            other => warn!(result = ?other, "Unexpected read result while cancelling"),
        }
    }
}

fn run<H: DeviceHandle, W: Write>(
    session: &mut Session<'_, H>,
    out: W,
    options: &AcquireOptions,
) -> Result<(ScanSummary, W)> {
    let mut buf = vec![0u8; options.read_buffer_size.max(1)];
    let first = session.parameters()?;
    check_first_frame(&first)?;

    match first.lines {
        Some(lines) => info!(
            width = first.pixels_per_line,
            lines,
            depth = first.depth,
            format = %first.format,
            "Scanning image"
        ),
        None => info!(
            width = first.pixels_per_line,
            depth = first.depth,
            format = %first.format,
            "Scanning image of variable height"
        ),
    }

    let swap = options.swap_16_bit && first.depth > 8;
    let mut encoder = StreamEncoder::with_swap(out, swap);
    let bands = if first.format.is_band() { 3 } else { 1 };
    let row_stride = first.bytes_per_line.checked_mul(bands).ok_or(ScanError::NoMem)?;
    let packed_row = first.min_bytes_per_line().checked_mul(bands).ok_or(ScanError::NoMem)?;
    if packed_row < row_stride {
        debug!(row_stride, packed_row, "Dropping row padding");
    }

    let mut route = if first.format.is_band() || first.lines.is_none() {
        let buffer = FrameBuffer::allocate(
            row_stride,
            first.lines.unwrap_or(STRIP_HEIGHT),
            options.max_buffer_bytes,
        )?;
        debug!(bands, "Buffering image");
        Route::Buffered { buffer, bands }
    } else {
        let lines = first.lines.unwrap_or(0);
        encoder.set_row_padding(row_stride, packed_row);
        encoder.write_header(&PnmHeader::for_frame(
            first.format,
            first.pixels_per_line,
            lines,
            first.depth,
        ))?;
        debug!("Streaming image directly");
        Route::Direct
    };

    let mut total: u64 = 0;
    let mut frames = 0;
    let mut params = first;
    loop {
        if frames > 0 {
            session.start()?;
            if session.state() == SessionState::Cancelling {
                // cancelled between frames; the read reports it
                if let Route::Buffered { buffer, .. } = route {
                    buffer.release();
                }
                session.read(&mut buf)?;
                return Err(ScanError::Cancelled);
            }
            params = session.parameters()?;
            check_next_frame(&first, &params)?;
            if matches!(route, Route::Direct) {
                return Err(ScanError::invalid("multi-frame image started on the direct path"));
            }
        }
        debug!(frame = frames, format = %params.format, last = params.last_frame, "Reading frame");

        let band = params.format.band_offset().unwrap_or(0);
        let mut frame_bytes = 0usize;
        loop {
            let len = match session.read(&mut buf) {
                Ok(ReadStatus::EndOfFrame) => break,
                Ok(ReadStatus::Data(0)) if session.is_non_blocking() => {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
                Ok(ReadStatus::Data(len)) => len,
                Err(err) => {
                    if let Route::Buffered { buffer, .. } = route {
                        buffer.release();
                    }
                    return Err(err);
                }
            };
            let chunk = buf.get(..len).ok_or_else(|| ScanError::io("read overran buffer"))?;

            match &mut route {
                Route::Direct => encoder.write_samples(chunk)?,
                Route::Buffered { buffer, bands: 1 } => buffer.write(frame_bytes, chunk)?,
                Route::Buffered { buffer, bands } => {
                    buffer.write_band(frame_bytes, chunk, band, *bands, params.sample_size())?;
                }
            }

            frame_bytes += len;
            total += len as u64;
            trace!(
                bytes = total,
                progress = ?progress_percent(total, &params),
                "Chunk received"
            );
        }

        frames += 1;
        if params.last_frame {
            break;
        }
    }

    let image_format = if first.format.is_color() {
        FrameFormat::Rgb
    } else {
        FrameFormat::Gray
    };

    let height = match route {
        Route::Direct => first.lines.unwrap_or(0),
        Route::Buffered { buffer, .. } => {
            let height = buffer.rows();
            let mut image = pack_rows(buffer.finalize(height)?, row_stride, packed_row);
            if swap {
                swap_pairs_in_place(&mut image);
            }
            encoder.write_header(&PnmHeader::for_frame(
                image_format,
                first.pixels_per_line,
                height,
                first.depth,
            ))?;
            encoder.write_image(&image)?;
            height
        }
    };

    let summary = ScanSummary {
        format: image_format,
        width: first.pixels_per_line,
        height,
        depth: first.depth,
        frames,
        bytes_read: total,
        buffered: first.format.is_band() || first.lines.is_none(),
    };
    let out = encoder.finish()?;
    info!(
        width = summary.width,
        height = summary.height,
        frames = summary.frames,
        bytes = summary.bytes_read,
        "Image complete"
    );
    Ok((summary, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Fault, MockBackend, MockDevice, ScriptedFrame};
    use crate::session::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn gray(bpl: usize, lines: Option<usize>, depth: u32) -> Parameters {
        Parameters {
            format: FrameFormat::Gray,
            last_frame: true,
            bytes_per_line: bpl,
            pixels_per_line: bpl * 8 / depth as usize,
            lines,
            depth,
        }
    }

    fn band(format: FrameFormat, ppl: usize, last_frame: bool) -> Parameters {
        Parameters {
            format,
            last_frame,
            bytes_per_line: ppl,
            pixels_per_line: ppl,
            lines: Some(1),
            depth: 8,
        }
    }

    fn scripted(frames: Vec<ScriptedFrame>) -> Runtime<MockBackend> {
        let mut runtime =
            Runtime::new(MockBackend::with_devices(vec![MockDevice::scripted("script:0", frames)]));
        runtime.init(None).expect("init should succeed");
        runtime
    }

    fn scan(runtime: &Runtime<MockBackend>, options: &AcquireOptions) -> Result<(ScanSummary, Vec<u8>)> {
        let mut session = runtime.open("script:0").expect("open should succeed");
        session.start()?;
        acquire(&mut session, Vec::new(), options)
    }

    fn body(out: &[u8], header: &PnmHeader) -> Vec<u8> {
        let len = header.to_bytes().len();
        assert_eq!(&out[..len], header.to_bytes().as_slice());
        out[len..].to_vec()
    }

    #[test]
    fn test_direct_path_gray() {
        let params = Parameters {
            format: FrameFormat::Gray,
            last_frame: true,
            bytes_per_line: 50,
            pixels_per_line: 50,
            lines: Some(100),
            depth: 8,
        };
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let chunks = data.chunks(777).map(<[u8]>::to_vec).collect();
        let runtime = scripted(vec![ScriptedFrame { params, chunks }]);

        let (summary, out) = scan(&runtime, &AcquireOptions::default()).expect("scan");
        assert!(!summary.buffered);
        assert_eq!(summary.height, 100);

        let header = PnmHeader::for_frame(FrameFormat::Gray, 50, 100, 8);
        assert_eq!(out.len(), header.to_bytes().len() + 5000);
        assert_eq!(body(&out, &header), data);
    }

    #[test]
    fn test_unknown_height_back_computed() {
        let params = gray(10, None, 8);
        let runtime = scripted(vec![ScriptedFrame {
            params,
            chunks: vec![vec![1; 25], vec![2; 25], Vec::new()],
        }]);

        let (summary, out) = scan(&runtime, &AcquireOptions::default()).expect("scan");
        assert!(summary.buffered);
        assert_eq!(summary.height, 5);

        let header = PnmHeader::for_frame(FrameFormat::Gray, 10, 5, 8);
        let data = body(&out, &header);
        assert_eq!(data.len(), 50);
        assert_eq!(data[24], 1);
        assert_eq!(data[25], 2);
    }

    #[test]
    fn test_unknown_height_pads_partial_row() {
        let runtime = scripted(vec![ScriptedFrame {
            params: gray(10, None, 8),
            chunks: vec![vec![9; 13]],
        }]);
        let (summary, out) = scan(&runtime, &AcquireOptions::default()).expect("scan");
        assert_eq!(summary.height, 2);
        let data = body(&out, &PnmHeader::for_frame(FrameFormat::Gray, 10, 2, 8));
        assert_eq!(data.len(), 20);
        assert!(data[13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_three_band_composition() {
        let red: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let green: Vec<u8> = red.iter().map(|b| b.wrapping_add(1)).collect();
        let blue: Vec<u8> = red.iter().map(|b| b.wrapping_mul(3)).collect();
        let frames = vec![
            ScriptedFrame {
                params: band(FrameFormat::Red, 100, false),
                chunks: red.chunks(7).map(<[u8]>::to_vec).collect(),
            },
            ScriptedFrame {
                params: band(FrameFormat::Green, 100, false),
                chunks: green.chunks(64).map(<[u8]>::to_vec).collect(),
            },
            ScriptedFrame {
                params: band(FrameFormat::Blue, 100, true),
                chunks: vec![blue.clone()],
            },
        ];
        let runtime = scripted(frames);

        let (summary, out) = scan(&runtime, &AcquireOptions::default()).expect("scan");
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.format, FrameFormat::Rgb);
        assert_eq!(summary.height, 3);

        let composed = body(&out, &PnmHeader::for_frame(FrameFormat::Rgb, 100, 3, 8));
        assert_eq!(composed.len(), 900);
        for i in 0..300 {
            assert_eq!(composed[3 * i], red[i]);
            assert_eq!(composed[3 * i + 1], green[i]);
            assert_eq!(composed[3 * i + 2], blue[i]);
        }
    }

    #[test]
    fn test_direct_sixteen_bit_swapped() {
        let params = Parameters {
            format: FrameFormat::Gray,
            last_frame: true,
            bytes_per_line: 4,
            pixels_per_line: 2,
            lines: Some(2),
            depth: 16,
        };
        let runtime = scripted(vec![ScriptedFrame {
            params,
            chunks: vec![vec![1, 2, 3], vec![4], vec![5, 6, 7, 8]],
        }]);
        let options = AcquireOptions {
            swap_16_bit: true,
            ..AcquireOptions::default()
        };
        let (_, out) = scan(&runtime, &options).expect("scan");
        let data = body(&out, &PnmHeader::for_frame(FrameFormat::Gray, 2, 2, 16));
        assert_eq!(data, [2, 1, 4, 3, 6, 5, 8, 7]);
    }

    #[test]
    fn test_buffered_sixteen_bit_swapped() {
        let runtime = scripted(vec![ScriptedFrame {
            params: gray(4, None, 16),
            chunks: vec![vec![1, 2, 3], vec![4, 5, 6, 7, 8]],
        }]);
        let options = AcquireOptions {
            swap_16_bit: true,
            ..AcquireOptions::default()
        };
        let (summary, out) = scan(&runtime, &options).expect("scan");
        assert_eq!(summary.height, 2);
        let data = body(&out, &PnmHeader::for_frame(FrameFormat::Gray, 2, 2, 16));
        assert_eq!(data, [2, 1, 4, 3, 6, 5, 8, 7]);
    }

    #[test]
    fn test_read_error_propagates_and_discards_buffer() {
        let mut runtime = Runtime::new(MockBackend::with_devices(vec![MockDevice::handheld(
            "test:1",
        )
        .with_read_fault_after(1000, Fault::Jammed)]));
        runtime.init(None).expect("init");
        let mut session = runtime.open("test:1").expect("open");
        session.start().expect("start");

        let result = acquire(&mut session, Vec::new(), &AcquireOptions::default());
        assert!(matches!(result, Err(ScanError::Jammed)));
        assert_eq!(session.state(), SessionState::Opened);
    }

    #[test]
    fn test_buffer_ceiling_reports_no_mem() {
        let runtime = scripted(vec![ScriptedFrame {
            params: gray(10, None, 8),
            chunks: vec![vec![1; 40], vec![1; 40]],
        }]);
        let options = AcquireOptions {
            max_buffer_bytes: 64,
            ..AcquireOptions::default()
        };
        assert!(matches!(scan(&runtime, &options), Err(ScanError::NoMem)));
    }

    #[test]
    fn test_requires_started_session() {
        let runtime = scripted(vec![ScriptedFrame {
            params: gray(10, Some(1), 8),
            chunks: vec![vec![0; 10]],
        }]);
        let mut session = runtime.open("script:0").expect("open");
        assert!(matches!(
            acquire(&mut session, Vec::new(), &AcquireOptions::default()),
            Err(ScanError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_rgb_followed_by_band_is_invalid() {
        let mut rgb = band(FrameFormat::Rgb, 4, false);
        rgb.bytes_per_line = 12;
        let frames = vec![
            ScriptedFrame {
                params: rgb,
                chunks: vec![vec![0; 12]],
            },
            ScriptedFrame {
                params: band(FrameFormat::Blue, 4, true),
                chunks: vec![vec![0; 4]],
            },
        ];
        let runtime = scripted(frames);
        assert!(matches!(
            scan(&runtime, &AcquireOptions::default()),
            Err(ScanError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_follow_up_frame_rewinds_device() {
        let frames = vec![
            ScriptedFrame {
                params: band(FrameFormat::Red, 4, false),
                chunks: vec![vec![1; 4]],
            },
            ScriptedFrame {
                params: gray(4, Some(1), 8),
                chunks: vec![vec![2; 4]],
            },
        ];
        let runtime = scripted(frames);
        let mut session = runtime.open("script:0").expect("open");
        session.start().expect("start");
        assert!(matches!(
            acquire(&mut session, Vec::new(), &AcquireOptions::default()),
            Err(ScanError::Invalid { .. })
        ));
        assert_eq!(session.state(), SessionState::Opened);
        assert!(!session.in_sequence());

        session.start().expect("fresh start");
        assert_eq!(session.parameters().expect("params").format, FrameFormat::Red);
    }

    #[test]
    fn test_direct_path_drops_row_padding() {
        let params = Parameters {
            format: FrameFormat::Gray,
            last_frame: true,
            bytes_per_line: 4,
            pixels_per_line: 3,
            lines: Some(2),
            depth: 8,
        };
        let runtime = scripted(vec![ScriptedFrame {
            params,
            chunks: vec![vec![1, 2, 3, 0xee, 4, 5], vec![6, 0xee]],
        }]);
        let (summary, out) = scan(&runtime, &AcquireOptions::default()).expect("scan");
        assert_eq!(summary.bytes_read, 8);
        let header = PnmHeader::for_frame(FrameFormat::Gray, 3, 2, 8);
        assert_eq!(body(&out, &header), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_composed_bands_drop_row_padding() {
        let padded = |format, last_frame| Parameters {
            bytes_per_line: 3,
            ..band(format, 2, last_frame)
        };
        let frames = vec![
            ScriptedFrame {
                params: padded(FrameFormat::Red, false),
                chunks: vec![vec![1, 2, 0xee]],
            },
            ScriptedFrame {
                params: padded(FrameFormat::Green, false),
                chunks: vec![vec![3, 4, 0xee]],
            },
            ScriptedFrame {
                params: padded(FrameFormat::Blue, true),
                chunks: vec![vec![5, 6, 0xee]],
            },
        ];
        let runtime = scripted(frames);
        let (summary, out) = scan(&runtime, &AcquireOptions::default()).expect("scan");
        assert_eq!(summary.height, 1);
        let header = PnmHeader::for_frame(FrameFormat::Rgb, 2, 1, 8);
        assert_eq!(body(&out, &header), [1, 3, 5, 2, 4, 6]);
    }

    #[test]
    fn test_absurd_line_size_reports_no_mem() {
        let huge = Parameters {
            bytes_per_line: usize::MAX / 2,
            ..band(FrameFormat::Red, 4, false)
        };
        let runtime = scripted(vec![ScriptedFrame {
            params: huge,
            chunks: vec![vec![0; 4]],
        }]);
        assert!(matches!(
            scan(&runtime, &AcquireOptions::default()),
            Err(ScanError::NoMem)
        ));
    }

    #[test]
    fn test_non_blocking_stall_is_polled() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut runtime = Runtime::new(MockBackend::with_devices(vec![MockDevice::flatbed(
            "test:0",
        )
        .with_stall_after(100)
        .with_read_counter(Arc::clone(&reads))]));
        runtime.init(None).expect("init");
        let mut session = runtime.open("test:0").expect("open");
        session.set_io_mode(true).expect("non-blocking");
        session.start().expect("start");

        let canceller = session.canceller();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });
        let result = acquire(&mut session, Vec::new(), &AcquireOptions::default());
        worker.join().expect("canceller thread");

        assert!(matches!(result, Err(ScanError::Cancelled)));
        // one poll per interval, not a busy loop
        let calls = reads.load(Ordering::Relaxed);
        assert!(calls < 100, "{calls} reads while stalled");
    }

    #[test]
    fn test_progress_percent() {
        let params = gray(10, Some(10), 8);
        assert_eq!(progress_percent(50, &params), Some(50.0));
        assert_eq!(progress_percent(500, &params), Some(100.0));
        assert_eq!(progress_percent(50, &gray(10, None, 8)), None);
        let red = band(FrameFormat::Red, 10, false);
        assert_eq!(progress_percent(15, &red), Some(50.0));
        assert_eq!(progress_percent(15, &gray(10, Some(usize::MAX), 8)), None);
    }
}
