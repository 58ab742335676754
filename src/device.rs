//! V4L2 backend using the v4l crate.
//!
//! Every video capture node is exposed as a single-frame scanner: `start`
//! grabs one YUYV frame through mmap streaming, converts it to RGB or gray
//! and `read` hands it out in chunks.

use std::io;
use std::path::Path;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::error::{Result, ScanError};
use crate::option::{
    names, Capabilities, ControlOutcome, Info, OptionAction, OptionDescriptor, OptionValue, Unit,
};
use crate::traits::{
    Authorizer, Backend, Canceller, DeviceHandle, DeviceInfo, FrameFormat, Parameters, ReadStatus,
    Version,
};

/// Prefix of device names served by this backend.
pub const NAME_PREFIX: &str = "v4l:";

/// Buffers queued for mmap streaming.
const STREAM_BUFFERS: u32 = 4;

/// Linux `EBUSY`.
const EBUSY: i32 = 16;

const OPT_MODE: usize = 2;
const OPT_WIDTH: usize = 3;
const OPT_HEIGHT: usize = 4;

const MODES: [&str; 2] = ["Color", "Gray"];

fn map_io(err: &io::Error) -> ScanError {
    if err.raw_os_error() == Some(EBUSY) {
        return ScanError::DeviceBusy;
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => ScanError::AccessDenied,
        io::ErrorKind::NotFound => ScanError::invalid(err.to_string()),
        _ => ScanError::io(err.to_string()),
    }
}

/// Device name for a video node path.
pub fn device_name(path: &Path) -> String {
    format!("{NAME_PREFIX}{}", path.display())
}

/// Backend enumerating `/dev/video*` capture nodes.
#[derive(Debug, Default)]
pub struct V4l2Backend;

impl V4l2Backend {
    /// Create the backend.
    pub const fn new() -> Self {
        Self
    }
}

impl Backend for V4l2Backend {
    type Handle = V4l2Handle;

    fn initialize(&self, _auth: Option<Authorizer>) -> Result<Version> {
        Ok(Version {
            major: 1,
            minor: 0,
            build: 14,
        })
    }

    fn devices(&self, _local_only: bool) -> Result<Vec<DeviceInfo>> {
        Ok(v4l::context::enum_devices()
            .into_iter()
            .map(|node| DeviceInfo {
                name: device_name(node.path()),
                vendor: "V4L2".to_owned(),
                model: node.name().unwrap_or_default(),
                kind: "video camera".to_owned(),
            })
            .collect())
    }

    fn open(&self, name: &str) -> Result<V4l2Handle> {
        let path = name
            .strip_prefix(NAME_PREFIX)
            .ok_or_else(|| ScanError::invalid(format!("'{name}' is not a V4L2 device")))?;
        V4l2Handle::open(Path::new(path))
    }

    fn exit(&self) {}
}

/// Negotiated capture geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    width: usize,
    height: usize,
    stride: usize,
}

#[derive(Debug)]
struct Captured {
    data: Vec<u8>,
    position: usize,
}

/// Handle to an opened V4L2 capture node.
pub struct V4l2Handle {
    device: Device,
    descriptors: Vec<OptionDescriptor>,
    mode: String,
    geometry: Geometry,
    canceller: Canceller,
    frame: Option<Captured>,
}

impl V4l2Handle {
    fn open(path: &Path) -> Result<Self> {
        let device = Device::with_path(path).map_err(|err| map_io(&err))?;
        let caps = device.query_caps().map_err(|err| map_io(&err))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(ScanError::Unsupported);
        }

        let mut fmt = device.format().map_err(|err| map_io(&err))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        let fmt = device.set_format(&fmt).map_err(|err| map_io(&err))?;
        if fmt.fourcc != FourCC::new(b"YUYV") {
            warn!(fourcc = ?fmt.fourcc, "Device does not deliver YUYV");
            return Err(ScanError::Unsupported);
        }
        let geometry = Geometry {
            width: fmt.width as usize,
            height: fmt.height as usize,
            stride: fmt.stride as usize,
        };
        debug!(card = %caps.card, driver = %caps.driver, ?geometry, "V4L2 device ready");

        let read_only = Capabilities::SOFT_DETECT;
        let descriptors = vec![
            OptionDescriptor::option_count(),
            OptionDescriptor::group("Scan Mode"),
            OptionDescriptor::string_list(
                names::MODE,
                "Scan mode",
                "Selects color or gray output.",
                &MODES,
            ),
            OptionDescriptor::int("width", "Width", "Frame width in pixels.")
                .with_unit(Unit::Pixel)
                .with_caps(read_only),
            OptionDescriptor::int("height", "Height", "Frame height in pixels.")
                .with_unit(Unit::Pixel)
                .with_caps(read_only),
        ];

        Ok(Self {
            device,
            descriptors,
            mode: "Color".to_owned(),
            geometry,
            canceller: Canceller::new(),
            frame: None,
        })
    }

    fn format(&self) -> FrameFormat {
        if self.mode == "Gray" {
            FrameFormat::Gray
        } else {
            FrameFormat::Rgb
        }
    }

    fn capture(&self) -> Result<Vec<u8>> {
        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|err| map_io(&err))?;
        let (buf, meta) = stream.next().map_err(|err| map_io(&err))?;
        let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);

        let Geometry {
            width,
            height,
            stride,
        } = self.geometry;
        let converted = match self.format() {
            FrameFormat::Gray => yuyv_to_gray(used, width, height, stride),
            _ => yuyv_to_rgb(used, width, height, stride),
        };
        debug!(sequence = meta.sequence, bytes = converted.len(), "Frame captured");
        Ok(converted)
    }
}

impl DeviceHandle for V4l2Handle {
    fn option_descriptor(&self, index: usize) -> Option<&OptionDescriptor> {
        self.descriptors.get(index)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn control_option(&mut self, index: usize, action: OptionAction) -> Result<ControlOutcome> {
        let desc = self
            .descriptors
            .get(index)
            .ok_or_else(|| ScanError::invalid(format!("no option {index}")))?;

        match (index, action) {
            (_, OptionAction::Auto) => Err(ScanError::invalid(format!(
                "option '{}' has no automatic mode",
                desc.name
            ))),
            (OPT_MODE, OptionAction::Set(value)) => {
                let (value, mut info) = desc.constrain(value)?;
                if let Some(mode) = value.as_str() {
                    if mode != self.mode {
                        info |= Info::RELOAD_PARAMS;
                        mode.clone_into(&mut self.mode);
                    }
                }
                Ok(ControlOutcome { value, info })
            }
            (_, OptionAction::Set(_)) => Err(ScanError::invalid(format!(
                "option '{}' is read-only",
                desc.name
            ))),
            (_, OptionAction::Get) => {
                let value = match index {
                    0 => OptionValue::Int(self.descriptors.len() as i32),
                    OPT_MODE => OptionValue::String(self.mode.clone()),
                    OPT_WIDTH => OptionValue::Int(self.geometry.width as i32),
                    OPT_HEIGHT => OptionValue::Int(self.geometry.height as i32),
                    _ => OptionValue::Button,
                };
                Ok(ControlOutcome::of(value))
            }
        }
    }

    fn parameters(&self) -> Result<Parameters> {
        let format = self.format();
        let channels = if format == FrameFormat::Rgb { 3 } else { 1 };
        Ok(Parameters {
            format,
            last_frame: true,
            bytes_per_line: self.geometry.width * channels,
            pixels_per_line: self.geometry.width,
            lines: Some(self.geometry.height),
            depth: 8,
        })
    }

    fn start(&mut self) -> Result<()> {
        if self.frame.is_some() {
            return Err(ScanError::DeviceBusy);
        }
        let data = self.capture()?;
        self.frame = Some(Captured { data, position: 0 });
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        if self.canceller.is_cancelled() {
            self.frame = None;
            return Err(ScanError::Cancelled);
        }
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| ScanError::invalid("no acquisition in progress"))?;

        let rest = frame.data.get(frame.position..).unwrap_or_default();
        if rest.is_empty() {
            self.frame = None;
            return Ok(ReadStatus::EndOfFrame);
        }
        let len = rest.len().min(buf.len());
        if let (Some(dst), Some(src)) = (buf.get_mut(..len), rest.get(..len)) {
            dst.copy_from_slice(src);
        }
        frame.position += len;
        Ok(ReadStatus::Data(len))
    }

    fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    fn reset(&mut self) {
        self.frame = None;
        self.canceller.take();
    }

    fn set_io_mode(&mut self, non_blocking: bool) -> Result<()> {
        if non_blocking {
            Err(ScanError::Unsupported)
        } else {
            Ok(())
        }
    }

    fn close(&mut self) {
        self.frame = None;
    }
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    let clamp = |val: f32| -> u8 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            val.clamp(0.0, 255.0) as u8
        }
    };

    [clamp(r), clamp(g), clamp(b)]
}

/// Walk a packed YUYV image, calling `emit` with `(y, u, v)` per pixel.
fn for_each_yuyv<F: FnMut(u8, u8, u8)>(
    data: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    mut emit: F,
) {
    let stride = stride.max(width * 2).max(1);
    for row in data.chunks(stride).take(height) {
        let row = row.get(..width * 2).unwrap_or(row);
        for quad in row.chunks_exact(4) {
            if let [y0, u, y1, v] = *quad {
                emit(y0, u, v);
                emit(y1, u, v);
            }
        }
    }
}

/// Packed YUYV to interleaved 8-bit RGB, `width * height * 3` bytes.
///
/// Short input is zero-padded.
pub fn yuyv_to_rgb(data: &[u8], width: usize, height: usize, stride: usize) -> Vec<u8> {
    let len = width * height * 3;
    let mut out = Vec::with_capacity(len);
    for_each_yuyv(data, width, height, stride, |y, u, v| {
        out.extend_from_slice(&yuv_to_rgb(y, u, v));
    });
    out.resize(len, 0);
    out
}

/// Packed YUYV to 8-bit gray (the Y plane), `width * height` bytes.
pub fn yuyv_to_gray(data: &[u8], width: usize, height: usize, stride: usize) -> Vec<u8> {
    let len = width * height;
    let mut out = Vec::with_capacity(len);
    for_each_yuyv(data, width, height, stride, |y, _, _| out.push(y));
    out.resize(len, 0);
    out
}
