//! Test backend for scanning without hardware.
//!
//! Devices either render a synthetic pattern from their option values or
//! replay a scripted sequence of frames chunk by chunk.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, ScanError};
use crate::option::{
    names, Capabilities, Constraint, ControlOutcome, Fixed, Info, OptionAction, OptionDescriptor,
    OptionValue, Range, Unit,
};
use crate::traits::{
    Authorizer, Backend, Canceller, DeviceHandle, DeviceInfo, FrameFormat, Parameters, ReadStatus,
    Version,
};

const OPT_NUM_OPTIONS: usize = 0;
const OPT_MODE: usize = 2;
const OPT_SOURCE: usize = 3;
const OPT_DEPTH: usize = 4;
const OPT_RESOLUTION: usize = 5;
const OPT_PREVIEW: usize = 6;
const OPT_TL_X: usize = 8;
const OPT_TL_Y: usize = 9;
const OPT_BR_X: usize = 10;
const OPT_BR_Y: usize = 11;
const NUM_OPTIONS: usize = 12;

const MAX_X_MM: i32 = 216;
const MAX_Y_MM: i32 = 297;
const MM_PER_INCH: f64 = 25.4;
const STALL_POLL: Duration = Duration::from_millis(1);

/// Synthetic image content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Eight vertical bars: white, yellow, cyan, green, magenta, red, blue, black.
    ColorBars,
    /// Horizontal gradient from black to white.
    Gradient,
    /// Uniform gray level.
    Solid(u8),
}

/// RGB levels of the color bar pattern, left to right.
pub const COLOR_BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

impl TestPattern {
    /// RGB value of column `x` in an image `width` pixels wide.
    pub fn rgb(self, x: usize, width: usize) -> [u8; 3] {
        match self {
            Self::ColorBars => {
                let bar = (x * COLOR_BARS.len() / width.max(1)).min(COLOR_BARS.len() - 1);
                COLOR_BARS.get(bar).copied().unwrap_or_default()
            }
            Self::Gradient => {
                #[allow(clippy::cast_possible_truncation)]
                let level = (x * 255 / width.saturating_sub(1).max(1)).min(255) as u8;
                [level; 3]
            }
            Self::Solid(level) => [level; 3],
        }
    }
}

/// Rec. 601 luma of an RGB triple.
pub fn luma([r, g, b]: [u8; 3]) -> u8 {
    let y = (u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000;
    #[allow(clippy::cast_possible_truncation)]
    {
        y.min(255) as u8
    }
}

/// Failure a mock device can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Device busy.
    Busy,
    /// Feeder jammed.
    Jammed,
    /// Feeder empty.
    NoDocs,
    /// Cover open.
    CoverOpen,
    /// Invalid configuration.
    Invalid,
    /// Device I/O error.
    Io,
    /// Out of memory.
    NoMem,
}

impl Fault {
    fn to_error(self) -> ScanError {
        match self {
            Self::Busy => ScanError::DeviceBusy,
            Self::Jammed => ScanError::Jammed,
            Self::NoDocs => ScanError::NoDocs,
            Self::CoverOpen => ScanError::CoverOpen,
            Self::Invalid => ScanError::invalid("injected invalid configuration"),
            Self::Io => ScanError::io("injected I/O error"),
            Self::NoMem => ScanError::NoMem,
        }
    }
}

/// How a mock device moves paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Known height, single-pass color.
    Flatbed,
    /// Height unknown until the end of the frame.
    Handheld,
    /// Color delivered as separate red, green and blue frames.
    ThreePass,
}

/// One frame of a scripted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedFrame {
    /// Parameters reported while the frame is current.
    pub params: Parameters,
    /// Chunks returned by successive reads, sizes preserved.
    pub chunks: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
enum Content {
    Pattern(DeviceKind),
    Script(Vec<ScriptedFrame>),
}

/// Profile of one mock device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    name: String,
    content: Content,
    pattern: TestPattern,
    chunk_size: usize,
    busy: bool,
    start_fault: Option<Fault>,
    read_fault_after: Option<(usize, Fault)>,
    stall_after: Option<usize>,
    password: Option<(String, String)>,
    read_calls: Option<Arc<AtomicUsize>>,
}

impl MockDevice {
    fn new(name: &str, content: Content) -> Self {
        Self {
            name: name.to_owned(),
            content,
            pattern: TestPattern::ColorBars,
            chunk_size: 4096,
            busy: false,
            start_fault: None,
            read_fault_after: None,
            stall_after: None,
            password: None,
            read_calls: None,
        }
    }

    /// Flatbed scanner with known image height.
    pub fn flatbed(name: &str) -> Self {
        Self::new(name, Content::Pattern(DeviceKind::Flatbed))
    }

    /// Hand scanner that reports an unknown height.
    pub fn handheld(name: &str) -> Self {
        Self::new(name, Content::Pattern(DeviceKind::Handheld))
    }

    /// Scanner delivering color as three single-band frames.
    pub fn three_pass(name: &str) -> Self {
        Self::new(name, Content::Pattern(DeviceKind::ThreePass))
    }

    /// Device replaying `frames` exactly.
    pub fn scripted(name: &str, frames: Vec<ScriptedFrame>) -> Self {
        Self::new(name, Content::Script(frames))
    }

    /// Set the rendered pattern.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Limit bytes returned per read.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Refuse to open.
    #[must_use]
    pub const fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    /// Fail every `start` with `fault`.
    #[must_use]
    pub const fn with_start_fault(mut self, fault: Fault) -> Self {
        self.start_fault = Some(fault);
        self
    }

    /// Fail reads with `fault` once `bytes` have been delivered in a frame.
    #[must_use]
    pub const fn with_read_fault_after(mut self, bytes: usize, fault: Fault) -> Self {
        self.read_fault_after = Some((bytes, fault));
        self
    }

    /// Stop delivering data after `bytes` until cancelled.
    #[must_use]
    pub const fn with_stall_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    /// Require credentials to open.
    #[must_use]
    pub fn with_password(mut self, username: &str, password: &str) -> Self {
        self.password = Some((username.to_owned(), password.to_owned()));
        self
    }

    /// Count every `read` call in `counter`.
    #[must_use]
    pub fn with_read_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.read_calls = Some(counter);
        self
    }

    fn info(&self) -> DeviceInfo {
        let kind = match self.content {
            Content::Pattern(DeviceKind::Handheld) => "handheld scanner",
            Content::Pattern(DeviceKind::Flatbed | DeviceKind::ThreePass) => "flatbed scanner",
            Content::Script(_) => "virtual device",
        };
        DeviceInfo {
            name: self.name.clone(),
            vendor: "Noname".to_owned(),
            model: "mock".to_owned(),
            kind: kind.to_owned(),
        }
    }
}

/// Backend serving a fixed list of mock devices.
pub struct MockBackend {
    devices: Vec<MockDevice>,
    fail_init: bool,
    auth: Mutex<Option<Authorizer>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend with `test:0` (flatbed), `test:1` (handheld) and `test:2`
    /// (three-pass).
    pub fn new() -> Self {
        Self::with_devices(vec![
            MockDevice::flatbed("test:0"),
            MockDevice::handheld("test:1"),
            MockDevice::three_pass("test:2"),
        ])
    }

    /// Backend serving `devices`.
    pub fn with_devices(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            fail_init: false,
            auth: Mutex::new(None),
        }
    }

    /// Make `initialize` fail.
    #[must_use]
    pub const fn with_init_failure(mut self) -> Self {
        self.fail_init = true;
        self
    }

    fn authorizer(&self) -> Option<Authorizer> {
        self.auth.lock().ok().and_then(|guard| (*guard).clone())
    }
}

impl Backend for MockBackend {
    type Handle = MockHandle;

    fn initialize(&self, auth: Option<Authorizer>) -> Result<Version> {
        if self.fail_init {
            return Err(ScanError::Init {
                reason: "mock backend configured to fail".to_owned(),
            });
        }
        if let Ok(mut guard) = self.auth.lock() {
            *guard = auth;
        }
        Ok(Version {
            major: 1,
            minor: 0,
            build: 0,
        })
    }

    fn devices(&self, _local_only: bool) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.iter().map(MockDevice::info).collect())
    }

    fn open(&self, name: &str) -> Result<MockHandle> {
        let device = self
            .devices
            .iter()
            .find(|dev| dev.name == name)
            .ok_or_else(|| ScanError::invalid(format!("no device named '{name}'")))?;

        if device.busy {
            return Err(ScanError::DeviceBusy);
        }
        if let Some((user, pass)) = &device.password {
            let creds = self
                .authorizer()
                .and_then(|auth| auth.authorize(name))
                .ok_or(ScanError::AccessDenied)?;
            if &creds.username != user || &creds.password != pass {
                return Err(ScanError::AccessDenied);
            }
        }

        Ok(MockHandle::new(device.clone()))
    }

    fn exit(&self) {
        if let Ok(mut guard) = self.auth.lock() {
            *guard = None;
        }
    }
}

#[derive(Debug)]
struct Acquisition {
    params: Parameters,
    chunks: VecDeque<Vec<u8>>,
    delivered: usize,
}

/// Handle to an opened mock device.
pub struct MockHandle {
    device: MockDevice,
    descriptors: Vec<OptionDescriptor>,
    values: Vec<OptionValue>,
    canceller: Canceller,
    non_blocking: bool,
    next_frame: usize,
    acquisition: Option<Acquisition>,
    closed: bool,
}

fn mm(value: i32) -> OptionValue {
    OptionValue::Fixed(Fixed::from_int(value))
}

fn area_option(name: &str, title: &str, max_mm: i32) -> OptionDescriptor {
    OptionDescriptor::fixed(name, title, &format!("{title} of the scan area."))
        .with_unit(Unit::Mm)
        .with_constraint(Constraint::Range(Range::new(
            0,
            Fixed::from_int(max_mm).0,
            Fixed::from_int(1).0,
        )))
}

impl MockHandle {
    fn new(device: MockDevice) -> Self {
        let descriptors = vec![
            OptionDescriptor::option_count(),
            OptionDescriptor::group("Scan Mode"),
            OptionDescriptor::string_list(
                names::MODE,
                "Scan mode",
                "Selects the scan mode (e.g., lineart, monochrome, or color).",
                &["Color", "Gray", "Lineart"],
            ),
            OptionDescriptor::string_list(
                names::SOURCE,
                "Scan source",
                "Selects the scan source (such as a document-feeder).",
                &["Flatbed", "Transparency Adapter"],
            ),
            OptionDescriptor::int(
                names::DEPTH,
                "Bit depth",
                "Number of bits per sample, typical values are 1 for \"line-art\" and 8 for multibit scans.",
            )
            .with_unit(Unit::Bit)
            .with_constraint(Constraint::WordList(vec![8, 16])),
            OptionDescriptor::int(
                names::RESOLUTION,
                "Scan resolution",
                "Sets the resolution of the scanned image.",
            )
            .with_unit(Unit::Dpi)
            .with_caps(Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT | Capabilities::AUTOMATIC)
            .with_constraint(Constraint::WordList(vec![25, 50, 75, 150, 300])),
            OptionDescriptor::boolean(
                names::PREVIEW,
                "Preview",
                "Request a preview-quality scan.",
            ),
            OptionDescriptor::group("Geometry"),
            area_option(names::TL_X, "Top-left x", MAX_X_MM),
            area_option(names::TL_Y, "Top-left y", MAX_Y_MM),
            area_option(names::BR_X, "Bottom-right x", MAX_X_MM),
            area_option(names::BR_Y, "Bottom-right y", MAX_Y_MM),
        ];

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let values = vec![
            OptionValue::Int(NUM_OPTIONS as i32),
            OptionValue::Button,
            OptionValue::String("Gray".to_owned()),
            OptionValue::String("Flatbed".to_owned()),
            OptionValue::Int(8),
            OptionValue::Int(25),
            OptionValue::Bool(false),
            OptionValue::Button,
            mm(0),
            mm(0),
            mm(210),
            mm(297),
        ];

        Self {
            device,
            descriptors,
            values,
            canceller: Canceller::new(),
            non_blocking: false,
            next_frame: 0,
            acquisition: None,
            closed: false,
        }
    }

    fn value(&self, index: usize) -> Option<&OptionValue> {
        self.values.get(index)
    }

    fn word(&self, index: usize) -> i32 {
        self.value(index).and_then(OptionValue::as_word).unwrap_or(0)
    }

    fn mode(&self) -> &str {
        self.value(OPT_MODE)
            .and_then(OptionValue::as_str)
            .unwrap_or("Gray")
    }

    fn refresh_activity(&mut self) {
        let lineart = self.mode() == "Lineart";
        if let Some(depth) = self.descriptors.get_mut(OPT_DEPTH) {
            depth.cap = if lineart {
                depth.cap | Capabilities::INACTIVE
            } else {
                depth.cap.without(Capabilities::INACTIVE)
            };
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn pixels(&self, from: usize, to: usize) -> usize {
        let span = Fixed(self.word(to) - self.word(from)).to_f64();
        let dpi = f64::from(self.word(OPT_RESOLUTION));
        (span * dpi / MM_PER_INCH).max(0.0) as usize
    }

    fn kind(&self) -> Option<DeviceKind> {
        match self.device.content {
            Content::Pattern(kind) => Some(kind),
            Content::Script(_) => None,
        }
    }

    /// Parameters for frame `frame` of the current image.
    fn frame_parameters(&self, frame: usize) -> Result<Parameters> {
        if let Content::Script(frames) = &self.device.content {
            return frames
                .get(frame)
                .map(|f| f.params)
                .ok_or_else(|| ScanError::invalid("script has no frames"));
        }

        let pixels_per_line = self.pixels(OPT_TL_X, OPT_BR_X);
        let lines = self.pixels(OPT_TL_Y, OPT_BR_Y);
        let depth = if self.mode() == "Lineart" {
            1
        } else {
            u32::try_from(self.word(OPT_DEPTH)).unwrap_or(8)
        };
        let kind = self.kind().unwrap_or(DeviceKind::Flatbed);

        let (format, last_frame) = match (self.mode(), kind) {
            ("Color", DeviceKind::ThreePass) => {
                let format = match frame {
                    0 => FrameFormat::Red,
                    1 => FrameFormat::Green,
                    _ => FrameFormat::Blue,
                };
                (format, frame >= 2)
            }
            ("Color", _) => (FrameFormat::Rgb, true),
            _ => (FrameFormat::Gray, true),
        };
        let channels = if format == FrameFormat::Rgb { 3 } else { 1 };

        Ok(Parameters {
            format,
            last_frame,
            bytes_per_line: channels * (pixels_per_line * depth as usize).div_ceil(8),
            pixels_per_line,
            lines: (kind != DeviceKind::Handheld).then_some(lines),
            depth,
        })
    }

    fn render(&self, params: &Parameters) -> Vec<Vec<u8>> {
        let lines = self.pixels(OPT_TL_Y, OPT_BR_Y);
        let line = render_line(params, self.device.pattern);
        let mut frame = Vec::with_capacity(line.len() * lines);
        for _ in 0..lines {
            frame.extend_from_slice(&line);
        }
        frame
            .chunks(self.device.chunk_size)
            .map(<[u8]>::to_vec)
            .collect()
    }

    fn set_option(&mut self, index: usize, value: OptionValue) -> Result<ControlOutcome> {
        let desc = self
            .descriptors
            .get(index)
            .ok_or_else(|| ScanError::invalid(format!("no option {index}")))?;
        if !desc.is_settable() || !desc.is_active() {
            return Err(ScanError::invalid(format!(
                "option '{}' cannot be set",
                desc.name
            )));
        }

        let (value, mut info) = desc.constrain(value)?;
        let changed = self.values.get(index) != Some(&value);
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value.clone();
        }

        match index {
            OPT_MODE if changed => {
                self.refresh_activity();
                info |= Info::RELOAD_OPTIONS | Info::RELOAD_PARAMS;
            }
            OPT_DEPTH | OPT_RESOLUTION | OPT_TL_X | OPT_TL_Y | OPT_BR_X | OPT_BR_Y => {
                info |= Info::RELOAD_PARAMS;
            }
            _ => {}
        }
        Ok(ControlOutcome { value, info })
    }
}

fn render_line(params: &Parameters, pattern: TestPattern) -> Vec<u8> {
    let width = params.pixels_per_line;
    let mut line = vec![0u8; params.bytes_per_line];

    if params.depth == 1 {
        for x in 0..width {
            if luma(pattern.rgb(x, width)) < 128 {
                if let Some(byte) = line.get_mut(x / 8) {
                    *byte |= 0x80 >> (x % 8);
                }
            }
        }
        return line;
    }

    let mut samples = Vec::with_capacity(params.bytes_per_line);
    for x in 0..width {
        let rgb = pattern.rgb(x, width);
        let gray = [luma(rgb)];
        let [r, g, b] = &rgb;
        let channels: &[u8] = match params.format {
            FrameFormat::Rgb => &rgb,
            FrameFormat::Gray => &gray,
            FrameFormat::Red => std::slice::from_ref(r),
            FrameFormat::Green => std::slice::from_ref(g),
            FrameFormat::Blue => std::slice::from_ref(b),
        };
        for &level in channels {
            if params.depth == 16 {
                // 16-bit samples travel in host byte order
                samples.extend_from_slice(&(u16::from(level) * 257).to_ne_bytes());
            } else {
                samples.push(level);
            }
        }
    }
    for (dst, src) in line.iter_mut().zip(samples) {
        *dst = src;
    }
    line
}

impl DeviceHandle for MockHandle {
    fn option_descriptor(&self, index: usize) -> Option<&OptionDescriptor> {
        self.descriptors.get(index)
    }

    fn control_option(&mut self, index: usize, action: OptionAction) -> Result<ControlOutcome> {
        match action {
            OptionAction::Get => {
                self.values
                    .get(index)
                    .cloned()
                    .map(ControlOutcome::of)
                    .ok_or_else(|| ScanError::invalid(format!("no option {index}")))
            }
            OptionAction::Set(_) if index == OPT_NUM_OPTIONS => {
                Err(ScanError::invalid("option count is read-only"))
            }
            OptionAction::Set(value) => self.set_option(index, value),
            OptionAction::Auto if index == OPT_RESOLUTION => {
                self.set_option(index, OptionValue::Int(75))
            }
            OptionAction::Auto => Err(ScanError::invalid(format!(
                "option {index} has no automatic mode"
            ))),
        }
    }

    fn parameters(&self) -> Result<Parameters> {
        match &self.acquisition {
            Some(acq) => Ok(acq.params),
            None => self.frame_parameters(self.next_frame),
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.closed {
            return Err(ScanError::invalid("device closed"));
        }
        if self.acquisition.is_some() {
            return Err(ScanError::DeviceBusy);
        }
        if let Some(fault) = self.device.start_fault {
            return Err(fault.to_error());
        }
        let params = self.frame_parameters(self.next_frame)?;
        let chunks = match &self.device.content {
            Content::Script(frames) => frames
                .get(self.next_frame)
                .map(|f| f.chunks.clone())
                .unwrap_or_default(),
            Content::Pattern(_) => {
                if params.pixels_per_line == 0 || self.pixels(OPT_TL_Y, OPT_BR_Y) == 0 {
                    return Err(ScanError::invalid("scan area is empty"));
                }
                self.render(&params)
            }
        };

        debug!(device = %self.device.name, frame = self.next_frame, format = %params.format, "Mock frame started");
        self.acquisition = Some(Acquisition {
            params,
            chunks: chunks.into(),
            delivered: 0,
        });
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        if let Some(calls) = &self.device.read_calls {
            calls.fetch_add(1, Ordering::Relaxed);
        }
        if self.canceller.is_cancelled() {
            self.acquisition = None;
            self.next_frame = 0;
            return Err(ScanError::Cancelled);
        }

        let device = &self.device;
        let acq = self
            .acquisition
            .as_mut()
            .ok_or_else(|| ScanError::invalid("no acquisition in progress"))?;

        if let Some((after, fault)) = device.read_fault_after {
            if acq.delivered >= after {
                self.acquisition = None;
                self.next_frame = 0;
                return Err(fault.to_error());
            }
        }

        if let Some(after) = device.stall_after {
            if acq.delivered >= after {
                if self.non_blocking {
                    return Ok(ReadStatus::Data(0));
                }
                while !self.canceller.is_cancelled() {
                    thread::sleep(STALL_POLL);
                }
                self.acquisition = None;
                self.next_frame = 0;
                return Err(ScanError::Cancelled);
            }
        }

        let Some(chunk) = acq.chunks.front_mut() else {
            let last = acq.params.last_frame;
            self.acquisition = None;
            self.next_frame = if last { 0 } else { self.next_frame + 1 };
            return Ok(ReadStatus::EndOfFrame);
        };

        let mut len = chunk.len().min(buf.len());
        if let Some(after) = device.stall_after {
            len = len.min(after - acq.delivered);
        }
        let rest = chunk.split_off(len);
        if let Some(dst) = buf.get_mut(..len) {
            dst.copy_from_slice(chunk.as_slice());
        }
        *chunk = rest;
        if chunk.is_empty() {
            acq.chunks.pop_front();
        }
        acq.delivered += len;
        Ok(ReadStatus::Data(len))
    }

    fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    fn reset(&mut self) {
        if self.acquisition.is_some() || self.next_frame != 0 {
            debug!(device = %self.device.name, frame = self.next_frame, "Mock sequence reset");
        }
        self.acquisition = None;
        self.next_frame = 0;
        self.canceller.take();
    }

    fn set_io_mode(&mut self, non_blocking: bool) -> Result<()> {
        self.non_blocking = non_blocking;
        Ok(())
    }

    fn close(&mut self) {
        self.acquisition = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_frame(handle: &mut MockHandle) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 1000];
        loop {
            match handle.read(&mut buf).expect("read should succeed") {
                ReadStatus::Data(len) => out.extend_from_slice(&buf[..len]),
                ReadStatus::EndOfFrame => return out,
            }
        }
    }

    #[test]
    fn test_mock_backend_devices() {
        let backend = MockBackend::new();
        backend.initialize(None).expect("init");
        let devices = backend.devices(true).expect("devices");
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["test:0", "test:1", "test:2"]);
        assert_eq!(devices[1].kind, "handheld scanner");
    }

    #[test]
    fn test_default_parameters() {
        let backend = MockBackend::new();
        let handle = backend.open("test:0").expect("open");
        let params = handle.parameters().expect("params");
        // 210 x 297 mm at 25 dpi
        assert_eq!(params.format, FrameFormat::Gray);
        assert_eq!(params.pixels_per_line, 206);
        assert_eq!(params.lines, Some(292));
        assert_eq!(params.bytes_per_line, 206);
        assert!(params.is_consistent());
    }

    #[test]
    fn test_handheld_reports_unknown_height() {
        let backend = MockBackend::new();
        let mut handle = backend.open("test:1").expect("open");
        assert_eq!(handle.parameters().expect("params").lines, None);

        handle.start().expect("start");
        let data = read_frame(&mut handle);
        assert_eq!(data.len(), 206 * 292);
    }

    #[test]
    fn test_three_pass_frame_sequence() {
        let backend = MockBackend::new();
        let mut handle = backend.open("test:2").expect("open");
        handle
            .control_option(OPT_MODE, OptionAction::Set(OptionValue::String("Color".to_owned())))
            .expect("set mode");

        let mut formats = Vec::new();
        loop {
            handle.start().expect("start");
            let params = handle.parameters().expect("params");
            formats.push(params.format);
            read_frame(&mut handle);
            if params.last_frame {
                break;
            }
        }
        assert_eq!(
            formats,
            [FrameFormat::Red, FrameFormat::Green, FrameFormat::Blue]
        );
        assert_eq!(handle.parameters().expect("params").format, FrameFormat::Red);
    }

    #[test]
    fn test_reset_rewinds_three_pass_sequence() {
        let backend = MockBackend::new();
        let mut handle = backend.open("test:2").expect("open");
        handle
            .control_option(OPT_MODE, OptionAction::Set(OptionValue::String("Color".to_owned())))
            .expect("set mode");

        handle.start().expect("start");
        read_frame(&mut handle);
        assert_eq!(handle.parameters().expect("params").format, FrameFormat::Green);

        handle.canceller().cancel();
        handle.reset();
        assert!(!handle.canceller().is_cancelled());
        assert_eq!(handle.parameters().expect("params").format, FrameFormat::Red);
    }

    #[test]
    fn test_color_bars_line() {
        let params = Parameters {
            format: FrameFormat::Rgb,
            last_frame: true,
            bytes_per_line: 24,
            pixels_per_line: 8,
            lines: Some(1),
            depth: 8,
        };
        let line = render_line(&params, TestPattern::ColorBars);
        assert_eq!(&line[..3], &[255, 255, 255]);
        assert_eq!(&line[15..18], &[255, 0, 0]);
        assert_eq!(&line[21..24], &[0, 0, 0]);
    }

    #[test]
    fn test_lineart_line_packs_bits() {
        let params = Parameters {
            format: FrameFormat::Gray,
            last_frame: true,
            bytes_per_line: 2,
            pixels_per_line: 10,
            lines: Some(1),
            depth: 1,
        };
        let line = render_line(&params, TestPattern::Solid(0));
        assert_eq!(line, [0xff, 0xc0]);
        let line = render_line(&params, TestPattern::Solid(255));
        assert_eq!(line, [0, 0]);
    }

    #[test]
    fn test_gradient_pattern() {
        assert_eq!(TestPattern::Gradient.rgb(0, 100), [0, 0, 0]);
        assert_eq!(TestPattern::Gradient.rgb(99, 100), [255, 255, 255]);
        assert!(luma(TestPattern::Gradient.rgb(50, 100)) > 100);
    }

    #[test]
    fn test_scripted_chunks_are_replayed() {
        let params = Parameters {
            format: FrameFormat::Gray,
            last_frame: true,
            bytes_per_line: 10,
            pixels_per_line: 10,
            lines: None,
            depth: 8,
        };
        let backend = MockBackend::with_devices(vec![MockDevice::scripted(
            "script:0",
            vec![ScriptedFrame {
                params,
                chunks: vec![vec![1; 25], vec![2; 25], Vec::new()],
            }],
        )]);
        let mut handle = backend.open("script:0").expect("open");
        handle.start().expect("start");

        let mut buf = [0u8; 64];
        assert_eq!(handle.read(&mut buf).expect("read"), ReadStatus::Data(25));
        assert_eq!(handle.read(&mut buf).expect("read"), ReadStatus::Data(25));
        assert_eq!(handle.read(&mut buf).expect("read"), ReadStatus::Data(0));
        assert_eq!(handle.read(&mut buf).expect("read"), ReadStatus::EndOfFrame);
    }

    #[test]
    fn test_small_read_buffer_splits_chunks() {
        let backend = MockBackend::new();
        let mut handle = backend.open("test:0").expect("open");
        handle.start().expect("start");
        let mut buf = [0u8; 7];
        assert_eq!(handle.read(&mut buf).expect("read"), ReadStatus::Data(7));
    }

    #[test]
    fn test_read_fault_injection() {
        let backend = MockBackend::with_devices(vec![
            MockDevice::flatbed("test:0").with_read_fault_after(100, Fault::Jammed)
        ]);
        let mut handle = backend.open("test:0").expect("open");
        handle.start().expect("start");
        let mut buf = [0u8; 64];
        let mut result = handle.read(&mut buf);
        while let Ok(ReadStatus::Data(_)) = result {
            result = handle.read(&mut buf);
        }
        assert!(matches!(result, Err(ScanError::Jammed)));
    }

    #[test]
    fn test_empty_area_rejected_at_start() {
        let backend = MockBackend::new();
        let mut handle = backend.open("test:0").expect("open");
        handle
            .control_option(OPT_BR_X, OptionAction::Set(mm(0)))
            .expect("set br-x");
        assert!(matches!(handle.start(), Err(ScanError::Invalid { .. })));
    }

    #[test]
    fn test_auto_resolution() {
        let backend = MockBackend::new();
        let mut handle = backend.open("test:0").expect("open");
        let outcome = handle
            .control_option(OPT_RESOLUTION, OptionAction::Auto)
            .expect("auto");
        assert_eq!(outcome.value, OptionValue::Int(75));
        assert!(handle
            .control_option(OPT_PREVIEW, OptionAction::Auto)
            .is_err());
        let source = handle
            .control_option(OPT_SOURCE, OptionAction::Get)
            .expect("get source");
        assert_eq!(source.value.as_str(), Some("Flatbed"));
    }
}
