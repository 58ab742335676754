//! Core traits and types for the scanner backend protocol.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::option::{ControlOutcome, OptionAction, OptionDescriptor};

/// Maximum length of a username or password handed to a backend.
pub const MAX_CREDENTIAL_LEN: usize = 128;

/// Layout of the samples delivered by one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Single-channel gray (or line-art at depth 1).
    Gray,
    /// Interleaved red, green, blue.
    Rgb,
    /// Red band of a multi-frame image.
    Red,
    /// Green band of a multi-frame image.
    Green,
    /// Blue band of a multi-frame image.
    Blue,
}

impl FrameFormat {
    /// Band offset for single-color frames (red = 0, green = 1, blue = 2).
    pub const fn band_offset(self) -> Option<usize> {
        match self {
            Self::Red => Some(0),
            Self::Green => Some(1),
            Self::Blue => Some(2),
            Self::Gray | Self::Rgb => None,
        }
    }

    /// Whether the frame carries only one color of a composed image.
    pub const fn is_band(self) -> bool {
        self.band_offset().is_some()
    }

    /// Whether the composed image is a color image.
    pub const fn is_color(self) -> bool {
        !matches!(self, Self::Gray)
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gray => "gray",
            Self::Rgb => "RGB",
            Self::Red => "red",
            Self::Green => "green",
            Self::Blue => "blue",
        };
        f.write_str(name)
    }
}

/// Capture parameters of the current or upcoming frame.
///
/// An estimate before `start`; exact from `start` until the frame ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    /// Sample layout.
    pub format: FrameFormat,
    /// Whether this is the last frame of the image.
    pub last_frame: bool,
    /// Bytes per scan line.
    pub bytes_per_line: usize,
    /// Pixels per scan line.
    pub pixels_per_line: usize,
    /// Number of lines, `None` when unknown until end-of-frame.
    pub lines: Option<usize>,
    /// Bits per sample (1, 8 or 16).
    pub depth: u32,
}

impl Parameters {
    /// Bytes per sample for buffering purposes (1 for depths up to 8).
    pub const fn sample_size(&self) -> usize {
        if self.depth > 8 {
            2
        } else {
            1
        }
    }

    /// Minimum bytes per line the geometry needs.
    pub const fn min_bytes_per_line(&self) -> usize {
        let channels = if matches!(self.format, FrameFormat::Rgb) {
            3
        } else {
            1
        };
        // saturates so absurd device geometry fails the consistency check
        channels * self.pixels_per_line.saturating_mul(self.depth as usize).div_ceil(8)
    }

    /// Whether depth and line size are coherent.
    pub const fn is_consistent(&self) -> bool {
        matches!(self.depth, 1 | 8 | 16) && self.bytes_per_line >= self.min_bytes_per_line()
    }
}

/// Outcome of a successful `read` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were placed at the start of the buffer. Zero only
    /// happens in non-blocking mode.
    Data(usize),
    /// The current frame has ended.
    EndOfFrame,
}

/// A device as reported by backend enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Unique name used to open the device.
    pub name: String,
    /// Manufacturer.
    pub vendor: String,
    /// Model name.
    pub model: String,
    /// Device type (`flatbed scanner`, `video camera`, ...).
    pub kind: String,
}

/// Backend version reported by `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major version; changes break compatibility.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
}

impl Version {
    /// Packed version code (`major << 24 | minor << 16 | build`).
    pub const fn code(self) -> u32 {
        ((self.major as u32) << 24) | ((self.minor as u32) << 16) | self.build as u32
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Credentials returned by an authorization callback.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username, at most [`MAX_CREDENTIAL_LEN`] bytes.
    pub username: String,
    /// Password, at most [`MAX_CREDENTIAL_LEN`] bytes.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

type AuthFn = dyn Fn(&str) -> Option<Credentials> + Send + Sync;

/// Authorization callback handed to a backend at initialization.
///
/// The backend calls [`Authorizer::authorize`] with a resource name when a
/// device requires credentials.
#[derive(Clone)]
pub struct Authorizer {
    callback: Arc<AuthFn>,
}

impl Authorizer {
    /// Wrap a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str) -> Option<Credentials> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Ask for credentials for `resource`, truncated to the protocol bounds.
    pub fn authorize(&self, resource: &str) -> Option<Credentials> {
        (self.callback)(resource).map(|creds| Credentials {
            username: truncate(creds.username, MAX_CREDENTIAL_LEN),
            password: truncate(creds.password, MAX_CREDENTIAL_LEN),
        })
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Authorizer")
    }
}

fn truncate(mut value: String, max: usize) -> String {
    if value.len() > max {
        let mut end = max;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}

/// Cancellation flag shared between a device handle and whoever wants to
/// abort its acquisition.
///
/// Cancelling only sets an atomic flag, so it never blocks and can be
/// called from any thread while a blocking read is outstanding.
#[derive(Debug, Clone, Default)]
pub struct Canceller {
    flag: Arc<AtomicBool>,
}

impl Canceller {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the soonest possible abort.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a cancel is pending.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

/// Abstraction over a scanner backend.
pub trait Backend: Send + Sync {
    /// Handle type returned by `open`.
    type Handle: DeviceHandle;

    /// Initialize the backend. Failure is fatal.
    fn initialize(&self, auth: Option<Authorizer>) -> Result<Version>;

    /// List available devices.
    fn devices(&self, local_only: bool) -> Result<Vec<DeviceInfo>>;

    /// Open a device by its exact name.
    fn open(&self, name: &str) -> Result<Self::Handle>;

    /// Release all backend resources.
    fn exit(&self);
}

/// Abstraction over one opened device.
pub trait DeviceHandle: Send {
    /// Descriptor of option `index`, `None` past the last option.
    fn option_descriptor(&self, index: usize) -> Option<&OptionDescriptor>;

    /// Get, set or auto-select an option value.
    fn control_option(&mut self, index: usize, action: OptionAction) -> Result<ControlOutcome>;

    /// Current capture parameters.
    fn parameters(&self) -> Result<Parameters>;

    /// Start acquiring the next frame.
    fn start(&mut self) -> Result<()>;

    /// Read up to `buf.len()` bytes of the current frame.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus>;

    /// Flag observed by the handle; setting it aborts the acquisition.
    ///
    /// Only [`DeviceHandle::reset`] clears it; `start` must leave a raised
    /// flag alone so the next read reports the cancel.
    fn canceller(&self) -> Canceller;

    /// Abandon the current image: drop any frame in flight, rewind a
    /// multi-frame sequence to its first frame and clear the cancel flag.
    fn reset(&mut self);

    /// Switch between blocking and non-blocking reads.
    fn set_io_mode(&mut self, non_blocking: bool) -> Result<()>;

    /// Release the device.
    fn close(&mut self);
}
