//! Session state machine: backend lifecycle and per-device call ordering.
//!
//! [`Runtime`] owns a backend and sequences `init`, `open` and `terminate`.
//! Every [`Session`] borrows the runtime, so `terminate` (which needs
//! `&mut`) can only run once all sessions have been closed or dropped.

use tracing::{debug, info, warn};

use crate::error::{Result, ScanError};
use crate::option::{
    names, Capabilities, ControlOutcome, Info, OptionAction, OptionDescriptor, OptionValue,
};
use crate::traits::{
    Authorizer, Backend, Canceller, DeviceHandle, DeviceInfo, Parameters, ReadStatus, Version,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuntimeState {
    Uninitialized,
    Initialized(Version),
}

/// Owner of one backend instance.
pub struct Runtime<B: Backend> {
    backend: B,
    state: RuntimeState,
}

impl<B: Backend> Runtime<B> {
    /// Wrap a backend. Call [`Runtime::init`] before anything else.
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            state: RuntimeState::Uninitialized,
        }
    }

    /// Initialize the backend.
    ///
    /// Fails if already initialized; a backend failure is fatal
    /// ([`ScanError::is_fatal`]).
    pub fn init(&mut self, auth: Option<Authorizer>) -> Result<Version> {
        if let RuntimeState::Initialized(_) = self.state {
            return Err(ScanError::InvalidState {
                operation: "init",
                state: "initialized",
            });
        }

        let version = self.backend.initialize(auth).map_err(|err| match err {
            ScanError::Init { .. } => err,
            other => ScanError::Init {
                reason: other.to_string(),
            },
        })?;
        info!(%version, "Backend initialized");
        self.state = RuntimeState::Initialized(version);
        Ok(version)
    }

    /// Version reported by the backend, if initialized.
    pub const fn version(&self) -> Option<Version> {
        match self.state {
            RuntimeState::Initialized(version) => Some(version),
            RuntimeState::Uninitialized => None,
        }
    }

    fn ensure_initialized(&self, operation: &'static str) -> Result<()> {
        match self.state {
            RuntimeState::Initialized(_) => Ok(()),
            RuntimeState::Uninitialized => Err(ScanError::InvalidState {
                operation,
                state: "uninitialized",
            }),
        }
    }

    /// List devices known to the backend.
    pub fn devices(&self, local_only: bool) -> Result<Vec<DeviceInfo>> {
        self.ensure_initialized("devices")?;
        let devices = self.backend.devices(local_only)?;
        debug!(count = devices.len(), "Enumerated devices");
        Ok(devices)
    }

    /// Open a device. An empty name opens the first available device.
    pub fn open(&self, name: &str) -> Result<Session<'_, B::Handle>> {
        self.ensure_initialized("open")?;

        let name = if name.is_empty() {
            self.backend
                .devices(false)?
                .into_iter()
                .next()
                .map(|dev| dev.name)
                .ok_or_else(|| ScanError::invalid("no devices available"))?
        } else {
            name.to_owned()
        };

        let handle = self.backend.open(&name)?;
        info!(device = %name, "Device opened");
        Ok(Session::new(name, handle))
    }

    /// Release all backend resources. Only `init` is legal afterwards.
    pub fn terminate(&mut self) {
        if let RuntimeState::Initialized(_) = self.state {
            self.backend.exit();
            self.state = RuntimeState::Uninitialized;
            info!("Backend terminated");
        }
    }

    /// Access the wrapped backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: Backend> Drop for Runtime<B> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Where a session is in its call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Open and idle; no option has been set yet.
    Opened,
    /// Open and idle with at least one option set.
    Configured,
    /// A frame is being acquired.
    Acquiring,
    /// Cancel requested; waiting for a read to confirm it.
    Cancelling,
    /// Closed; no operation is legal.
    Closed,
}

impl SessionState {
    const fn name(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Configured => "configured",
            Self::Acquiring => "acquiring",
            Self::Cancelling => "cancelling",
            Self::Closed => "closed",
        }
    }

    const fn is_idle(self) -> bool {
        matches!(self, Self::Opened | Self::Configured)
    }
}

/// Color modes offered by a device's `mode` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorModes(pub u32);

impl ColorModes {
    /// `Color` is offered.
    pub const COLOR: Self = Self(1 << 0);
    /// `Gray` is offered.
    pub const GRAY: Self = Self(1 << 1);
    /// `Lineart` is offered.
    pub const LINEART: Self = Self(1 << 2);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One opened device.
///
/// Calls are checked against the session state; anything the protocol
/// forbids in the current state fails with [`ScanError::InvalidState`]
/// before reaching the backend.
pub struct Session<'rt, H: DeviceHandle> {
    name: String,
    handle: H,
    state: SessionState,
    canceller: Canceller,
    non_blocking: bool,
    reload_options: bool,
    cached_params: Option<Parameters>,
    // the frame being read is the last of its image
    frame_is_last: bool,
    // a multi-frame image is partway through its frames
    in_sequence: bool,
    // the flag was raised by the session after a failed read
    self_cancelled: bool,
    // cancel already applied to the device; the next read reports it
    confirm_cancel: bool,
    _runtime: std::marker::PhantomData<&'rt ()>,
}

impl<H: DeviceHandle> Session<'_, H> {
    fn new(name: String, handle: H) -> Self {
        let canceller = handle.canceller();
        Self {
            name,
            handle,
            state: SessionState::Opened,
            canceller,
            non_blocking: false,
            reload_options: false,
            cached_params: None,
            frame_is_last: true,
            in_sequence: false,
            self_cancelled: false,
            confirm_cancel: false,
            _runtime: std::marker::PhantomData,
        }
    }

    /// Device name the session was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether reads are non-blocking.
    pub const fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    /// Whether a multi-frame image has frames still to come.
    pub const fn in_sequence(&self) -> bool {
        self.in_sequence
    }

    /// Whether descriptors changed since they were last fetched.
    ///
    /// Set by a reload-options info bit or a start rejected as invalid;
    /// cleared by [`Session::descriptors`].
    pub const fn needs_reload(&self) -> bool {
        self.reload_options
    }

    fn reject(&self, operation: &'static str) -> ScanError {
        ScanError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(self.reject(operation));
        }
        Ok(())
    }

    /// Number of options, including option 0.
    pub fn option_count(&mut self) -> Result<usize> {
        match self.control(0, OptionAction::Get)?.value {
            OptionValue::Int(count) => usize::try_from(count)
                .map_err(|_| ScanError::invalid(format!("negative option count {count}"))),
            other => Err(ScanError::invalid(format!(
                "option count has type {:?}",
                other.value_type()
            ))),
        }
    }

    /// Descriptor for option `index`.
    pub fn descriptor(&self, index: usize) -> Option<&OptionDescriptor> {
        if self.state == SessionState::Closed {
            return None;
        }
        self.handle.option_descriptor(index)
    }

    /// Fresh copies of all descriptors; clears the reload flag.
    pub fn descriptors(&mut self) -> Result<Vec<OptionDescriptor>> {
        let count = self.option_count()?;
        let descriptors = (0..count)
            .map(|index| {
                self.handle
                    .option_descriptor(index)
                    .cloned()
                    .ok_or_else(|| ScanError::invalid(format!("option {index} of {count} missing")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.reload_options = false;
        Ok(descriptors)
    }

    /// Find an option by its name, returning its index and descriptor.
    pub fn find_option(&mut self, name: &str) -> Result<Option<(usize, OptionDescriptor)>> {
        let count = self.option_count()?;
        Ok((1..count).find_map(|index| {
            self.handle
                .option_descriptor(index)
                .filter(|desc| desc.name == name)
                .map(|desc| (index, desc.clone()))
        }))
    }

    /// Get, set or auto-select an option.
    ///
    /// Setting requires an idle session and an active, settable option.
    /// Reload bits in the returned info invalidate cached descriptors and
    /// parameters.
    pub fn control(&mut self, index: usize, action: OptionAction) -> Result<ControlOutcome> {
        self.ensure_open("control option")?;
        if !matches!(action, OptionAction::Get) {
            if !self.state.is_idle() {
                return Err(self.reject("set option"));
            }
            let desc = self
                .handle
                .option_descriptor(index)
                .ok_or_else(|| ScanError::invalid(format!("no option {index}")))?;
            if !desc.is_active() || !desc.is_settable() {
                return Err(ScanError::invalid(format!(
                    "option '{}' is not settable",
                    desc.name
                )));
            }
            if matches!(action, OptionAction::Auto) && !desc.cap.contains(Capabilities::AUTOMATIC) {
                return Err(ScanError::invalid(format!(
                    "option '{}' has no automatic mode",
                    desc.name
                )));
            }
        }

        let is_set = !matches!(action, OptionAction::Get);
        let outcome = self.handle.control_option(index, action)?;
        if is_set {
            self.state = SessionState::Configured;
            self.note_info(index, outcome.info);
        }
        Ok(outcome)
    }

    fn note_info(&mut self, index: usize, info: Info) {
        if info.contains(Info::INEXACT) {
            warn!(option = index, "Value was rounded by the device");
        }
        if info.contains(Info::RELOAD_OPTIONS) {
            debug!(option = index, "Option descriptors must be reloaded");
            self.reload_options = true;
        }
        if info.contains(Info::RELOAD_PARAMS) {
            debug!(option = index, "Parameters must be reloaded");
            self.cached_params = None;
        }
    }

    /// Read an option value.
    pub fn get_value(&mut self, index: usize) -> Result<OptionValue> {
        Ok(self.control(index, OptionAction::Get)?.value)
    }

    /// Store an option value.
    pub fn set_value(&mut self, index: usize, value: OptionValue) -> Result<ControlOutcome> {
        self.control(index, OptionAction::Set(value))
    }

    /// Let the device choose an option value.
    pub fn set_auto(&mut self, index: usize) -> Result<ControlOutcome> {
        self.control(index, OptionAction::Auto)
    }

    /// Set an option by name. Returns `Ok(None)` when the device has no
    /// such option or it is inactive.
    pub fn set_by_name(&mut self, name: &str, value: OptionValue) -> Result<Option<ControlOutcome>> {
        match self.find_option(name)? {
            Some((index, desc)) if desc.is_active() => {
                debug!(option = name, %value, "Setting option");
                self.set_value(index, value).map(Some)
            }
            _ => {
                debug!(option = name, "Option not available");
                Ok(None)
            }
        }
    }

    /// Color modes offered by the device's `mode` option.
    pub fn color_modes(&mut self) -> Result<ColorModes> {
        let mut modes = ColorModes::default();
        if let Some((_, desc)) = self.find_option(names::MODE)? {
            if let crate::option::Constraint::StringList(list) = &desc.constraint {
                for mode in list {
                    match mode.as_str() {
                        "Color" => modes.0 |= ColorModes::COLOR.0,
                        "Gray" => modes.0 |= ColorModes::GRAY.0,
                        "Lineart" => modes.0 |= ColorModes::LINEART.0,
                        _ => {}
                    }
                }
            }
        }
        Ok(modes)
    }

    /// Capture parameters: an estimate while idle, exact while acquiring.
    pub fn parameters(&mut self) -> Result<Parameters> {
        self.ensure_open("get parameters")?;
        if let Some(params) = self.cached_params {
            return Ok(params);
        }
        let params = self.handle.parameters()?;
        if !params.is_consistent() {
            return Err(ScanError::invalid(format!(
                "inconsistent parameters: {params:?}"
            )));
        }
        if self.state == SessionState::Acquiring {
            self.cached_params = Some(params);
        }
        Ok(params)
    }

    /// Start acquiring the next frame.
    ///
    /// A cancel requested through the [`Canceller`] while a multi-frame
    /// image is between frames is honored here: the sequence is abandoned
    /// and the next read reports [`ScanError::Cancelled`]. A request made
    /// with no image in flight is stale and dropped.
    pub fn start(&mut self) -> Result<()> {
        if !self.state.is_idle() {
            return Err(self.reject("start"));
        }

        if self.self_cancelled {
            self.self_cancelled = false;
            self.handle.reset();
        } else if self.canceller.is_cancelled() {
            if self.in_sequence {
                info!(device = %self.name, "Cancel requested between frames");
                self.abandon_sequence();
                self.confirm_cancel = true;
                self.state = SessionState::Cancelling;
                return Ok(());
            }
            debug!(device = %self.name, "Dropping cancel request made while idle");
            self.canceller.take();
        }

        self.cached_params = None;
        match self.handle.start() {
            Ok(()) => {
                self.state = SessionState::Acquiring;
                self.frame_is_last = match self.handle.parameters() {
                    Ok(params) => params.last_frame,
                    Err(_) => true,
                };
                debug!(device = %self.name, last = self.frame_is_last, "Frame started");
                Ok(())
            }
            Err(err) => {
                if err.requires_reload() {
                    warn!(device = %self.name, error = %err, "Start rejected; options must be renegotiated");
                    self.reload_options = true;
                }
                if self.in_sequence {
                    warn!(device = %self.name, "Follow-up frame failed to start; abandoning image");
                    self.abandon_sequence();
                }
                Err(err)
            }
        }
    }

    fn abandon_sequence(&mut self) {
        self.handle.reset();
        self.in_sequence = false;
        self.cached_params = None;
    }

    /// Read a chunk of the current frame into `buf`.
    ///
    /// End-of-frame and errors return the session to idle. A cancelled
    /// read is reported exactly once; further reads fail until the next
    /// `start`.
    ///
    /// # Arguments
    ///
    /// * `buf` - Destination; at most `buf.len()` bytes are written
    ///
    /// # Returns
    ///
    /// * `Ok(ReadStatus::Data(n))` with `n` bytes at the start of `buf`;
    ///   `n` is zero only in non-blocking mode
    /// * `Ok(ReadStatus::EndOfFrame)` once the frame is complete
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside an acquisition, `Cancelled` once after
    /// a cancel, and any device failure unchanged. A device failure raises
    /// the cancel flag so the device aborts too.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        if !matches!(self.state, SessionState::Acquiring | SessionState::Cancelling) {
            return Err(self.reject("read"));
        }
        if self.confirm_cancel {
            info!(device = %self.name, "Acquisition cancelled");
            self.confirm_cancel = false;
            self.state = SessionState::Opened;
            return Err(ScanError::Cancelled);
        }

        match self.handle.read(buf) {
            Ok(ReadStatus::EndOfFrame) => {
                self.state = SessionState::Opened;
                self.cached_params = None;
                self.in_sequence = !self.frame_is_last;
                Ok(ReadStatus::EndOfFrame)
            }
            Ok(ReadStatus::Data(len)) => Ok(ReadStatus::Data(len)),
            Err(ScanError::Cancelled) => {
                info!(device = %self.name, "Acquisition cancelled");
                self.canceller.take();
                self.state = SessionState::Opened;
                self.cached_params = None;
                self.in_sequence = false;
                Err(ScanError::Cancelled)
            }
            Err(err) => {
                warn!(device = %self.name, error = %err, "Read failed; cancelling");
                self.canceller.cancel();
                self.self_cancelled = true;
                self.state = SessionState::Opened;
                self.cached_params = None;
                self.in_sequence = false;
                Err(err)
            }
        }
    }

    /// Request the soonest possible abort of the acquisition in flight.
    ///
    /// Between the frames of a multi-frame image the device sequence is
    /// reset at once. Either way completion is confirmed by the next read
    /// returning [`ScanError::Cancelled`]; with nothing in flight this does
    /// nothing.
    pub fn cancel(&mut self) {
        match self.state {
            SessionState::Acquiring => {
                self.canceller.cancel();
                self.state = SessionState::Cancelling;
            }
            SessionState::Opened | SessionState::Configured if self.in_sequence => {
                info!(device = %self.name, "Cancelling between frames");
                self.abandon_sequence();
                self.confirm_cancel = true;
                self.state = SessionState::Cancelling;
            }
            _ => {}
        }
    }

    /// Handle that cancels this session's acquisition from another thread.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Switch between blocking and non-blocking reads.
    pub fn set_io_mode(&mut self, non_blocking: bool) -> Result<()> {
        self.ensure_open("set io mode")?;
        self.handle.set_io_mode(non_blocking)?;
        self.non_blocking = non_blocking;
        Ok(())
    }

    /// Close the session, cancelling any acquisition in flight.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if matches!(self.state, SessionState::Acquiring | SessionState::Cancelling) {
            self.canceller.cancel();
        } else if self.in_sequence {
            self.abandon_sequence();
        }
        self.handle.close();
        self.state = SessionState::Closed;
        info!(device = %self.name, "Device closed");
    }
}

impl<H: DeviceHandle> Drop for Session<'_, H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
