//! Error taxonomy shared by backends, sessions and the acquisition loop.

use thiserror::Error;

/// Error type for scanner operations.
///
/// End-of-frame is not an error; it is reported as
/// [`ReadStatus::EndOfFrame`](crate::traits::ReadStatus::EndOfFrame).
#[derive(Debug, Error)]
pub enum ScanError {
    /// Backend failed to initialize. No further backend call is defined.
    #[error("Backend initialization failed: {reason}")]
    Init {
        /// Backend-supplied detail.
        reason: String,
    },
    /// Operation is not supported by the device or backend.
    #[error("Operation not supported")]
    Unsupported,
    /// Operation was cancelled.
    #[error("Operation was cancelled")]
    Cancelled,
    /// Device is busy; try again later.
    #[error("Device busy")]
    DeviceBusy,
    /// Data or argument is invalid (includes unknown device at open).
    #[error("Invalid argument: {reason}")]
    Invalid {
        /// What was rejected.
        reason: String,
    },
    /// Call made in a session state that does not allow it.
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// State the session or runtime was in.
        state: &'static str,
    },
    /// Document feeder jammed.
    #[error("Document feeder jammed")]
    Jammed,
    /// Document feeder out of documents.
    #[error("Document feeder out of documents")]
    NoDocs,
    /// Scanner cover is open.
    #[error("Scanner cover is open")]
    CoverOpen,
    /// Error during device I/O.
    #[error("Device I/O error: {reason}")]
    Io {
        /// Backend-supplied detail.
        reason: String,
    },
    /// Out of memory.
    #[error("Out of memory")]
    NoMem,
    /// Access to the resource has been denied.
    #[error("Access to resource has been denied")]
    AccessDenied,
    /// Local output file could not be written.
    #[error("Output error: {0}")]
    Output(#[from] std::io::Error),
}

impl ScanError {
    /// Shorthand for [`ScanError::Invalid`].
    pub fn invalid<S: Into<String>>(reason: S) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`ScanError::Io`].
    pub fn io<S: Into<String>>(reason: S) -> Self {
        Self::Io {
            reason: reason.into(),
        }
    }

    /// Whether the error leaves the backend in an undefined state.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Init { .. })
    }

    /// Whether the caller must re-read option descriptors before retrying.
    ///
    /// A start rejected as invalid means the current option set cannot be
    /// scanned with, which is treated like a reload-options signal.
    pub const fn requires_reload(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }
}

/// Result type for scanner operations.
pub type Result<T> = std::result::Result<T, ScanError>;
