//! Scan-Capture: a scanner acquisition library.
//!
//! This library drives image acquisition from scanner-like devices through a
//! backend trait, enforcing the session protocol, composing multi-frame and
//! unknown-height images, and encoding the result as PNM. A V4L2 backend
//! exposes video capture nodes as scanners; a mock backend serves tests.

pub mod acquire;
pub mod buffer;
pub mod config;
pub mod device;
pub mod encoder;
pub mod error;
pub mod mock;
pub mod option;
pub mod output;
pub mod session;
pub mod traits;
pub mod validation;

pub use acquire::{acquire, AcquireOptions, ScanSummary};
pub use config::{PaperSize, ScanConfig};
pub use device::V4l2Backend;
pub use error::{Result, ScanError};
pub use output::{apply_config, scan_to_file, ScanOutput};
pub use session::{Runtime, Session, SessionState};
pub use traits::{Backend, Canceller, DeviceHandle, FrameFormat, Parameters, ReadStatus};
