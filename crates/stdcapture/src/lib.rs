//! # stdcapture
//!
//! Capture everything the process writes to stdout and stderr, from Rust or
//! from C, by redirecting both descriptors into an OS pipe.
//!
//! ```no_run
//! stdcapture::init()?;
//! stdcapture::begin_capture(stdcapture::DEFAULT_PIPE_HINT)?;
//! println!("hidden");
//! stdcapture::end_capture()?;
//! assert_eq!(stdcapture::capture(), "hidden\n");
//! # Ok::<(), stdcapture::CaptureError>(())
//! ```
//!
//! Layers, bottom-up:
//! - [`backend`]: raw OS descriptor calls, one implementation per platform.
//! - [`retry`]: the same calls, repeated on transient errno values.
//! - [`controller`]: the `Idle <-> Capturing` state machine.
//!
//! The free functions operate on one process-wide controller, [`global`].

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod retry;

use std::sync::OnceLock;

pub use backend::{DescriptorBackend, RawFd, SystemBackend};
pub use config::{CaptureConfig, DEFAULT_PIPE_HINT, DEFAULT_READ_CHUNK};
pub use controller::{CaptureController, CaptureGuard};
pub use error::{CaptureError, DescriptorOp};
pub use metrics::{CaptureMetrics, MetricsSnapshot};
pub use retry::RetryPolicy;

static GLOBAL: OnceLock<CaptureController> = OnceLock::new();

/// The process-wide controller, configured from the environment on first use.
pub fn global() -> &'static CaptureController {
    GLOBAL.get_or_init(CaptureController::new)
}

/// Unbuffer the C-level stdout and stderr. Call once before capturing.
pub fn init() -> Result<(), CaptureError> {
    global().initialize()
}

/// Start capturing stdout and stderr. No-op if already capturing.
pub fn begin_capture(buffer_size_hint: usize) -> Result<(), CaptureError> {
    global().begin(buffer_size_hint)
}

#[must_use]
pub fn is_capturing() -> bool {
    global().is_capturing()
}

/// Restore stdout and stderr and collect what was written. No-op if idle.
pub fn end_capture() -> Result<(), CaptureError> {
    global().end()
}

/// Text of the last completed capture.
#[must_use]
pub fn capture() -> String {
    global().capture()
}
