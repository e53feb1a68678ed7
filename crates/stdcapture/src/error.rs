//! Capture error taxonomy.
//!
//! Transient OS conditions (`EINTR`, `EBUSY`, `EAGAIN`) never reach callers
//! unless a retry budget is configured and exhausted. Everything else a
//! descriptor primitive reports is surfaced as [`CaptureError::Os`].

use std::fmt;
use std::io;

use thiserror::Error;

/// The descriptor primitive that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorOp {
    Dup,
    Dup2,
    Close,
    Pipe,
    Read,
    SetUnbuffered,
}

impl DescriptorOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dup => "dup",
            Self::Dup2 => "dup2",
            Self::Close => "close",
            Self::Pipe => "pipe",
            Self::Read => "read",
            Self::SetUnbuffered => "setvbuf",
        }
    }
}

impl fmt::Display for DescriptorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// A primitive failed with a non-transient errno.
    #[error("{op} failed: {}", io::Error::from_raw_os_error(*errno))]
    Os { op: DescriptorOp, errno: i32 },
    /// A primitive kept failing transiently past the configured retry budget.
    #[error(
        "{op} still failing after {attempts} attempts: {}",
        io::Error::from_raw_os_error(*errno)
    )]
    RetriesExhausted {
        op: DescriptorOp,
        errno: i32,
        attempts: u32,
    },
}

impl CaptureError {
    #[must_use]
    pub fn op(&self) -> DescriptorOp {
        match self {
            Self::Os { op, .. } | Self::RetriesExhausted { op, .. } => *op,
        }
    }

    /// Raw OS error number of the last failed attempt.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Os { errno, .. } | Self::RetriesExhausted { errno, .. } => *errno,
        }
    }
}

impl From<CaptureError> for io::Error {
    fn from(err: CaptureError) -> Self {
        let kind = io::Error::from_raw_os_error(err.errno()).kind();
        io::Error::new(kind, err)
    }
}
