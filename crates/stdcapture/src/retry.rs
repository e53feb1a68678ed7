//! Retry-safe descriptor primitives.
//!
//! Every `dup`/`dup2`/`close`/`pipe`/`read` the controller issues goes
//! through [`Primitives`], which repeats the backend call while it fails with
//! a transient errno, sleeping [`RetryPolicy::interval`] between attempts.
//! Restoration later depends on each of these calls taking effect exactly
//! once, so a transient failure is never treated as success or as a final
//! error.

use std::thread;
use std::time::Duration;

use crate::backend::{DescriptorBackend, RawFd};
use crate::error::{CaptureError, DescriptorOp};
use crate::metrics::CaptureMetrics;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between two attempts of the same call.
    pub interval: Duration,
    /// Attempts allowed per call before giving up. `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

/// Errno values worth another attempt.
#[must_use]
pub fn is_transient(errno: i32) -> bool {
    errno == libc::EINTR || errno == libc::EBUSY || errno == libc::EAGAIN || is_would_block(errno)
}

#[cfg(unix)]
fn is_would_block(errno: i32) -> bool {
    errno == libc::EWOULDBLOCK
}

#[cfg(not(unix))]
fn is_would_block(_errno: i32) -> bool {
    false
}

/// Run `call` until it succeeds, fails permanently, or exhausts `policy`.
pub fn retry<T>(
    policy: &RetryPolicy,
    metrics: &CaptureMetrics,
    op: DescriptorOp,
    mut call: impl FnMut() -> Result<T, i32>,
) -> Result<T, CaptureError> {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match call() {
            Ok(value) => return Ok(value),
            Err(errno) if is_transient(errno) => {
                if policy.max_attempts.is_some_and(|max| attempts >= max) {
                    return Err(CaptureError::RetriesExhausted {
                        op,
                        errno,
                        attempts,
                    });
                }
                metrics.record_retry();
                if !policy.interval.is_zero() {
                    thread::sleep(policy.interval);
                }
            }
            Err(errno) => return Err(CaptureError::Os { op, errno }),
        }
    }
}

/// A backend borrowed together with the retry policy that guards it.
pub(crate) struct Primitives<'a, B> {
    pub(crate) backend: &'a mut B,
    policy: &'a RetryPolicy,
    metrics: &'a CaptureMetrics,
}

impl<'a, B: DescriptorBackend> Primitives<'a, B> {
    pub(crate) fn new(
        backend: &'a mut B,
        policy: &'a RetryPolicy,
        metrics: &'a CaptureMetrics,
    ) -> Self {
        Self {
            backend,
            policy,
            metrics,
        }
    }

    pub(crate) fn metrics(&self) -> &CaptureMetrics {
        self.metrics
    }

    pub(crate) fn pipe(&mut self, size_hint: usize) -> Result<(RawFd, RawFd), CaptureError> {
        let backend = &mut *self.backend;
        retry(self.policy, self.metrics, DescriptorOp::Pipe, || {
            backend.pipe(size_hint)
        })
    }

    pub(crate) fn dup(&mut self, fd: RawFd) -> Result<RawFd, CaptureError> {
        let backend = &mut *self.backend;
        retry(self.policy, self.metrics, DescriptorOp::Dup, || backend.dup(fd))
    }

    pub(crate) fn dup2(&mut self, src: RawFd, dst: RawFd) -> Result<(), CaptureError> {
        let backend = &mut *self.backend;
        retry(self.policy, self.metrics, DescriptorOp::Dup2, || {
            backend.dup2(src, dst)
        })
    }

    pub(crate) fn close(&mut self, fd: RawFd) -> Result<(), CaptureError> {
        let backend = &mut *self.backend;
        retry(self.policy, self.metrics, DescriptorOp::Close, || {
            backend.close(fd)
        })
    }

    pub(crate) fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, CaptureError> {
        let backend = &mut *self.backend;
        retry(self.policy, self.metrics, DescriptorOp::Read, || {
            backend.read(fd, buf)
        })
    }

    pub(crate) fn at_eof(&mut self, fd: RawFd) -> Result<bool, CaptureError> {
        let backend = &mut *self.backend;
        retry(self.policy, self.metrics, DescriptorOp::Read, || {
            backend.at_eof(fd)
        })
    }
}
