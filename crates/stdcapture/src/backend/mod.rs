//! Descriptor backend.
//!
//! The OS operations the controller needs, behind one trait so the
//! controller itself stays platform-neutral. The implementation for the
//! build target is exported as [`SystemBackend`].
//!
//! Every fallible method returns the raw errno on failure and performs a
//! single attempt; retrying is the caller's job (see [`crate::retry`]).

use std::ffi::c_int;
use std::io::Write;

#[cfg(unix)]
#[allow(unsafe_code)]
mod unix;
#[cfg(windows)]
#[allow(unsafe_code)]
mod windows;

#[cfg(test)]
pub(crate) mod fake;

#[cfg(unix)]
pub use unix::UnixBackend;
#[cfg(windows)]
pub use windows::WindowsBackend;

/// Backend for the current build target.
#[cfg(unix)]
pub type SystemBackend = UnixBackend;
/// Backend for the current build target.
#[cfg(windows)]
pub type SystemBackend = WindowsBackend;

/// OS descriptor number.
pub type RawFd = c_int;

pub trait DescriptorBackend: Send {
    /// The pipe's write end has to stay open until the session ends
    /// (closing it early loses in-flight data on this platform).
    const KEEPS_WRITE_END: bool;

    fn stdout_fd(&self) -> RawFd;

    fn stderr_fd(&self) -> RawFd;

    /// Switch the C-level stdout and stderr streams to unbuffered mode.
    fn set_unbuffered(&mut self) -> Result<(), i32>;

    /// Push anything held in Rust's own stdout/stderr buffers down to the
    /// descriptors. Only called while stdout still points at its original
    /// target: with the pipe installed, the flush can wait forever on a
    /// writer blocked on the full pipe.
    fn flush_std_streams(&mut self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }

    /// Create a pipe, returning `(read_end, write_end)`. `size_hint` is the
    /// requested capacity; backends that cannot resize pipes ignore it.
    fn pipe(&mut self, size_hint: usize) -> Result<(RawFd, RawFd), i32>;

    fn dup(&mut self, fd: RawFd) -> Result<RawFd, i32>;

    /// Make `dst` refer to the same open file as `src`.
    fn dup2(&mut self, src: RawFd, dst: RawFd) -> Result<(), i32>;

    fn close(&mut self, fd: RawFd) -> Result<(), i32>;

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, i32>;

    /// Whether `fd` has no more data to read. Backends whose `read` already
    /// reports end-of-data without blocking keep the default.
    fn at_eof(&mut self, _fd: RawFd) -> Result<bool, i32> {
        Ok(false)
    }
}

/// errno of the last failed libc call, `fallback` when the OS reported none.
pub(crate) fn last_errno(fallback: i32) -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .filter(|&e| e != 0)
        .unwrap_or(fallback)
}
