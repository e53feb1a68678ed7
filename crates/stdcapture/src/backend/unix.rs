//! POSIX descriptor backend.
//!
//! Descriptors created here (pipe ends, saved copies of stdout/stderr) are
//! close-on-exec so a child spawned mid-capture does not inherit them. The
//! write end is closed as soon as stdout/stderr point at it; once `end`
//! restores the originals, the pipe has no writers left and `read` reports
//! end-of-data instead of blocking.

use std::ffi::c_int;
use std::ptr;

use super::{DescriptorBackend, RawFd, last_errno};

#[cfg(not(any(target_vendor = "apple", target_os = "freebsd", target_os = "dragonfly")))]
unsafe extern "C" {
    #[link_name = "stdout"]
    static mut C_STDOUT: *mut libc::FILE;
    #[link_name = "stderr"]
    static mut C_STDERR: *mut libc::FILE;
}

#[cfg(any(target_vendor = "apple", target_os = "freebsd", target_os = "dragonfly"))]
unsafe extern "C" {
    #[link_name = "__stdoutp"]
    static mut C_STDOUT: *mut libc::FILE;
    #[link_name = "__stderrp"]
    static mut C_STDERR: *mut libc::FILE;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnixBackend;

impl UnixBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn check(rc: c_int) -> Result<c_int, i32> {
    if rc < 0 { Err(last_errno(libc::EIO)) } else { Ok(rc) }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_pipe() -> Result<[c_int; 2], i32> {
    let mut fds: [c_int; 2] = [-1, -1];
    // SAFETY: `fds` is a writable [c_int; 2].
    check(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(fds)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_pipe() -> Result<[c_int; 2], i32> {
    let mut fds: [c_int; 2] = [-1, -1];
    // SAFETY: `fds` is a writable [c_int; 2].
    check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    for fd in fds {
        // SAFETY: fd was just returned by pipe().
        if let Err(errno) = check(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) }) {
            // SAFETY: both ends are owned here and not yet published.
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(errno);
        }
    }
    Ok(fds)
}

/// Grow the pipe to `size_hint` bytes. Never shrinks below the kernel's
/// current capacity, and a refused resize (e.g. above
/// `/proc/sys/fs/pipe-max-size`) leaves the pipe as it is.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn apply_size_hint(write_end: c_int, size_hint: usize) {
    let Ok(wanted) = c_int::try_from(size_hint) else {
        return;
    };
    // SAFETY: F_GETPIPE_SZ/F_SETPIPE_SZ only inspect the descriptor.
    unsafe {
        let current = libc::fcntl(write_end, libc::F_GETPIPE_SZ);
        if current >= 0 && wanted > current {
            libc::fcntl(write_end, libc::F_SETPIPE_SZ, wanted);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn apply_size_hint(_write_end: c_int, _size_hint: usize) {}

impl DescriptorBackend for UnixBackend {
    const KEEPS_WRITE_END: bool = false;

    fn stdout_fd(&self) -> RawFd {
        libc::STDOUT_FILENO
    }

    fn stderr_fd(&self) -> RawFd {
        libc::STDERR_FILENO
    }

    fn set_unbuffered(&mut self) -> Result<(), i32> {
        // SAFETY: the C runtime initializes stdout/stderr before main; setvbuf
        // with a null buffer and _IONBF does not retain any Rust memory.
        let rc = unsafe {
            let out = libc::setvbuf(C_STDOUT, ptr::null_mut(), libc::_IONBF, 0);
            let err = libc::setvbuf(C_STDERR, ptr::null_mut(), libc::_IONBF, 0);
            if out != 0 { out } else { err }
        };
        if rc != 0 {
            return Err(last_errno(libc::EINVAL));
        }
        Ok(())
    }

    fn pipe(&mut self, size_hint: usize) -> Result<(RawFd, RawFd), i32> {
        let [read_end, write_end] = open_pipe()?;
        apply_size_hint(write_end, size_hint);
        Ok((read_end, write_end))
    }

    fn dup(&mut self, fd: RawFd) -> Result<RawFd, i32> {
        // SAFETY: F_DUPFD_CLOEXEC on an invalid fd fails with EBADF.
        check(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) })
    }

    fn dup2(&mut self, src: RawFd, dst: RawFd) -> Result<(), i32> {
        // SAFETY: dup2 on invalid fds fails with EBADF.
        check(unsafe { libc::dup2(src, dst) }).map(|_| ())
    }

    fn close(&mut self, fd: RawFd) -> Result<(), i32> {
        // SAFETY: the controller only closes descriptors it created.
        let rc = unsafe { libc::close(fd) };
        if rc == 0 {
            return Ok(());
        }
        let errno = last_errno(libc::EIO);
        // Linux releases the descriptor even when close() is interrupted;
        // retrying could close a number another thread has just been given.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if errno == libc::EINTR {
            return Ok(());
        }
        Err(errno)
    }

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, i32> {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(last_errno(libc::EIO))
        } else {
            Ok(n as usize)
        }
    }
}
