//! MSVCRT descriptor backend.
//!
//! The CRT pipe is created in binary mode so no `\n` -> `\r\n` translation
//! happens on the way through. Its write end stays open for the whole
//! session and is closed by `end`; reads are guarded by `_eof` because a
//! read on an empty pipe with a live writer would block.

use std::ffi::{c_int, c_uint};
use std::ptr;

use super::{DescriptorBackend, RawFd, last_errno};

const O_BINARY: c_int = 0x8000;
const IONBF: c_int = 0x0004;

unsafe extern "C" {
    fn __acrt_iob_func(index: c_uint) -> *mut libc::FILE;
    fn _eof(fd: c_int) -> c_int;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsBackend;

impl WindowsBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn check(rc: c_int) -> Result<c_int, i32> {
    if rc < 0 { Err(last_errno(libc::EIO)) } else { Ok(rc) }
}

impl DescriptorBackend for WindowsBackend {
    const KEEPS_WRITE_END: bool = true;

    fn stdout_fd(&self) -> RawFd {
        1
    }

    fn stderr_fd(&self) -> RawFd {
        2
    }

    fn set_unbuffered(&mut self) -> Result<(), i32> {
        // SAFETY: indices 1 and 2 are the CRT's stdout and stderr streams.
        let rc = unsafe {
            let out = libc::setvbuf(__acrt_iob_func(1), ptr::null_mut(), IONBF, 0);
            let err = libc::setvbuf(__acrt_iob_func(2), ptr::null_mut(), IONBF, 0);
            if out != 0 { out } else { err }
        };
        if rc != 0 {
            return Err(last_errno(libc::EINVAL));
        }
        Ok(())
    }

    fn pipe(&mut self, size_hint: usize) -> Result<(RawFd, RawFd), i32> {
        let mut fds: [c_int; 2] = [-1, -1];
        let psize = c_uint::try_from(size_hint).unwrap_or(c_uint::MAX);
        // SAFETY: `fds` is a writable [c_int; 2].
        check(unsafe { libc::pipe(fds.as_mut_ptr(), psize, O_BINARY) })?;
        Ok((fds[0], fds[1]))
    }

    fn dup(&mut self, fd: RawFd) -> Result<RawFd, i32> {
        // SAFETY: _dup on an invalid fd fails with EBADF.
        check(unsafe { libc::dup(fd) })
    }

    fn dup2(&mut self, src: RawFd, dst: RawFd) -> Result<(), i32> {
        // SAFETY: _dup2 on invalid fds fails with EBADF.
        check(unsafe { libc::dup2(src, dst) }).map(|_| ())
    }

    fn close(&mut self, fd: RawFd) -> Result<(), i32> {
        // SAFETY: the controller only closes descriptors it created.
        check(unsafe { libc::close(fd) }).map(|_| ())
    }

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, i32> {
        let len = c_uint::try_from(buf.len()).unwrap_or(c_uint::MAX);
        // SAFETY: `buf` is valid for writes of at least `len` bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), len) };
        check(n).map(|n| n as usize)
    }

    fn at_eof(&mut self, fd: RawFd) -> Result<bool, i32> {
        // SAFETY: _eof on an invalid fd returns -1 with EBADF.
        match unsafe { _eof(fd) } {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(last_errno(libc::EBADF)),
        }
    }
}
