//! In-memory descriptor table for driving the controller in unit tests.
//!
//! Models a process with two consoles on fds 1 and 2, pipes as byte queues,
//! and scripted faults that make the Nth call of a primitive fail.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{DescriptorBackend, RawFd};
use crate::error::DescriptorOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Node {
    Console(usize),
    PipeRead(usize),
    PipeWrite(usize),
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    op: DescriptorOp,
    skip: usize,
    errno: i32,
    remaining: usize,
}

#[derive(Debug)]
pub(crate) struct FakeOs {
    pub(crate) table: BTreeMap<RawFd, Node>,
    pub(crate) consoles: [Vec<u8>; 2],
    pipes: Vec<VecDeque<u8>>,
    faults: Vec<Fault>,
    pub(crate) unbuffered: bool,
    pub(crate) flushes: usize,
}

impl FakeOs {
    fn new() -> Self {
        let mut table = BTreeMap::new();
        table.insert(1, Node::Console(0));
        table.insert(2, Node::Console(1));
        Self {
            table,
            consoles: [Vec::new(), Vec::new()],
            pipes: Vec::new(),
            faults: Vec::new(),
            unbuffered: false,
            flushes: 0,
        }
    }

    /// Fail `times` calls of `op` with `errno`, after letting `skip` calls through.
    pub(crate) fn fail(&mut self, op: DescriptorOp, skip: usize, errno: i32, times: usize) {
        self.faults.push(Fault {
            op,
            skip,
            errno,
            remaining: times,
        });
    }

    /// What a process-level `write(fd, bytes)` would do.
    pub(crate) fn write(&mut self, fd: RawFd, bytes: &[u8]) {
        match self.table.get(&fd).copied() {
            Some(Node::Console(i)) => self.consoles[i].extend_from_slice(bytes),
            Some(Node::PipeWrite(p)) => self.pipes[p].extend(bytes.iter().copied()),
            other => panic!("write to fd {fd} mapped to {other:?}"),
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.table.len()
    }

    fn injected(&mut self, op: DescriptorOp) -> Result<(), i32> {
        let Some(fault) = self
            .faults
            .iter_mut()
            .find(|f| f.op == op && (f.skip > 0 || f.remaining > 0))
        else {
            return Ok(());
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        fault.remaining -= 1;
        Err(fault.errno)
    }

    fn lowest_free_fd(&self) -> RawFd {
        (3..).find(|fd| !self.table.contains_key(fd)).unwrap_or(RawFd::MAX)
    }

    fn node(&self, fd: RawFd) -> Result<Node, i32> {
        self.table.get(&fd).copied().ok_or(libc::EBADF)
    }
}

/// Backend handle; tests keep a clone of `os` to write and inspect.
/// `KEEP` mirrors platforms that hold the pipe's write end for the session.
#[derive(Debug, Clone)]
pub(crate) struct FakeBackend<const KEEP: bool = false> {
    pub(crate) os: Arc<Mutex<FakeOs>>,
}

impl<const KEEP: bool> FakeBackend<KEEP> {
    pub(crate) fn new() -> Self {
        Self {
            os: Arc::new(Mutex::new(FakeOs::new())),
        }
    }
}

impl<const KEEP: bool> DescriptorBackend for FakeBackend<KEEP> {
    const KEEPS_WRITE_END: bool = KEEP;

    fn stdout_fd(&self) -> RawFd {
        1
    }

    fn stderr_fd(&self) -> RawFd {
        2
    }

    fn set_unbuffered(&mut self) -> Result<(), i32> {
        let mut os = self.os.lock();
        os.injected(DescriptorOp::SetUnbuffered)?;
        os.unbuffered = true;
        Ok(())
    }

    fn flush_std_streams(&mut self) {
        self.os.lock().flushes += 1;
    }

    fn pipe(&mut self, _size_hint: usize) -> Result<(RawFd, RawFd), i32> {
        let mut os = self.os.lock();
        os.injected(DescriptorOp::Pipe)?;
        let id = os.pipes.len();
        os.pipes.push(VecDeque::new());
        let read_end = os.lowest_free_fd();
        os.table.insert(read_end, Node::PipeRead(id));
        let write_end = os.lowest_free_fd();
        os.table.insert(write_end, Node::PipeWrite(id));
        Ok((read_end, write_end))
    }

    fn dup(&mut self, fd: RawFd) -> Result<RawFd, i32> {
        let mut os = self.os.lock();
        os.injected(DescriptorOp::Dup)?;
        let node = os.node(fd)?;
        let copy = os.lowest_free_fd();
        os.table.insert(copy, node);
        Ok(copy)
    }

    fn dup2(&mut self, src: RawFd, dst: RawFd) -> Result<(), i32> {
        let mut os = self.os.lock();
        os.injected(DescriptorOp::Dup2)?;
        let node = os.node(src)?;
        os.table.insert(dst, node);
        Ok(())
    }

    fn close(&mut self, fd: RawFd) -> Result<(), i32> {
        let mut os = self.os.lock();
        os.injected(DescriptorOp::Close)?;
        os.table.remove(&fd).map(|_| ()).ok_or(libc::EBADF)
    }

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, i32> {
        let mut os = self.os.lock();
        os.injected(DescriptorOp::Read)?;
        let Node::PipeRead(id) = os.node(fd)? else {
            return Err(libc::EBADF);
        };
        let queue = &mut os.pipes[id];
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn at_eof(&mut self, fd: RawFd) -> Result<bool, i32> {
        let os = self.os.lock();
        let Node::PipeRead(id) = os.node(fd)? else {
            return Err(libc::EBADF);
        };
        Ok(os.pipes[id].is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_skip_then_fail_then_clear() {
        let mut backend = FakeBackend::<false>::new();
        backend.os.lock().fail(DescriptorOp::Dup, 1, libc::EINTR, 1);
        assert!(backend.dup(1).is_ok());
        assert_eq!(backend.dup(1), Err(libc::EINTR));
        assert!(backend.dup(1).is_ok());
    }

    #[test]
    fn writes_follow_the_descriptor_table() {
        let mut backend = FakeBackend::<false>::new();
        let (read_end, write_end) = backend.pipe(0).unwrap();
        backend.dup2(write_end, 1).unwrap();
        backend.os.lock().write(1, b"piped");
        backend.os.lock().write(2, b"console");

        let mut buf = [0u8; 16];
        let n = backend.read(read_end, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"piped");
        assert_eq!(backend.os.lock().consoles[1], b"console");
    }
}
