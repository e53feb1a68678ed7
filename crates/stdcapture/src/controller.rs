//! The capture controller.
//!
//! State machine `Idle -> Capturing -> Idle`. All state sits behind one
//! mutex and every public operation takes it, so no caller ever observes a
//! half-done redirection.
//!
//! `begin` creates a pipe, saves duplicates of stdout and stderr, and points
//! both at the pipe's write end. Nothing reads the pipe while capturing: the
//! written bytes wait in the pipe until `end` restores the originals and
//! drains it. A capture bigger than the pipe's capacity therefore blocks the
//! writer; pass a larger size hint to `begin` for big captures.
//!
//! A write still in flight on another thread at the moment `end` restores the
//! streams may land in either destination.

use parking_lot::Mutex;

use crate::backend::{DescriptorBackend, RawFd, SystemBackend};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, DescriptorOp};
use crate::metrics::{CaptureMetrics, MetricsSnapshot};
use crate::retry::Primitives;

/// Descriptors owned by an open capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Session {
    saved_stdout: RawFd,
    saved_stderr: RawFd,
    read_end: RawFd,
    /// Only kept on backends with `KEEPS_WRITE_END`.
    write_end: Option<RawFd>,
}

impl Session {
    fn owned_fds(&self) -> impl Iterator<Item = RawFd> {
        [self.saved_stdout, self.saved_stderr, self.read_end]
            .into_iter()
            .chain(self.write_end)
    }
}

struct State<B> {
    backend: B,
    initialized: bool,
    session: Option<Session>,
    captured: Vec<u8>,
}

/// Redirects the process's stdout and stderr into a pipe and collects what
/// was written.
///
/// Standard streams are process-global, so every controller over the real
/// [`SystemBackend`] competes for the same two descriptors. Use one per
/// process, normally [`crate::global`].
pub struct CaptureController<B: DescriptorBackend = SystemBackend> {
    state: Mutex<State<B>>,
    config: CaptureConfig,
    metrics: CaptureMetrics,
}

impl CaptureController<SystemBackend> {
    /// Controller over the platform backend, configured from the environment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CaptureConfig::from_env())
    }

    #[must_use]
    pub fn with_config(config: CaptureConfig) -> Self {
        Self::with_backend(SystemBackend::default(), config)
    }
}

impl Default for CaptureController<SystemBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: DescriptorBackend> CaptureController<B> {
    pub fn with_backend(backend: B, config: CaptureConfig) -> Self {
        Self {
            state: Mutex::new(State {
                backend,
                initialized: false,
                session: None,
                captured: Vec::new(),
            }),
            config,
            metrics: CaptureMetrics::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &CaptureMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Make the C-level stdout and stderr unbuffered so every write reaches
    /// its descriptor immediately, on whichever side of a redirection it
    /// happens. Call once before the first capture; repeating is harmless.
    pub fn initialize(&self) -> Result<(), CaptureError> {
        let mut state = self.state.lock();
        state
            .backend
            .set_unbuffered()
            .map_err(|errno| CaptureError::Os {
                op: DescriptorOp::SetUnbuffered,
                errno,
            })?;
        state.initialized = true;
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Start capturing with the configured default pipe hint.
    pub fn begin_default(&self) -> Result<(), CaptureError> {
        self.begin(self.config.default_pipe_hint)
    }

    /// Start capturing. No-op while already capturing.
    ///
    /// `buffer_size_hint` is the requested pipe capacity. On Linux it only
    /// ever grows the pipe: a hint below the kernel's current capacity
    /// (normally 64 KiB) is ignored, and a hint above
    /// `/proc/sys/fs/pipe-max-size` leaves the pipe unchanged. Windows passes
    /// it to `_pipe`; other platforms ignore it.
    ///
    /// On error nothing stays redirected and no descriptor is leaked.
    pub fn begin(&self, buffer_size_hint: usize) -> Result<(), CaptureError> {
        self.begin_session(buffer_size_hint).map(|_| ())
    }

    /// Returns whether this call opened the session.
    fn begin_session(&self, buffer_size_hint: usize) -> Result<bool, CaptureError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.session.is_some() {
            self.metrics.record_redundant_begin();
            return Ok(false);
        }

        state.backend.flush_std_streams();
        let mut ops = Primitives::new(&mut state.backend, &self.config.retry, &self.metrics);
        let session = open_session(&mut ops, buffer_size_hint)?;
        state.session = Some(session);
        self.metrics.record_begin();
        Ok(true)
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Stop capturing: restore stdout and stderr, then move everything queued
    /// in the pipe into the capture buffer. No-op while idle, in which case
    /// the previous capture is left untouched.
    ///
    /// If a stream cannot be restored the session stays open and `end` may be
    /// called again. Once both are restored the session is always released.
    ///
    /// Rust's stdout is line buffered and is not flushed here; text written
    /// with `print!` and no trailing newline must be flushed by the caller
    /// before `end` to be captured.
    pub fn end(&self) -> Result<(), CaptureError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(session) = state.session else {
            self.metrics.record_redundant_end();
            return Ok(());
        };

        state.captured.clear();
        // No flush here: a writer blocked on the full pipe holds Rust's stdout
        // lock, and only the drain below can release it.
        let mut ops = Primitives::new(&mut state.backend, &self.config.retry, &self.metrics);
        let stdout_fd = ops.backend.stdout_fd();
        let stderr_fd = ops.backend.stderr_fd();
        ops.dup2(session.saved_stdout, stdout_fd)?;
        ops.dup2(session.saved_stderr, stderr_fd)?;
        state.session = None;

        let drained = drain(
            &mut ops,
            session.read_end,
            self.config.read_chunk,
            &mut state.captured,
        );
        let released = release(&mut ops, &session);
        self.metrics.record_end();
        drained.and(released)
    }

    /// The last completed capture as text. Invalid UTF-8 is replaced.
    #[must_use]
    pub fn capture(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().captured).into_owned()
    }

    /// The last completed capture as raw bytes.
    #[must_use]
    pub fn capture_bytes(&self) -> Vec<u8> {
        self.state.lock().captured.clone()
    }

    /// Begin a capture that ends when the returned guard is dropped.
    ///
    /// A guard taken while a capture is already running does not own it and
    /// leaves it running when dropped.
    pub fn scoped(&self, buffer_size_hint: usize) -> Result<CaptureGuard<'_, B>, CaptureError> {
        let owns_session = self.begin_session(buffer_size_hint)?;
        Ok(CaptureGuard {
            controller: self,
            owns_session,
        })
    }
}

/// Ends its capture on drop. See [`CaptureController::scoped`].
#[must_use = "dropping the guard ends the capture immediately"]
pub struct CaptureGuard<'a, B: DescriptorBackend = SystemBackend> {
    controller: &'a CaptureController<B>,
    owns_session: bool,
}

impl<B: DescriptorBackend> CaptureGuard<'_, B> {
    #[must_use]
    pub fn owns_session(&self) -> bool {
        self.owns_session
    }

    /// End the capture (if this guard owns it) and return the captured text.
    pub fn finish(mut self) -> Result<String, CaptureError> {
        if self.owns_session {
            self.owns_session = false;
            self.controller.end()?;
        }
        Ok(self.controller.capture())
    }
}

impl<B: DescriptorBackend> Drop for CaptureGuard<'_, B> {
    fn drop(&mut self) {
        if self.owns_session {
            let _ = self.controller.end();
        }
    }
}

/// Descriptors opened or redirected so far by a `begin` in progress.
#[derive(Default)]
struct Undo {
    opened: Vec<RawFd>,
    redirected: Vec<(RawFd, RawFd)>,
}

impl Undo {
    fn unwind<B: DescriptorBackend>(self, ops: &mut Primitives<'_, B>) {
        for &(std_fd, saved) in self.redirected.iter().rev() {
            let _ = ops.dup2(saved, std_fd);
        }
        for &fd in self.opened.iter().rev() {
            let _ = ops.close(fd);
        }
    }
}

fn open_session<B: DescriptorBackend>(
    ops: &mut Primitives<'_, B>,
    buffer_size_hint: usize,
) -> Result<Session, CaptureError> {
    let mut undo = Undo::default();
    match try_open_session(ops, buffer_size_hint, &mut undo) {
        Ok(session) => Ok(session),
        Err(err) => {
            undo.unwind(ops);
            Err(err)
        }
    }
}

fn try_open_session<B: DescriptorBackend>(
    ops: &mut Primitives<'_, B>,
    buffer_size_hint: usize,
    undo: &mut Undo,
) -> Result<Session, CaptureError> {
    let stdout_fd = ops.backend.stdout_fd();
    let stderr_fd = ops.backend.stderr_fd();

    let (read_end, write_end) = ops.pipe(buffer_size_hint)?;
    undo.opened.extend([read_end, write_end]);
    let saved_stdout = ops.dup(stdout_fd)?;
    undo.opened.push(saved_stdout);
    let saved_stderr = ops.dup(stderr_fd)?;
    undo.opened.push(saved_stderr);

    ops.dup2(write_end, stdout_fd)?;
    undo.redirected.push((stdout_fd, saved_stdout));
    ops.dup2(write_end, stderr_fd)?;
    undo.redirected.push((stderr_fd, saved_stderr));

    let write_end = if B::KEEPS_WRITE_END {
        Some(write_end)
    } else {
        // stdout and stderr now hold the pipe open on their own.
        ops.close(write_end)?;
        undo.opened.retain(|&fd| fd != write_end);
        None
    };

    Ok(Session {
        saved_stdout,
        saved_stderr,
        read_end,
        write_end,
    })
}

/// Read `read_end` in `chunk`-sized pieces until a read comes back empty or
/// short, or the backend reports end-of-data.
fn drain<B: DescriptorBackend>(
    ops: &mut Primitives<'_, B>,
    read_end: RawFd,
    chunk: usize,
    out: &mut Vec<u8>,
) -> Result<(), CaptureError> {
    let mut buf = vec![0u8; chunk.max(1)];
    loop {
        if ops.at_eof(read_end)? {
            return Ok(());
        }
        let n = ops.read(read_end, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        out.extend_from_slice(&buf[..n]);
        ops.metrics().record_drain_read(n);
        if n < buf.len() {
            return Ok(());
        }
    }
}

/// Close every descriptor the session owns, reporting the first failure.
fn release<B: DescriptorBackend>(
    ops: &mut Primitives<'_, B>,
    session: &Session,
) -> Result<(), CaptureError> {
    let mut first_err = None;
    for fd in session.owned_fds() {
        if let Err(err) = ops.close(fd) {
            first_err.get_or_insert(err);
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::fake::{FakeBackend, Node};

    const STDOUT_MSG: &[u8] = b"This message goes to stdout\n";
    const STDERR_MSG: &[u8] = b"This message goes to stderr\n";

    fn fast_config() -> CaptureConfig {
        CaptureConfig::default().with_retry_interval(Duration::ZERO)
    }

    fn controller<const KEEP: bool>(
        config: CaptureConfig,
    ) -> (CaptureController<FakeBackend<KEEP>>, FakeBackend<KEEP>) {
        let backend = FakeBackend::<KEEP>::new();
        let handle = backend.clone();
        (CaptureController::with_backend(backend, config), handle)
    }

    fn assert_consoles_restored<const KEEP: bool>(handle: &FakeBackend<KEEP>) {
        let os = handle.os.lock();
        assert_eq!(os.open_count(), 2, "leaked descriptors: {:?}", os.table);
        assert_eq!(os.table.get(&1), Some(&Node::Console(0)));
        assert_eq!(os.table.get(&2), Some(&Node::Console(1)));
    }

    #[test]
    fn captures_stdout_then_stderr_in_write_order() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.initialize().unwrap();
        ctl.begin_default().unwrap();
        handle.os.lock().write(1, STDOUT_MSG);
        handle.os.lock().write(2, STDERR_MSG);
        ctl.end().unwrap();

        assert_eq!(
            ctl.capture(),
            "This message goes to stdout\nThis message goes to stderr\n"
        );
        assert!(handle.os.lock().consoles.iter().all(Vec::is_empty));
        assert_consoles_restored(&handle);
    }

    #[test]
    fn is_capturing_follows_begin_and_end() {
        let (ctl, _handle) = controller::<false>(fast_config());
        assert!(!ctl.is_capturing());
        ctl.begin(2048).unwrap();
        assert!(ctl.is_capturing());
        ctl.end().unwrap();
        assert!(!ctl.is_capturing());
    }

    #[test]
    fn initialize_is_repeatable() {
        let (ctl, handle) = controller::<false>(fast_config());
        assert!(!ctl.is_initialized());
        ctl.initialize().unwrap();
        ctl.initialize().unwrap();
        assert!(ctl.is_initialized());
        assert!(handle.os.lock().unbuffered);
    }

    #[test]
    fn initialize_failure_is_reported() {
        let (ctl, handle) = controller::<false>(fast_config());
        handle
            .os
            .lock()
            .fail(DescriptorOp::SetUnbuffered, 0, libc::EINVAL, 1);
        let err = ctl.initialize().unwrap_err();
        assert_eq!(err.op(), DescriptorOp::SetUnbuffered);
        assert!(!ctl.is_initialized());
    }

    #[test]
    fn second_begin_is_absorbed() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        let open_after_first = handle.os.lock().open_count();
        ctl.begin(2048).unwrap();
        assert_eq!(handle.os.lock().open_count(), open_after_first);

        handle.os.lock().write(1, b"once\n");
        ctl.end().unwrap();
        assert_eq!(ctl.capture(), "once\n");
        assert_eq!(ctl.metrics_snapshot().redundant_begins, 1);
        assert_eq!(ctl.metrics_snapshot().sessions_begun, 1);
        assert_consoles_restored(&handle);
    }

    #[test]
    fn second_end_keeps_the_buffer() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        handle.os.lock().write(1, b"kept\n");
        ctl.end().unwrap();
        ctl.end().unwrap();
        assert_eq!(ctl.capture(), "kept\n");
        assert_eq!(ctl.metrics_snapshot().redundant_ends, 1);
    }

    #[test]
    fn end_without_begin_is_a_no_op() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.end().unwrap();
        assert_eq!(ctl.capture(), "");
        assert_consoles_restored(&handle);
    }

    #[test]
    fn empty_window_yields_empty_capture() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        handle.os.lock().write(1, b"stale\n");
        ctl.end().unwrap();
        ctl.begin(2048).unwrap();
        ctl.end().unwrap();
        assert_eq!(ctl.capture(), "");
        assert!(ctl.capture_bytes().is_empty());
    }

    #[test]
    fn writes_after_end_reach_the_consoles() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        ctl.end().unwrap();
        handle.os.lock().write(1, b"out");
        handle.os.lock().write(2, b"err");
        let os = handle.os.lock();
        assert_eq!(os.consoles[0], b"out");
        assert_eq!(os.consoles[1], b"err");
    }

    #[test]
    fn write_larger_than_read_chunk_is_drained_in_pieces() {
        let (ctl, handle) = controller::<false>(fast_config().with_read_chunk(4));
        ctl.begin(2048).unwrap();
        handle.os.lock().write(1, b"0123456789");
        ctl.end().unwrap();
        assert_eq!(ctl.capture(), "0123456789");
        let metrics = ctl.metrics_snapshot();
        assert_eq!(metrics.drain_reads, 3);
        assert_eq!(metrics.bytes_drained, 10);
    }

    #[test]
    fn exact_multiple_of_chunk_stops_on_empty_pipe() {
        let (ctl, handle) = controller::<false>(fast_config().with_read_chunk(4));
        ctl.begin(2048).unwrap();
        handle.os.lock().write(1, b"abcdefgh");
        ctl.end().unwrap();
        assert_eq!(ctl.capture(), "abcdefgh");
        assert_eq!(ctl.metrics_snapshot().drain_reads, 2);
    }

    #[test]
    fn binary_bytes_survive_in_capture_bytes() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        handle.os.lock().write(1, &[b'a', 0, 0xff, b'\n']);
        ctl.end().unwrap();
        assert_eq!(ctl.capture_bytes(), vec![b'a', 0, 0xff, b'\n']);
        assert_eq!(ctl.capture(), "a\0\u{fffd}\n");
    }

    #[test]
    fn interrupted_primitives_are_retried() {
        let (ctl, handle) = controller::<false>(fast_config());
        {
            let mut os = handle.os.lock();
            os.fail(DescriptorOp::Pipe, 0, libc::EINTR, 2);
            os.fail(DescriptorOp::Dup, 1, libc::EBUSY, 1);
            os.fail(DescriptorOp::Dup2, 0, libc::EINTR, 1);
            os.fail(DescriptorOp::Read, 0, libc::EAGAIN, 3);
            os.fail(DescriptorOp::Close, 0, libc::EINTR, 1);
        }
        ctl.begin(2048).unwrap();
        handle.os.lock().write(1, b"survived\n");
        ctl.end().unwrap();

        assert_eq!(ctl.capture(), "survived\n");
        assert_eq!(ctl.metrics_snapshot().transient_retries, 8);
        assert_consoles_restored(&handle);
    }

    #[test]
    fn exhausted_budget_fails_begin_without_leaks() {
        let config = fast_config().with_max_attempts(Some(3));
        let (ctl, handle) = controller::<false>(config);
        handle.os.lock().fail(DescriptorOp::Dup, 1, libc::EINTR, 5);

        match ctl.begin(2048) {
            Err(CaptureError::RetriesExhausted { op, attempts, .. }) => {
                assert_eq!(op, DescriptorOp::Dup);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert!(!ctl.is_capturing());
        assert_consoles_restored(&handle);
    }

    #[test]
    fn permanent_failure_mid_redirect_rolls_back() {
        let (ctl, handle) = controller::<false>(fast_config());
        handle.os.lock().fail(DescriptorOp::Dup2, 1, libc::EBADF, 1);

        let err = ctl.begin(2048).unwrap_err();
        assert_eq!(err.op(), DescriptorOp::Dup2);
        assert_eq!(err.errno(), libc::EBADF);
        assert!(!ctl.is_capturing());
        assert_consoles_restored(&handle);

        ctl.begin(2048).unwrap();
        handle.os.lock().write(2, b"recovered\n");
        ctl.end().unwrap();
        assert_eq!(ctl.capture(), "recovered\n");
    }

    #[test]
    fn failed_restore_keeps_session_for_another_end() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        handle.os.lock().write(1, b"pending\n");
        handle.os.lock().fail(DescriptorOp::Dup2, 0, libc::EIO, 1);

        assert!(ctl.end().is_err());
        assert!(ctl.is_capturing());

        ctl.end().unwrap();
        assert!(!ctl.is_capturing());
        assert_eq!(ctl.capture(), "pending\n");
        assert_consoles_restored(&handle);
    }

    #[test]
    fn close_failure_still_releases_the_rest() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        handle.os.lock().write(1, b"data\n");
        handle.os.lock().fail(DescriptorOp::Close, 0, libc::EIO, 1);

        let err = ctl.end().unwrap_err();
        assert_eq!(err.op(), DescriptorOp::Close);
        assert!(!ctl.is_capturing());
        assert_eq!(ctl.capture(), "data\n");
        // The saved stdout copy failed to close; everything else is gone.
        assert_eq!(handle.os.lock().open_count(), 3);
    }

    #[test]
    fn kept_write_end_is_closed_by_end() {
        let (ctl, handle) = controller::<true>(fast_config());
        ctl.begin(2048).unwrap();
        assert_eq!(handle.os.lock().open_count(), 6);
        handle.os.lock().write(1, STDOUT_MSG);
        ctl.end().unwrap();
        assert_eq!(ctl.capture_bytes(), STDOUT_MSG);
        assert_consoles_restored(&handle);
    }

    #[test]
    fn std_streams_are_flushed_before_redirecting_only() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        ctl.begin(2048).unwrap();
        assert_eq!(handle.os.lock().flushes, 1);
        ctl.end().unwrap();
        ctl.end().unwrap();
        assert_eq!(handle.os.lock().flushes, 1);
    }

    #[test]
    fn guard_ends_capture_on_drop() {
        let (ctl, handle) = controller::<false>(fast_config());
        {
            let guard = ctl.scoped(2048).unwrap();
            assert!(guard.owns_session());
            handle.os.lock().write(1, b"scoped\n");
        }
        assert!(!ctl.is_capturing());
        assert_eq!(ctl.capture(), "scoped\n");
    }

    #[test]
    fn guard_finish_returns_text() {
        let (ctl, handle) = controller::<false>(fast_config());
        let guard = ctl.scoped(2048).unwrap();
        handle.os.lock().write(2, b"finished\n");
        assert_eq!(guard.finish().unwrap(), "finished\n");
        assert!(!ctl.is_capturing());
    }

    #[test]
    fn nested_guard_leaves_outer_capture_running() {
        let (ctl, handle) = controller::<false>(fast_config());
        ctl.begin(2048).unwrap();
        {
            let inner = ctl.scoped(2048).unwrap();
            assert!(!inner.owns_session());
        }
        assert!(ctl.is_capturing());
        handle.os.lock().write(1, b"outer\n");
        ctl.end().unwrap();
        assert_eq!(ctl.capture(), "outer\n");
    }

    #[test]
    fn concurrent_callers_leave_a_consistent_state() {
        let (ctl, handle) = controller::<false>(fast_config());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        ctl.begin(2048).unwrap();
                        let _ = ctl.is_capturing();
                        ctl.end().unwrap();
                        let _ = ctl.capture();
                    }
                });
            }
        });
        assert!(!ctl.is_capturing());
        let metrics = ctl.metrics_snapshot();
        assert_eq!(metrics.sessions_begun, metrics.sessions_ended);
        assert_eq!(
            metrics.sessions_begun + metrics.redundant_begins,
            8 * 50,
            "{metrics:?}"
        );
        assert_consoles_restored(&handle);
    }
}
