//! Capture counters.
//!
//! The controller cannot log while it owns the standard streams (anything it
//! printed would end up in the capture), so it records what it does here.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters updated by a [`CaptureController`](crate::CaptureController).
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    /// Sessions opened by `begin`.
    pub sessions_begun: AtomicU64,
    /// Sessions closed by `end`.
    pub sessions_ended: AtomicU64,
    /// `begin` calls absorbed because a session was already open.
    pub redundant_begins: AtomicU64,
    /// `end` calls absorbed because no session was open.
    pub redundant_ends: AtomicU64,
    /// Transient primitive failures that were retried.
    pub transient_retries: AtomicU64,
    /// Successful reads issued while draining the pipe.
    pub drain_reads: AtomicU64,
    /// Bytes moved from the pipe into the capture buffer.
    pub bytes_drained: AtomicU64,
}

/// Point-in-time copy of [`CaptureMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_begun: u64,
    pub sessions_ended: u64,
    pub redundant_begins: u64,
    pub redundant_ends: u64,
    pub transient_retries: u64,
    pub drain_reads: u64,
    pub bytes_drained: u64,
}

impl CaptureMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sessions_begun: AtomicU64::new(0),
            sessions_ended: AtomicU64::new(0),
            redundant_begins: AtomicU64::new(0),
            redundant_ends: AtomicU64::new(0),
            transient_retries: AtomicU64::new(0),
            drain_reads: AtomicU64::new(0),
            bytes_drained: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_begin(&self) {
        self.sessions_begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_end(&self) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redundant_begin(&self) {
        self.redundant_begins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redundant_end(&self) {
        self.redundant_ends.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drain_read(&self, bytes: usize) {
        self.drain_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_drained.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_begun: self.sessions_begun.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            redundant_begins: self.redundant_begins.load(Ordering::Relaxed),
            redundant_ends: self.redundant_ends.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            drain_reads: self.drain_reads.load(Ordering::Relaxed),
            bytes_drained: self.bytes_drained.load(Ordering::Relaxed),
        }
    }
}
