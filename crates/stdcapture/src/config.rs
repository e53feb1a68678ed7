//! Controller configuration.
//!
//! Values are read from the environment once, when a controller is built
//! with [`CaptureConfig::from_env`]:
//! - `STDCAPTURE_RETRY_INTERVAL_MS`: sleep between retries of a transiently
//!   failing primitive (default 10).
//! - `STDCAPTURE_RETRY_MAX`: attempt budget per primitive call. `0`,
//!   `unbounded`, `none` or unset keep retrying forever (default).
//! - `STDCAPTURE_PIPE_HINT`: pipe capacity hint used by `begin_default`
//!   (default 2048).
//! - `STDCAPTURE_READ_CHUNK`: bytes requested per read while draining
//!   (default 1024).
//!
//! Unparseable values fall back to the default for that field.

use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_PIPE_HINT: usize = 2048;
pub const DEFAULT_READ_CHUNK: usize = 1024;

pub const ENV_RETRY_INTERVAL_MS: &str = "STDCAPTURE_RETRY_INTERVAL_MS";
pub const ENV_RETRY_MAX: &str = "STDCAPTURE_RETRY_MAX";
pub const ENV_PIPE_HINT: &str = "STDCAPTURE_PIPE_HINT";
pub const ENV_READ_CHUNK: &str = "STDCAPTURE_READ_CHUNK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub retry: RetryPolicy,
    /// Pipe capacity hint for [`begin_default`](crate::CaptureController::begin_default).
    pub default_pipe_hint: usize,
    /// Bytes requested per read while draining. Always at least 1.
    pub read_chunk: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_pipe_hint: DEFAULT_PIPE_HINT,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl CaptureConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = lookup(ENV_RETRY_INTERVAL_MS).and_then(|v| parse_usize(&v)) {
            config.retry.interval = Duration::from_millis(ms as u64);
        }
        if let Some(raw) = lookup(ENV_RETRY_MAX) {
            config.retry.max_attempts = parse_max_attempts(&raw);
        }
        if let Some(hint) = lookup(ENV_PIPE_HINT).and_then(|v| parse_usize(&v)) {
            config.default_pipe_hint = hint;
        }
        if let Some(chunk) = lookup(ENV_READ_CHUNK).and_then(|v| parse_usize(&v)) {
            config = config.with_read_chunk(chunk);
        }
        config
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry.interval = interval;
        self
    }

    /// Bound the attempts per primitive call; `None` retries forever.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.retry.max_attempts = max_attempts.filter(|&n| n > 0);
        self
    }

    #[must_use]
    pub fn with_default_pipe_hint(mut self, hint: usize) -> Self {
        self.default_pipe_hint = hint;
        self
    }

    #[must_use]
    pub fn with_read_chunk(mut self, chunk: usize) -> Self {
        self.read_chunk = chunk.max(1);
        self
    }
}

fn parse_usize(raw: &str) -> Option<usize> {
    raw.trim().parse().ok()
}

fn parse_max_attempts(raw: &str) -> Option<u32> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "unbounded" | "none" | "infinite" => None,
        other => other.parse::<u32>().ok().filter(|&n| n > 0),
    }
}
