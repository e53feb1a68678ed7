//! Built-in capture scenarios.
//!
//! Each scenario drives a controller over the real process descriptors and
//! checks what came back. Scenarios never log while capturing; the suite
//! runner emits one `scenario_result` entry after each one has finished.

use std::io::Write;
use std::time::Instant;

use serde::Serialize;
use stdcapture::{CaptureController, CaptureError, DEFAULT_PIPE_HINT, MetricsSnapshot};
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("captured {actual:?}, expected {expected:?}")]
    Mismatch { expected: String, actual: String },
    #[error("{0}")]
    Invariant(String),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Which standard stream a payload is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn write(self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()
            }
            Self::Stderr => std::io::stderr().write_all(bytes),
        }
    }
}

type ScenarioFn = fn(&CaptureController) -> Result<usize, ScenarioError>;

/// A named check; `run` returns the number of bytes it captured.
#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    run: ScenarioFn,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario").field("name", &self.name).finish()
    }
}

impl Scenario {
    pub fn run(&self, controller: &CaptureController) -> Result<usize, ScenarioError> {
        (self.run)(controller)
    }
}

#[must_use]
pub fn builtin_scenarios() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "stdout_then_stderr",
            run: stdout_then_stderr,
        },
        Scenario {
            name: "empty_capture",
            run: empty_capture,
        },
        Scenario {
            name: "redundant_begin_and_end",
            run: redundant_begin_and_end,
        },
        Scenario {
            name: "large_write",
            run: large_write,
        },
        Scenario {
            name: "sequential_sessions",
            run: sequential_sessions,
        },
    ]
}

fn expect_text(controller: &CaptureController, expected: &str) -> Result<usize, ScenarioError> {
    let actual = controller.capture();
    if actual != expected {
        return Err(ScenarioError::Mismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual.len())
}

fn stdout_then_stderr(controller: &CaptureController) -> Result<usize, ScenarioError> {
    {
        let guard = controller.scoped(DEFAULT_PIPE_HINT)?;
        Stream::Stdout.write(b"This message goes to stdout\n")?;
        Stream::Stderr.write(b"This message goes to stderr\n")?;
        guard.finish()?;
    }
    expect_text(
        controller,
        "This message goes to stdout\nThis message goes to stderr\n",
    )
}

fn empty_capture(controller: &CaptureController) -> Result<usize, ScenarioError> {
    controller.scoped(DEFAULT_PIPE_HINT)?.finish()?;
    expect_text(controller, "")
}

fn redundant_begin_and_end(controller: &CaptureController) -> Result<usize, ScenarioError> {
    let before = controller.metrics_snapshot();
    controller.begin(DEFAULT_PIPE_HINT)?;
    let second = controller.begin(DEFAULT_PIPE_HINT);
    let written = Stream::Stdout.write(b"once\n");
    controller.end()?;
    second?;
    written?;
    controller.end()?;

    let after = controller.metrics_snapshot();
    if after.sessions_begun - before.sessions_begun != 1 {
        return Err(ScenarioError::Invariant(format!(
            "expected one session, metrics went {before:?} -> {after:?}"
        )));
    }
    if controller.is_capturing() {
        return Err(ScenarioError::Invariant("still capturing".to_string()));
    }
    expect_text(controller, "once\n")
}

fn large_write(controller: &CaptureController) -> Result<usize, ScenarioError> {
    let payload: String = (0..512).map(|i| format!("line {i:04} of the payload\n")).collect();
    {
        let guard = controller.scoped(64 * 1024)?;
        Stream::Stdout.write(payload.as_bytes())?;
        guard.finish()?;
    }
    expect_text(controller, &payload)
}

fn sequential_sessions(controller: &CaptureController) -> Result<usize, ScenarioError> {
    {
        let guard = controller.scoped(DEFAULT_PIPE_HINT)?;
        Stream::Stdout.write(b"first\n")?;
        guard.finish()?;
    }
    expect_text(controller, "first\n")?;
    {
        let guard = controller.scoped(DEFAULT_PIPE_HINT)?;
        Stream::Stderr.write(b"second\n")?;
        guard.finish()?;
    }
    expect_text(controller, "second\n")
}

/// One scenario's result.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub outcome: Outcome,
    pub bytes_captured: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteSummary {
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioResult>,
}

/// Build the log entry and result for one finished scenario. A failed cleanup
/// `end` turns a pass into an error and is appended to a failure's message.
fn record_scenario(
    name: &'static str,
    elapsed_us: u64,
    result: Result<usize, ScenarioError>,
    cleanup: Option<CaptureError>,
) -> (LogEntry, ScenarioResult) {
    let mut entry = LogEntry::new(String::new(), LogLevel::Info, "scenario_result")
        .with_scenario(name)
        .with_duration_us(elapsed_us);

    let (outcome, mut message, os_error) = match &result {
        Ok(_) if cleanup.is_none() => (Outcome::Pass, None, None),
        Ok(_) => (Outcome::Error, None, cleanup.as_ref()),
        Err(err) => {
            let outcome = match err {
                ScenarioError::Mismatch { .. } | ScenarioError::Invariant(_) => Outcome::Fail,
                ScenarioError::Capture(_) | ScenarioError::Io(_) => Outcome::Error,
            };
            let os_error = match err {
                ScenarioError::Capture(capture_err) => Some(capture_err),
                _ => cleanup.as_ref(),
            };
            (outcome, Some(err.to_string()), os_error)
        }
    };
    if let Some(cleanup_err) = &cleanup {
        let note = format!("cleanup end: {cleanup_err}");
        message = Some(match message {
            Some(msg) => format!("{msg}; {note}"),
            None => note,
        });
    }

    entry = entry.with_outcome(outcome);
    let bytes_captured = match &result {
        Ok(bytes) if outcome == Outcome::Pass => {
            entry = entry.with_bytes_captured(*bytes as u64);
            *bytes
        }
        _ => {
            entry.level = LogLevel::Error;
            0
        }
    };
    if let Some(msg) = &message {
        entry = entry.with_details(serde_json::json!({ "message": msg }));
    }
    if let Some(err) = os_error {
        entry = entry.with_os_error(err.op().name(), err.errno());
    }

    let record = ScenarioResult {
        name,
        outcome,
        bytes_captured,
        message,
    };
    (entry, record)
}

/// Run `scenarios` in order, logging each result through `emitter`.
pub fn run_suite(
    controller: &CaptureController,
    scenarios: &[Scenario],
    emitter: &mut LogEmitter,
) -> std::io::Result<SuiteSummary> {
    emitter.emit(LogLevel::Info, "suite_start")?;
    let mut summary = SuiteSummary::default();

    for scenario in scenarios {
        let started = Instant::now();
        let result = scenario.run(controller);
        let elapsed_us = started.elapsed().as_micros() as u64;
        // A scenario that bailed out of a bare begin leaves the streams redirected;
        // they must be ours again before logging.
        let cleanup = if controller.is_capturing() {
            controller.end().err()
        } else {
            None
        };

        let (entry, record) = record_scenario(scenario.name, elapsed_us, result, cleanup);
        match record.outcome {
            Outcome::Pass => summary.passed += 1,
            Outcome::Fail | Outcome::Error => summary.failed += 1,
        }
        emitter.emit_entry(entry)?;
        summary.results.push(record);
    }

    let level = if summary.failed == 0 {
        LogLevel::Info
    } else {
        LogLevel::Error
    };
    let mut entry = LogEntry::new(String::new(), level, "suite_end")
        .with_details(serde_json::json!({
            "passed": summary.passed,
            "failed": summary.failed,
            "metrics": controller.metrics_snapshot(),
        }));
    entry.outcome = Some(if summary.failed == 0 {
        Outcome::Pass
    } else {
        Outcome::Fail
    });
    emitter.emit_entry(entry)?;
    emitter.flush()?;
    Ok(summary)
}

/// What a single ad-hoc capture produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub hint: usize,
    pub stream: Stream,
    pub captured: String,
    pub bytes: usize,
    pub metrics: MetricsSnapshot,
}

/// Capture `text` written to `stream` and report it.
pub fn run_capture(
    controller: &CaptureController,
    hint: usize,
    stream: Stream,
    text: &str,
) -> Result<RunReport, ScenarioError> {
    let captured = {
        let guard = controller.scoped(hint)?;
        stream.write(text.as_bytes())?;
        guard.finish()?
    };
    Ok(RunReport {
        hint,
        stream,
        bytes: captured.len(),
        captured,
        metrics: controller.metrics_snapshot(),
    })
}
