//! Scenario harness for stdcapture.
//!
//! This crate provides:
//! - Structured JSONL logging for capture runs
//! - Built-in scenarios that exercise the process-wide controller
//! - Ad-hoc capture reports for the CLI

#![forbid(unsafe_code)]

pub mod scenarios;
pub mod structured_log;

pub use scenarios::{
    RunReport, Scenario, ScenarioError, ScenarioResult, Stream, SuiteSummary, builtin_scenarios,
    run_capture, run_suite,
};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
