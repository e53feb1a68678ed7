//! CLI entrypoint for the stdcapture harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stdcapture_harness::{LogEmitter, Stream, builtin_scenarios, run_capture, run_suite};

/// Drive stdout/stderr capture against this process's own descriptors.
#[derive(Debug, Parser)]
#[command(name = "stdcapture-harness")]
#[command(about = "Scenario runner for stdcapture")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the built-in capture scenarios.
    Scenario {
        /// Structured JSONL log path (if omitted, logs to stdout).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run identifier embedded in every trace id.
        #[arg(long, default_value = "local")]
        run_id: String,
        /// Only run scenarios whose name contains this string.
        #[arg(long)]
        filter: Option<String>,
    },
    /// Capture the given text and print a JSON report of what came back.
    Run {
        /// Pipe capacity hint passed to begin.
        #[arg(long, default_value_t = stdcapture::DEFAULT_PIPE_HINT)]
        hint: usize,
        /// Stream the text is written to.
        #[arg(long, value_enum, default_value = "stdout")]
        stream: Stream,
        /// Text to write; arguments are joined with spaces and end with a newline.
        #[arg(last = true, required = true)]
        text: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let controller = stdcapture::global();
    controller.initialize()?;

    match cli.command {
        Command::Scenario {
            log,
            run_id,
            filter,
        } => {
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &run_id)?,
                None => LogEmitter::to_stdout(&run_id),
            };
            let scenarios: Vec<_> = builtin_scenarios()
                .into_iter()
                .filter(|s| filter.as_deref().is_none_or(|f| s.name.contains(f)))
                .collect();
            if scenarios.is_empty() {
                return Err("no scenario matches the filter".into());
            }

            let summary = run_suite(controller, &scenarios, &mut emitter)?;
            if let Some(path) = &log {
                eprintln!(
                    "{} passed, {} failed; log written to {}",
                    summary.passed,
                    summary.failed,
                    path.display()
                );
            }
            if summary.failed > 0 {
                return Err(format!("{} scenario(s) failed", summary.failed).into());
            }
        }
        Command::Run { hint, stream, text } => {
            let text = format!("{}\n", text.join(" "));
            let report = run_capture(controller, hint, stream, &text)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
