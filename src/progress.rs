//! Run progress reporting.
//!
//! Reports what `ingest run` is doing: which patterns are being expanded,
//! and how each item finished as it finishes. Progress goes to **stderr** so
//! the final summary on stdout stays parseable.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A pattern is being expanded into locators. Total unknown.
    Discovering { pattern: String },
    /// Item `n` of `total` reached a terminal status.
    ItemFinished {
        n: u64,
        total: u64,
        item: String,
        /// `done`, `skipped`, `failed`, or `not_started`.
        status: &'static str,
        detail: Option<String>,
    },
}

/// Receives progress events from the orchestrator.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: `[   3 / 1,204] done     file:docs/a.md`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Discovering { pattern } => format!("discovering {}...\n", pattern),
            ProgressEvent::ItemFinished {
                n,
                total,
                item,
                status,
                detail,
            } => {
                let total_fmt = format_number(*total);
                let mut line = format!(
                    "[{:>width$} / {}] {:<11} {}",
                    format_number(*n),
                    total_fmt,
                    status,
                    item,
                    width = total_fmt.len()
                );
                if let Some(detail) = detail {
                    line.push_str("  ");
                    line.push_str(detail);
                }
                line.push('\n');
                line
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Discovering { pattern } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "pattern": pattern,
            }),
            ProgressEvent::ItemFinished {
                n,
                total,
                item,
                status,
                detail,
            } => serde_json::json!({
                "event": "progress",
                "phase": "ingesting",
                "n": n,
                "total": total,
                "item": item,
                "status": status,
                "detail": detail,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
