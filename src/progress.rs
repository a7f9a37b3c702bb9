//! Processing progress reporting for the CLI.
//!
//! Prints the pipeline's [`ProcessEvent`]s while `appgetter check` and
//! `appgetter install` wait for a session to finish. Progress goes to
//! **stderr** so stdout stays parseable for scripts.

use std::io::Write;

use crate::events::ProcessEvent;

/// Reports processing progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProcessEvent);
}

/// Human-friendly progress on stderr: `[abcd…] Getting routes`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProcessEvent) {
        let mark = match (event.done, event.error) {
            (true, true) => "  ✗",
            (true, false) => "  ✓",
            _ => "",
        };
        let line = format!("[{}] {}{}\n", short_token(&event.token), event.step, mark);
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProcessEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "token": event.token,
            "step": event.step,
            "done": event.done,
            "error": event.error,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProcessEvent) {}
}

fn short_token(token: &str) -> &str {
    match token.char_indices().nth(8) {
        Some((i, _)) => &token[..i],
        None => token,
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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
