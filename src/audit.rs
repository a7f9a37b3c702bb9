//! Audit log collaborator.
//!
//! Infrastructure faults hit during ingestion are recorded here in full,
//! while the caller only sees a generic failure. [`LocationLog`] keeps one
//! append-only `log.txt` per package location so the app author's
//! administrator can read what happened, and mirrors every line to
//! `tracing`.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use tracing::warn;

pub const LOG_FILE: &str = "log.txt";

pub trait AuditLog: Send + Sync {
    /// Record `message` against a package location. `source` names the
    /// component that produced it (e.g. `"appgetter"`, `"sandbox"`).
    fn log(&self, location: &str, source: &str, message: &str);
}

/// Writes `<root>/<location>/log.txt`.
#[derive(Debug, Clone)]
pub struct LocationLog {
    root: PathBuf,
}

impl LocationLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn append(&self, location: &str, line: &str) -> std::io::Result<()> {
        let dir = self.root.join(location);
        if !dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "location directory does not exist",
            ));
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;
        writeln!(f, "{}", line)
    }
}

impl AuditLog for LocationLog {
    fn log(&self, location: &str, source: &str, message: &str) {
        warn!(location, source, "{}", message);
        let line = format!("{} [{}] {}", Utc::now().to_rfc3339(), source, message);
        if let Err(e) = self.append(location, &line) {
            warn!(location, error = %e, "could not write location log");
        }
    }
}
