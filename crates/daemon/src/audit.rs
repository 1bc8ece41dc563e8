//! Append-only audit log of terminal events.
//!
//! Each event is one line:
//!
//! ```text
//! [2024-05-01T12:00:00.000Z] [203.0.113.9] [TERMINAL_OPEN] [session 6f1c...] [SUCCESS]
//! ```
//!
//! Failures to write are logged and never surface to the caller.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Audited terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// Handshake credential check.
    TerminalAuth,
    /// Shell started for a session.
    TerminalOpen,
    /// Session ended.
    TerminalClose,
}

impl AuditAction {
    /// Name written to the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::TerminalAuth => "TERMINAL_AUTH",
            AuditAction::TerminalOpen => "TERMINAL_OPEN",
            AuditAction::TerminalClose => "TERMINAL_CLOSE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit log writer. A log without a path discards every event.
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Log appending to `path`, or discarding when `None`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Log that discards every event.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// File being appended to.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event.
    pub async fn record(&self, action: AuditAction, target: &str, ip: &str, success: bool) {
        let Some(path) = &self.path else {
            return;
        };

        let line = format_line(Utc::now(), ip, action, target, success);
        let _guard = self.write_lock.lock().await;
        if let Err(e) = append(path, &line).await {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to write audit log"
            );
        }
    }
}

/// Render one audit line, newline included.
pub fn format_line(
    timestamp: DateTime<Utc>,
    ip: &str,
    action: AuditAction,
    target: &str,
    success: bool,
) -> String {
    format!(
        "[{}] [{}] [{}] [{}] [{}]\n",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        ip,
        action,
        target,
        if success { "SUCCESS" } else { "FAILURE" }
    )
}

async fn append(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
