//! Terminal wire protocol for Server Dash.
//!
//! Every frame on the terminal socket is a JSON object tagged by `type`.
//! The client sends keystrokes, resize requests and close requests; the
//! server answers with a readiness notice, raw shell output, the shell's
//! exit status, or a terminal error that is always followed by a close frame.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default terminal width in columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 30;

/// Validated terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl Geometry {
    /// Create a geometry, returning `None` if either dimension is zero.
    pub fn new(cols: u16, rows: u16) -> Option<Self> {
        if cols == 0 || rows == 0 {
            return None;
        }
        Some(Self { cols, rows })
    }

    /// Validate geometry as received from a client.
    ///
    /// Missing, non-positive and out-of-range values are rejected.
    pub fn from_raw(cols: Option<i64>, rows: Option<i64>) -> Option<Self> {
        let cols = u16::try_from(cols?).ok()?;
        let rows = u16::try_from(rows?).ok()?;
        Self::new(cols, rows)
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from the browser terminal to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes to write to the shell's stdin.
    Input {
        /// Raw input data.
        data: String,
    },
    /// Terminal resize request.
    ///
    /// Fields are kept unvalidated so a malformed resize can be dropped
    /// without failing the whole frame.
    Resize {
        /// Requested width.
        #[serde(default, alias = "cols")]
        columns: Option<i64>,
        /// Requested height.
        #[serde(default)]
        rows: Option<i64>,
    },
    /// Explicit request to end the session.
    Close,
}

impl ClientMessage {
    /// Build an input message.
    pub fn input(data: impl Into<String>) -> Self {
        ClientMessage::Input { data: data.into() }
    }

    /// Build a resize message.
    pub fn resize(cols: u16, rows: u16) -> Self {
        ClientMessage::Resize {
            columns: Some(i64::from(cols)),
            rows: Some(i64::from(rows)),
        }
    }

    /// Parse a client message from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from the daemon to the browser terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The shell is running and the session is active.
    Ready {
        /// Session identifier.
        session_id: String,
        /// Shell process id, when the platform reports one.
        pid: Option<u32>,
        /// Initial width.
        columns: u16,
        /// Initial height.
        rows: u16,
    },
    /// A chunk of shell output.
    Output {
        /// Output text.
        data: String,
    },
    /// The shell exited on its own.
    Exit {
        /// Exit code, if known.
        code: Option<u32>,
    },
    /// Terminal failure. The connection closes after this message.
    Error {
        /// Machine-readable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl ServerMessage {
    /// Build an output message.
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    /// Build an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse a server message from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The handshake carried no session cookie.
    NoCookie,
    /// The session cookie was present but empty.
    NoToken,
    /// The token failed signature or expiry checks.
    InvalidToken,
    /// The daemon is at its concurrent session limit.
    SessionLimit,
    /// The shell could not be started.
    SpawnFailed,
}

impl ErrorCode {
    /// Wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoCookie => "no_cookie",
            ErrorCode::NoToken => "no_token",
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::SessionLimit => "session_limit",
            ErrorCode::SpawnFailed => "spawn_failed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
