//! Session states and close reasons.

use std::fmt;

/// Lifecycle state of a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport accepted, handshake metadata not yet examined.
    Connecting,
    /// Credential is being checked.
    Authenticating,
    /// Authenticated; owns at most one shell.
    Active,
    /// Teardown in progress; the shell has been signalled.
    Closing,
    /// Terminal state.
    Closed,
}

impl SessionState {
    /// Returns true if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Authenticating, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    /// Returns true for `Closing` and `Closed`.
    pub fn is_terminating(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    /// Returns true for `Closed`.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Credential check failed.
    AuthRejected,
    /// The client disconnected.
    Disconnected,
    /// The client asked to close.
    ClientClosed,
    /// The shell exited on its own.
    ProcessExited,
    /// The transport failed.
    TransportError,
    /// Writing to the shell failed.
    WriteFailed,
    /// No traffic within the idle timeout.
    IdleTimeout,
    /// The daemon is shutting down.
    Shutdown,
    /// The daemon was at its session limit.
    SessionLimit,
    /// The shell could not be started.
    SpawnFailed,
}

impl CloseReason {
    /// Short label used in logs and the audit trail.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::AuthRejected => "auth_rejected",
            CloseReason::Disconnected => "disconnected",
            CloseReason::ClientClosed => "client_closed",
            CloseReason::ProcessExited => "process_exited",
            CloseReason::TransportError => "transport_error",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Shutdown => "shutdown",
            CloseReason::SessionLimit => "session_limit",
            CloseReason::SpawnFailed => "spawn_failed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
