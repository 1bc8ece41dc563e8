//! Session management module.
//!
//! This module provides PTY spawning, the per-session lifecycle state
//! machine, and the registry of live sessions.

pub mod lifecycle;
pub mod manager;
pub mod pty;
pub mod state;

#[cfg(test)]
pub(crate) mod fake;

pub use lifecycle::{LifecycleError, Session, SessionInfo};
pub use manager::{RegistryError, SessionRegistry};
pub use pty::{
    ExitInfo, ProcessHandle, PtyError, PtyProcess, PtySpawner, SessionId, SpawnOptions,
    SpawnedProcess, Spawner,
};
pub use state::{CloseReason, SessionState};
