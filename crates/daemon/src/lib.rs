//! # Server Dash Daemon Library
//!
//! This crate provides the terminal bridge of the Server Dash dashboard: an
//! authenticated WebSocket endpoint that gives the operator's browser a live
//! shell on the host.
//!
//! ## Overview
//!
//! Each WebSocket connection becomes one session:
//!
//! - **Session Gate**: Verifies the `server_dash_session` cookie before
//!   anything is allocated
//! - **Process Spawner**: Starts the operator's shell in a pseudo-terminal
//! - **Duplex Relay**: Pumps shell output to the socket and socket input to
//!   the shell, in order
//! - **Lifecycle Controller**: Guarantees the shell is signalled exactly once
//!   when the session ends
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DashServer                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │ Session Gate │  │   Session    │  │     Audit Log        │   │
//! │  │  (JWT auth)  │  │   Registry   │  │                      │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                                                 │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │   Session: lifecycle ─ relay ─ PTY process                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use daemon::{AuditLog, Config, DashServer, PtySpawner, SessionGate};
//! use daemon::protocol::TokenKey;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let key = TokenKey::from_secret(config.auth.load_secret()?.as_bytes());
//!     let gate = SessionGate::new(Arc::new(key), config.auth.cookie_name.clone());
//!
//!     let server = Arc::new(DashServer::new(
//!         config,
//!         gate,
//!         Arc::new(PtySpawner::new()),
//!         Arc::new(AuditLog::disabled()),
//!     )?);
//!     let listener = server.bind().await?;
//!     server.serve(listener).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`gate`]: Handshake credential checks
//! - [`session`]: PTY processes, lifecycle, and the session registry
//! - [`relay`]: Shell/socket pumps
//! - [`server`]: WebSocket listener and per-connection driver
//! - [`audit`]: Terminal event audit log

pub mod audit;
pub mod config;
pub mod gate;
pub mod relay;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export gate types for convenience
pub use gate::{AuthError, HandshakeMetadata, Principal, SessionGate};

// Re-export session types for convenience
pub use session::{
    CloseReason, ExitInfo, ProcessHandle, PtyError, PtyProcess, PtySpawner, Session, SessionId,
    SessionInfo, SessionRegistry, SessionState, SpawnOptions, SpawnedProcess, Spawner,
};

// Re-export relay and server types for convenience
pub use audit::{AuditAction, AuditLog};
pub use relay::{Outbound, Relay, RelayOutcome, Utf8Chunker};
pub use server::DashServer;
