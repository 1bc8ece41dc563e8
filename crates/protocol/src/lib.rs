//! # Server Dash Protocol Library
//!
//! Wire definitions shared by the Server Dash daemon and its clients.
//!
//! ## Overview
//!
//! - **Messages**: JSON frames exchanged on the terminal socket
//! - **Geometry**: validated terminal dimensions
//! - **Tokens**: HS256 session tokens and `Cookie` header parsing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      ClientMessage / ServerMessage      │  JSON, tagged by "type"
//! ├─────────────────────────────────────────┤
//! │             WebSocket frames            │  text (binary = raw input)
//! ├─────────────────────────────────────────┤
//! │   HTTP upgrade + server_dash_session    │  HS256 JWT cookie
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{parse_cookie, ClientMessage, Role, TokenKey, TokenVerifier, SESSION_COOKIE};
//!
//! let key = TokenKey::from_secret(b"shared-secret");
//! let token = key.issue(Role::Admin).unwrap();
//!
//! let header = format!("{}={}", SESSION_COOKIE, token);
//! let presented = parse_cookie(&header, SESSION_COOKIE).unwrap();
//! assert_eq!(key.verify(presented).unwrap().role, Role::Admin);
//!
//! let frame = ClientMessage::resize(120, 40).to_json().unwrap();
//! assert!(frame.contains("\"resize\""));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Terminal message definitions
//! - [`token`]: Session tokens and cookies
//! - [`error`]: Error types

pub mod error;
pub mod messages;
pub mod token;

pub use error::{ProtocolError, Result};
pub use messages::{ClientMessage, ErrorCode, Geometry, ServerMessage, DEFAULT_COLS, DEFAULT_ROWS};
pub use token::{
    parse_cookie, Claims, Role, TokenKey, TokenVerifier, SESSION_COOKIE, TOKEN_TTL_SECS,
};
