//! Session gate.
//!
//! Decides from the WebSocket upgrade request alone whether a connection may
//! become an active terminal session. The gate only reads the handshake and
//! verifies the token; it never allocates session resources.

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{parse_cookie, ErrorCode, ProtocolError, Role, TokenVerifier};
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;

/// Header consulted for the client address when behind a reverse proxy.
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Reasons a handshake is refused.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No session cookie was presented.
    #[error("no session cookie")]
    NoCookie,

    /// The session cookie carried no token.
    #[error("no token in session cookie")]
    NoToken,

    /// The token failed verification.
    #[error("invalid token: {0}")]
    InvalidToken(#[source] ProtocolError),
}

impl AuthError {
    /// Wire error code sent to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::NoCookie => ErrorCode::NoCookie,
            AuthError::NoToken => ErrorCode::NoToken,
            AuthError::InvalidToken(_) => ErrorCode::InvalidToken,
        }
    }
}

/// Authenticated identity of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Authorized role.
    pub role: Role,
}

/// What the gate sees of an upgrade request.
#[derive(Debug, Clone, Default)]
pub struct HandshakeMetadata {
    /// Every `Cookie` header value, in order.
    pub cookies: Vec<String>,
    /// Remote socket address.
    pub peer: Option<SocketAddr>,
    /// Request path.
    pub path: String,
    /// First `X-Forwarded-For` entry, if any.
    pub forwarded_for: Option<String>,
}

impl HandshakeMetadata {
    /// Metadata for a connection from `peer` with no headers.
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            peer,
            path: "/".to_string(),
            ..Self::default()
        }
    }

    /// Add a `Cookie` header value.
    pub fn with_cookie(mut self, header: impl Into<String>) -> Self {
        self.cookies.push(header.into());
        self
    }

    /// Capture the relevant parts of an upgrade request.
    pub fn from_request(request: &Request, peer: Option<SocketAddr>) -> Self {
        let cookies = request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();

        let forwarded_for = request
            .headers()
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());

        Self {
            cookies,
            peer,
            path: request.uri().path().to_string(),
            forwarded_for,
        }
    }

    /// Value of cookie `name`, searching every `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find_map(|header| parse_cookie(header, name))
    }

    /// Client address for audit records.
    pub fn client_ip(&self) -> String {
        self.forwarded_for
            .clone()
            .or_else(|| self.peer.map(|peer| peer.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Checks handshake credentials.
#[derive(Clone)]
pub struct SessionGate {
    verifier: Arc<dyn TokenVerifier>,
    cookie_name: String,
}

impl SessionGate {
    /// Create a gate reading `cookie_name` and verifying with `verifier`.
    pub fn new(verifier: Arc<dyn TokenVerifier>, cookie_name: impl Into<String>) -> Self {
        Self {
            verifier,
            cookie_name: cookie_name.into(),
        }
    }

    /// Name of the cookie carrying the token.
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Accept or reject a handshake.
    pub fn check(&self, metadata: &HandshakeMetadata) -> Result<Principal, AuthError> {
        let token = metadata
            .cookie(&self.cookie_name)
            .ok_or(AuthError::NoCookie)?;
        if token.is_empty() {
            return Err(AuthError::NoToken);
        }

        let claims = self
            .verifier
            .verify(token)
            .map_err(AuthError::InvalidToken)?;

        Ok(Principal { role: claims.role })
    }
}

impl std::fmt::Debug for SessionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGate")
            .field("cookie_name", &self.cookie_name)
            .finish()
    }
}
