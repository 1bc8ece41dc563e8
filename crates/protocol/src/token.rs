//! Signed session tokens and cookie parsing.
//!
//! The dashboard's login flow issues an HS256 JSON Web Token carrying the
//! caller's role and stores it in the `server_dash_session` cookie. The
//! terminal socket presents the same cookie during its upgrade request.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Name of the cookie holding the session token.
pub const SESSION_COOKIE: &str = "server_dash_session";

/// Token lifetime in seconds (24 hours).
pub const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Authorization role carried by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single dashboard administrator.
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
        }
    }
}

/// Token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Authorized role.
    pub role: Role,
    /// Issued-at, seconds since the unix epoch.
    pub iat: u64,
    /// Expiry, seconds since the unix epoch.
    pub exp: u64,
}

/// Anything that can turn a raw token string into verified claims.
pub trait TokenVerifier: Send + Sync {
    /// Verify signature and expiry and return the decoded claims.
    fn verify(&self, token: &str) -> Result<Claims>;
}

/// HS256 signing and verification key derived from a shared secret.
#[derive(Clone)]
pub struct TokenKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenKey {
    /// Build a key from the shared secret bytes.
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "iat"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl: Duration::from_secs(TOKEN_TTL_SECS),
        }
    }

    /// Override the lifetime of issued tokens.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Lifetime of issued tokens.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `role` valid from now.
    pub fn issue(&self, role: Role) -> Result<String> {
        self.issue_at(role, jsonwebtoken::get_current_timestamp())
    }

    /// Issue a token for `role` with an explicit issued-at time.
    pub fn issue_at(&self, role: Role, iat: u64) -> Result<String> {
        let claims = Claims {
            role,
            iat,
            exp: iat.saturating_add(self.ttl.as_secs()),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ProtocolError::Signing(e.to_string()))
    }
}

impl TokenVerifier for TokenKey {
    fn verify(&self, token: &str) -> Result<Claims> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims)
    }
}

impl fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenKey")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Find the value of cookie `name` in a `Cookie` header value.
///
/// Returns `Some("")` when the cookie is present with an empty value so
/// callers can tell a missing cookie from a missing token. Surrounding
/// double quotes are removed.
pub fn parse_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key.trim() != name {
            return None;
        }
        let value = value.trim();
        Some(
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-for-server-dash";

    #[test]
    fn test_issue_and_verify() {
        let key = TokenKey::from_secret(SECRET);
        let token = key.issue(Role::Admin).unwrap();
        let claims = key.verify(&token).unwrap();
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.exp - claims.iat, TOKEN_TTL_SECS);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let key = TokenKey::from_secret(SECRET);
        let other = TokenKey::from_secret(b"some-other-secret");
        let token = other.issue(Role::Admin).unwrap();
        let err = key.verify(&token).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature));
    }

    #[test]
    fn test_expired_token_rejected() {
        let key = TokenKey::from_secret(SECRET);
        let now = jsonwebtoken::get_current_timestamp();
        let token = key.issue_at(Role::Admin, now - 2 * TOKEN_TTL_SECS).unwrap();
        let err = key.verify(&token).unwrap_err();
        assert!(matches!(err, ProtocolError::TokenExpired));
    }

    #[test]
    fn test_custom_ttl() {
        let key = TokenKey::from_secret(SECRET).with_ttl(Duration::from_secs(60));
        let claims = key.verify(&key.issue(Role::Admin).unwrap()).unwrap();
        assert_eq!(claims.exp - claims.iat, 60);
    }

    #[test]
    fn test_malformed_token_rejected() {
        let key = TokenKey::from_secret(SECRET);
        for token in ["", "garbage", "a.b.c"] {
            let err = key.verify(token).unwrap_err();
            assert!(err.is_token_error(), "{token:?} gave {err:?}");
        }
    }

    #[test]
    fn test_unknown_role_rejected() {
        #[derive(Serialize)]
        struct Other {
            role: &'static str,
            iat: u64,
            exp: u64,
        }
        let now = jsonwebtoken::get_current_timestamp();
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &Other {
                role: "guest",
                iat: now,
                exp: now + 60,
            },
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let key = TokenKey::from_secret(SECRET);
        assert!(matches!(
            key.verify(&token),
            Err(ProtocolError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = TokenKey::from_secret(SECRET);
        let debug = format!("{:?}", key);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("test-secret"));
    }

    #[test]
    fn test_parse_cookie() {
        let header = "theme=dark; server_dash_session=abc.def.ghi; lang=en";
        assert_eq!(parse_cookie(header, SESSION_COOKIE), Some("abc.def.ghi"));
        assert_eq!(parse_cookie(header, "lang"), Some("en"));
        assert_eq!(parse_cookie(header, "missing"), None);
    }

    #[test]
    fn test_parse_cookie_empty_and_quoted() {
        assert_eq!(parse_cookie("server_dash_session=", SESSION_COOKIE), Some(""));
        assert_eq!(
            parse_cookie("server_dash_session=\"tok\"", SESSION_COOKIE),
            Some("tok")
        );
        assert_eq!(parse_cookie("server_dash_session", SESSION_COOKIE), None);
        assert_eq!(parse_cookie("", SESSION_COOKIE), None);
    }

    #[test]
    fn test_parse_cookie_prefix_name_does_not_match() {
        let header = "xserver_dash_session=nope; server_dash_session_old=nope";
        assert_eq!(parse_cookie(header, SESSION_COOKIE), None);
    }
}
