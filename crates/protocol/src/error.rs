//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering message codec and token failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Token errors
    /// Token signature did not verify against the shared secret.
    #[error("invalid token signature")]
    InvalidSignature,

    /// Token was well-formed and signed but has expired.
    #[error("token expired")]
    TokenExpired,

    /// Token could not be decoded or is missing required claims.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// Token could not be issued.
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl ProtocolError {
    /// Returns true if this error came from token verification.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidSignature
                | ProtocolError::TokenExpired
                | ProtocolError::MalformedToken(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<jsonwebtoken::errors::Error> for ProtocolError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidSignature => ProtocolError::InvalidSignature,
            ErrorKind::ExpiredSignature => ProtocolError::TokenExpired,
            _ => ProtocolError::MalformedToken(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_error_display() {
        let err = ProtocolError::Serialization("invalid utf-8".to_string());
        assert_eq!(err.to_string(), "serialization failed: invalid utf-8");
    }

    #[test]
    fn test_deserialization_error_display() {
        let err = ProtocolError::Deserialization("unexpected end of input".to_string());
        assert_eq!(
            err.to_string(),
            "deserialization failed: unexpected end of input"
        );
    }

    #[test]
    fn test_token_error_display() {
        assert_eq!(
            ProtocolError::InvalidSignature.to_string(),
            "invalid token signature"
        );
        assert_eq!(ProtocolError::TokenExpired.to_string(), "token expired");
        assert_eq!(
            ProtocolError::MalformedToken("not a jwt".to_string()).to_string(),
            "malformed token: not a jwt"
        );
    }

    #[test]
    fn test_is_token_error() {
        assert!(ProtocolError::InvalidSignature.is_token_error());
        assert!(ProtocolError::TokenExpired.is_token_error());
        assert!(ProtocolError::MalformedToken(String::new()).is_token_error());
        assert!(!ProtocolError::Signing(String::new()).is_token_error());
        assert!(!ProtocolError::Serialization(String::new()).is_token_error());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_jwt_error_kinds() {
        use jsonwebtoken::errors::{Error, ErrorKind};

        let err: ProtocolError = Error::from(ErrorKind::InvalidSignature).into();
        assert!(matches!(err, ProtocolError::InvalidSignature));

        let err: ProtocolError = Error::from(ErrorKind::ExpiredSignature).into();
        assert!(matches!(err, ProtocolError::TokenExpired));

        let err: ProtocolError = Error::from(ErrorKind::InvalidToken).into();
        assert!(matches!(err, ProtocolError::MalformedToken(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
