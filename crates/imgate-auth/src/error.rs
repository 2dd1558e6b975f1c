//! Error types for token verification.

use thiserror::Error;

/// Reasons a bearer token can be refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token is malformed or its signature does not verify.
    #[error("invalid token: {reason}")]
    InvalidToken {
        /// Why the token was rejected.
        reason: String,
    },

    /// Token is well-formed but past its expiry.
    #[error("token expired")]
    TokenExpired,

    /// Token carries neither a `userId` nor a `sub` claim.
    #[error("token has no subject")]
    MissingSubject,

    /// Verifier misconfiguration or an unexpected JWT library failure.
    #[error("jwt error: {reason}")]
    Jwt {
        /// Underlying failure.
        reason: String,
    },

    /// Remote verification backend could not be reached.
    #[error("verifier unavailable: {reason}")]
    Unavailable {
        /// Underlying failure.
        reason: String,
    },
}

impl AuthError {
    /// Whether the client could succeed by retrying with the same token.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type for verification.
pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AuthError::InvalidToken {
            reason: "bad signature".to_string(),
        };
        assert_eq!(err.to_string(), "invalid token: bad signature");
        assert_eq!(AuthError::TokenExpired.to_string(), "token expired");
    }

    #[test]
    fn test_is_transient() {
        assert!(AuthError::Unavailable {
            reason: "timeout".to_string()
        }
        .is_transient());
        assert!(!AuthError::TokenExpired.is_transient());
        assert!(!AuthError::MissingSubject.is_transient());
    }
}
