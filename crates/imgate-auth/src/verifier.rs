//! The verification seam consumed by the gateway.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgate_proto::Identity;

use crate::error::{AuthError, AuthResult};

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    /// Identity the token speaks for.
    pub identity: Identity,
    /// When the token stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Device id asserted by the token, if any. Takes precedence over the
    /// device id the client sends alongside the token.
    pub device_id: Option<String>,
}

impl VerifiedToken {
    /// Create a verified token without a device claim.
    #[must_use]
    pub fn new(identity: impl Into<Identity>, expires_at: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            expires_at,
            device_id: None,
        }
    }

    /// Attach a device claim.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Pick the effective device id: the token's claim wins over the client's.
    #[must_use]
    pub fn effective_device_id(&self, client_device_id: Option<&str>) -> Option<String> {
        self.device_id
            .clone()
            .or_else(|| client_device_id.map(str::to_string))
    }
}

/// Validates opaque bearer tokens.
///
/// Implementations may call out to a remote service; the gateway awaits the
/// result without blocking the connection's worker.
#[async_trait]
pub trait TokenVerifier: Send + Sync + fmt::Debug {
    /// Verify a token, returning the identity it asserts.
    async fn verify(&self, token: &str) -> AuthResult<VerifiedToken>;
}

/// Verifier backed by a fixed token table.
#[derive(Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, VerifiedToken>,
}

impl StaticVerifier {
    /// Create an empty verifier that rejects every token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `verified`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, verified: VerifiedToken) -> Self {
        self.tokens.insert(token.into(), verified);
        self
    }
}

impl fmt::Debug for StaticVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticVerifier")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> AuthResult<VerifiedToken> {
        let verified = self
            .tokens
            .get(token)
            .ok_or_else(|| AuthError::InvalidToken {
                reason: "unknown token".to_string(),
            })?;
        if verified.expires_at <= Utc::now() {
            return Err(AuthError::TokenExpired);
        }
        Ok(verified.clone())
    }
}
