//! HMAC-signed JWT verification.
//!
//! Tokens are issued elsewhere. The gateway checks the signature, the `exp`
//! and `nbf` windows, and optionally the issuer and audience, then resolves
//! the identity from a `userId` claim, falling back to `sub`.

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use async_trait::async_trait;
use imgate_proto::Identity;

use crate::error::{AuthError, AuthResult};
use crate::verifier::{TokenVerifier, VerifiedToken};

/// Minimum HS256 secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Claims the gateway understands. Unknown claims are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiration time (unix seconds).
    pub exp: i64,
    /// Issued at (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Not before (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Application user id; may be a string or a number.
    #[serde(
        rename = "userId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<serde_json::Value>,
    /// Device the token was issued to.
    #[serde(alias = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl JwtClaims {
    /// Claims for `subject` expiring at `exp`.
    #[must_use]
    pub fn new(subject: impl Into<String>, exp: DateTime<Utc>) -> Self {
        Self {
            sub: Some(subject.into()),
            exp: exp.timestamp(),
            iat: Some(Utc::now().timestamp()),
            ..Self::default()
        }
    }

    /// Sets the `userId` claim.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<serde_json::Value>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the device claim.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Sets the issuer.
    #[must_use]
    pub fn with_issuer(mut self, iss: impl Into<String>) -> Self {
        self.iss = Some(iss.into());
        self
    }

    /// Sets the audience.
    #[must_use]
    pub fn with_audience(mut self, aud: impl Into<String>) -> Self {
        self.aud = Some(aud.into());
        self
    }

    /// Resolve the identity: `userId` first, then `sub`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingSubject`] if neither claim yields a non-empty value.
    pub fn identity(&self) -> AuthResult<Identity> {
        let from_user_id = self.user_id.as_ref().and_then(|value| match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        from_user_id
            .or_else(|| self.sub.clone())
            .filter(|s| !s.trim().is_empty())
            .map(Identity::from)
            .ok_or(AuthError::MissingSubject)
    }

    /// Expiry as a timestamp.
    #[must_use]
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct Secret(Vec<u8>);

/// Verification settings for HS256 tokens.
#[derive(Clone)]
pub struct JwtConfig {
    secret: Secret,
    issuer: Option<String>,
    audience: Option<String>,
    leeway_secs: u64,
}

impl JwtConfig {
    /// Create an HS256 configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is shorter than [`MIN_SECRET_LEN`] bytes.
    pub fn new_hs256(secret: impl AsRef<[u8]>) -> AuthResult<Self> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::Jwt {
                reason: format!("secret must be at least {MIN_SECRET_LEN} bytes for HS256"),
            });
        }
        Ok(Self {
            secret: Secret(secret.to_vec()),
            issuer: None,
            audience: None,
            leeway_secs: 0,
        })
    }

    /// Require this issuer.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Require this audience.
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Clock skew tolerated on `exp`/`nbf`.
    #[must_use]
    pub const fn with_leeway_secs(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    /// Required issuer, if any.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        if let Some(ref iss) = self.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(ref aud) = self.audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }
        validation
    }
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("leeway_secs", &self.leeway_secs)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// [`TokenVerifier`] for HS256 JWTs.
pub struct JwtVerifier {
    config: JwtConfig,
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier from its configuration.
    #[must_use]
    pub fn new(config: JwtConfig) -> Self {
        let key = DecodingKey::from_secret(&config.secret.0);
        let validation = config.validation();
        Self {
            config,
            key,
            validation,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &JwtConfig {
        &self.config
    }

    /// Decode and validate a token, returning its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenExpired`] for expired tokens and
    /// [`AuthError::InvalidToken`] for anything malformed or mis-signed.
    pub fn decode_claims(&self, token: &str) -> AuthResult<JwtClaims> {
        decode::<JwtClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                ErrorKind::InvalidToken
                | ErrorKind::InvalidSignature
                | ErrorKind::ImmatureSignature
                | ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAudience
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::MissingRequiredClaim(_)
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => AuthError::InvalidToken {
                    reason: e.to_string(),
                },
                _ => AuthError::Jwt {
                    reason: e.to_string(),
                },
            })
    }

    /// Validate a token and resolve its identity synchronously.
    ///
    /// # Errors
    ///
    /// See [`JwtVerifier::decode_claims`]; additionally fails with
    /// [`AuthError::MissingSubject`] when no identity claim is present.
    pub fn verify_sync(&self, token: &str) -> AuthResult<VerifiedToken> {
        let claims = self.decode_claims(token)?;
        let identity = claims.identity()?;
        let expires_at = claims.expiry().ok_or_else(|| AuthError::InvalidToken {
            reason: format!("exp out of range: {}", claims.exp),
        })?;
        Ok(VerifiedToken {
            identity,
            expires_at,
            device_id: claims.device_id.filter(|d| !d.is_empty()),
        })
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> AuthResult<VerifiedToken> {
        let result = self.verify_sync(token);
        if let Err(ref e) = result {
            tracing::debug!(error = %e, "token rejected");
        }
        result
    }
}
