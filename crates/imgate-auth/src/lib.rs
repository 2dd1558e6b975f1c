//! # imgate-auth
//!
//! Token verification for the imgate gateway.
//!
//! The gateway never issues tokens. It only asks a [`TokenVerifier`] whether a
//! bearer token presented in an AUTH envelope is valid, and if so which
//! identity and device it speaks for.
//!
//! - [`TokenVerifier`]: async verification seam consumed by the gateway
//! - [`JwtVerifier`]: HMAC-signed JWT implementation
//! - [`StaticVerifier`]: fixed token table, for tests and local development

#![forbid(unsafe_code)]

pub mod error;
pub mod jwt;
pub mod verifier;

pub use error::{AuthError, AuthResult};
pub use jwt::{JwtClaims, JwtConfig, JwtVerifier};
pub use verifier::{StaticVerifier, TokenVerifier, VerifiedToken};
