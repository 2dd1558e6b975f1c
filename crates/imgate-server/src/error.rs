//! Error types for the gateway server.

use std::time::Duration;

use imgate_auth::AuthError;
use imgate_proto::{CodecError, PacketType};
use thiserror::Error;

use crate::state::{CloseReason, ConnectionState};
use crate::store::StoreError;

/// Errors that can occur in the gateway.
///
/// The first six variants are scoped to a single connection or to the
/// directory side channel; the rest are process-level.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or oversized frame.
    #[error("framing error: {0}")]
    Framing(#[from] CodecError),

    /// Token rejected.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// No AUTH arrived in time.
    #[error("no AUTH within {0:?}")]
    AuthTimeout(Duration),

    /// Envelope type not admitted in the connection's current state.
    #[error("protocol violation: {packet_type} not allowed while {state}")]
    ProtocolViolation {
        /// Offending packet type.
        packet_type: PacketType,
        /// State the connection was in.
        state: ConnectionState,
    },

    /// Shared directory store unreachable.
    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(#[from] StoreError),

    /// Socket or WebSocket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Failed to bind a listener.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(String, std::io::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Close reason for errors that terminate a connection.
    #[must_use]
    pub const fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Framing(_) => Some(CloseReason::Framing),
            Self::Auth(_) => Some(CloseReason::AuthFailed),
            Self::AuthTimeout(_) => Some(CloseReason::AuthTimeout),
            Self::ProtocolViolation { .. } => Some(CloseReason::ProtocolViolation),
            Self::Transport(_) => Some(CloseReason::Transport),
            Self::Internal(_) => Some(CloseReason::Internal),
            Self::DirectoryUnavailable(_) | Self::BindFailed(..) | Self::Config(_) => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_failed_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = GatewayError::BindFailed("127.0.0.1:9090".to_string(), io_err);
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:9090"));
        assert!(msg.contains("address in use"));
    }

    #[test]
    fn test_protocol_violation_display() {
        let err = GatewayError::ProtocolViolation {
            packet_type: PacketType::Data,
            state: ConnectionState::AwaitingAuth,
        };
        assert_eq!(
            err.to_string(),
            "protocol violation: DATA not allowed while AWAITING_AUTH"
        );
    }

    #[test]
    fn test_from_codec_error() {
        let err: GatewayError = CodecError::UnknownPacketType(9).into();
        assert!(matches!(err, GatewayError::Framing(_)));
        assert_eq!(err.close_reason(), Some(CloseReason::Framing));
    }

    #[test]
    fn test_from_auth_error() {
        let err: GatewayError = AuthError::TokenExpired.into();
        assert_eq!(err.close_reason(), Some(CloseReason::AuthFailed));
    }

    #[test]
    fn test_directory_unavailable_is_not_fatal_to_connection() {
        let err: GatewayError = StoreError::Unavailable("refused".to_string()).into();
        assert!(err.close_reason().is_none());
    }

    #[test]
    fn test_from_tungstenite_error() {
        let err: GatewayError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, GatewayError::Transport(_)));
    }
}
