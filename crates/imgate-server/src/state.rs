//! Connection lifecycle state machine.
//!
//! ```text
//! CONNECTING --handshake--> AWAITING_AUTH --auth ok--> AUTHENTICATED
//!      |                         |                          |
//!      +---------close-----------+----------close-----------+
//!                                v
//!                             CLOSING --released--> CLOSED
//! ```
//!
//! Transitions not in the table are refused, so an envelope that arrives in
//! the wrong state is rejected by [`ConnectionState::admits`] rather than by
//! scattered conditionals.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use imgate_proto::{ErrorCode, PacketType};

/// State of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Protocol upgrade in progress.
    Connecting = 0,
    /// Upgraded; only AUTH is accepted.
    AwaitingAuth = 1,
    /// Authenticated; DATA and HEARTBEAT are accepted.
    Authenticated = 2,
    /// Tearing down; pending writes are draining.
    Closing = 3,
    /// Terminal.
    Closed = 4,
}

/// Events that move a connection between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// WebSocket upgrade finished.
    HandshakeComplete,
    /// Token verified and admission passed.
    AuthSucceeded,
    /// Any close trigger.
    Close,
    /// Socket released after draining.
    Released,
}

impl ConnectionState {
    /// State reached by applying `transition`, or `None` if not allowed.
    #[must_use]
    pub const fn next(self, transition: Transition) -> Option<Self> {
        match (self, transition) {
            (Self::Connecting, Transition::HandshakeComplete) => Some(Self::AwaitingAuth),
            (Self::AwaitingAuth, Transition::AuthSucceeded) => Some(Self::Authenticated),
            (Self::Connecting | Self::AwaitingAuth | Self::Authenticated, Transition::Close) => {
                Some(Self::Closing)
            }
            (Self::Closing, Transition::Released) => Some(Self::Closed),
            _ => None,
        }
    }

    /// Whether an inbound envelope of `packet_type` may be processed.
    #[must_use]
    pub const fn admits(self, packet_type: PacketType) -> bool {
        match self {
            Self::AwaitingAuth => matches!(packet_type, PacketType::Auth),
            Self::Authenticated => matches!(
                packet_type,
                PacketType::Data | PacketType::Heartbeat | PacketType::HeartbeatAck
            ),
            Self::Connecting | Self::Closing | Self::Closed => false,
        }
    }

    /// Whether the connection still accepts outbound envelopes.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingAuth | Self::Authenticated
        )
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::AwaitingAuth,
            2 => Self::Authenticated,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::AwaitingAuth => "AWAITING_AUTH",
            Self::Authenticated => "AUTHENTICATED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Connection state shared between the owning task and its handles.
///
/// Only the owning task applies transitions; handles read it to refuse
/// sends to a connection that is going away.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Apply a transition atomically, returning the new state.
    pub fn apply(&self, transition: Transition) -> Option<ConnectionState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                ConnectionState::from_u8(raw)
                    .next(transition)
                    .map(|s| s as u8)
            })
            .ok()
            .and_then(|prev| ConnectionState::from_u8(prev).next(transition))
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Malformed or oversized frame.
    Framing,
    /// Token rejected.
    AuthFailed,
    /// No AUTH within the auth window.
    AuthTimeout,
    /// Identity is banned.
    Banned,
    /// Device was kicked.
    Kicked,
    /// Envelope type not allowed in the current state.
    ProtocolViolation,
    /// No inbound traffic within the idle window.
    IdleTimeout,
    /// Replaced by a newer connection for the same identity.
    Evicted,
    /// Socket error.
    Transport,
    /// Peer closed the connection.
    RemoteClosed,
    /// Gateway shutdown.
    ShuttingDown,
    /// Unexpected server-side failure.
    Internal,
}

impl CloseReason {
    /// Wire code sent in the ERROR envelope before closing, if any.
    #[must_use]
    pub const fn error_code(self) -> Option<ErrorCode> {
        match self {
            Self::Framing => Some(ErrorCode::FrameRejected),
            Self::AuthFailed => Some(ErrorCode::AuthFailed),
            Self::AuthTimeout => Some(ErrorCode::AuthTimeout),
            Self::Banned => Some(ErrorCode::Banned),
            Self::Kicked => Some(ErrorCode::Kicked),
            Self::ProtocolViolation => Some(ErrorCode::ProtocolViolation),
            Self::IdleTimeout => Some(ErrorCode::IdleTimeout),
            Self::Evicted => Some(ErrorCode::Evicted),
            Self::ShuttingDown => Some(ErrorCode::ShuttingDown),
            Self::Internal => Some(ErrorCode::Internal),
            Self::Transport | Self::RemoteClosed => None,
        }
    }

    /// Short label for logs and close frames.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Framing => "frame rejected",
            Self::AuthFailed => "authentication failed",
            Self::AuthTimeout => "authentication timeout",
            Self::Banned => "banned",
            Self::Kicked => "kicked",
            Self::ProtocolViolation => "protocol violation",
            Self::IdleTimeout => "idle timeout",
            Self::Evicted => "replaced by newer connection",
            Self::Transport => "transport error",
            Self::RemoteClosed => "closed by peer",
            Self::ShuttingDown => "gateway shutting down",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
