//! Decoded application packets and their typed payloads.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{read_i64, read_str, read_u16};
use crate::error::{CodecError, CodecResult};
use crate::types::Identity;

/// Packet type carried in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client presents a bearer token.
    Auth = 0x01,
    /// Server accepts an `Auth`.
    AuthAck = 0x02,
    /// Keepalive ping (either direction).
    Heartbeat = 0x03,
    /// Keepalive reply.
    HeartbeatAck = 0x04,
    /// Opaque application message.
    Data = 0x05,
    /// Terminal error notice, sent just before close.
    Error = 0x06,
}

impl PacketType {
    /// All packet types, in wire order.
    pub const ALL: [Self; 6] = [
        Self::Auth,
        Self::AuthAck,
        Self::Heartbeat,
        Self::HeartbeatAck,
        Self::Data,
        Self::Error,
    ];

    /// Wire representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(Self::Auth),
            0x02 => Ok(Self::AuthAck),
            0x03 => Ok(Self::Heartbeat),
            0x04 => Ok(Self::HeartbeatAck),
            0x05 => Ok(Self::Data),
            0x06 => Ok(Self::Error),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "AUTH",
            Self::AuthAck => "AUTH_ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::Data => "DATA",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A decoded application packet. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    packet_type: PacketType,
    correlation_id: Option<i64>,
    payload: Bytes,
}

impl Envelope {
    /// Create an envelope without a correlation id.
    #[must_use]
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            correlation_id: None,
            payload: payload.into(),
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, id: i64) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set or clear the correlation id.
    #[must_use]
    pub const fn with_optional_correlation_id(mut self, id: Option<i64>) -> Self {
        self.correlation_id = id;
        self
    }

    /// Build an `Auth` envelope from a request.
    #[must_use]
    pub fn auth(request: &AuthRequest) -> Self {
        Self::new(PacketType::Auth, request.encode())
    }

    /// Build an `AuthAck` carrying the resolved identity.
    #[must_use]
    pub fn auth_ack(identity: &Identity, correlation_id: Option<i64>) -> Self {
        Self::new(
            PacketType::AuthAck,
            Bytes::copy_from_slice(identity.as_str().as_bytes()),
        )
        .with_optional_correlation_id(correlation_id)
    }

    /// Build a `Heartbeat` with an empty payload.
    #[must_use]
    pub fn heartbeat(correlation_id: Option<i64>) -> Self {
        Self::new(PacketType::Heartbeat, Bytes::new()).with_optional_correlation_id(correlation_id)
    }

    /// Build a `HeartbeatAck` carrying the server time in unix millis.
    #[must_use]
    pub fn heartbeat_ack(server_time_ms: i64, correlation_id: Option<i64>) -> Self {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i64(server_time_ms);
        Self::new(PacketType::HeartbeatAck, buf.freeze())
            .with_optional_correlation_id(correlation_id)
    }

    /// Build a `Data` envelope.
    #[must_use]
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::new(PacketType::Data, payload)
    }

    /// Build an `Error` envelope.
    #[must_use]
    pub fn error(code: ErrorCode, reason: &str) -> Self {
        Self::new(PacketType::Error, ErrorPayload::new(code, reason).encode())
    }

    /// Packet type.
    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Correlation id, if any.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<i64> {
        self.correlation_id
    }

    /// Raw payload bytes.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Interpret the payload as an [`AuthRequest`].
    ///
    /// # Errors
    ///
    /// Returns an error if this is not an `Auth` envelope or the payload is malformed.
    pub fn auth_request(&self) -> CodecResult<AuthRequest> {
        self.expect_type(PacketType::Auth)?;
        AuthRequest::decode(&self.payload)
    }

    /// Interpret the payload as an [`ErrorPayload`].
    ///
    /// # Errors
    ///
    /// Returns an error if this is not an `Error` envelope or the payload is malformed.
    pub fn error_payload(&self) -> CodecResult<ErrorPayload> {
        self.expect_type(PacketType::Error)?;
        ErrorPayload::decode(&self.payload)
    }

    /// Server time carried by a `HeartbeatAck`.
    ///
    /// # Errors
    ///
    /// Returns an error if this is not a `HeartbeatAck` or the payload is malformed.
    pub fn server_time_ms(&self) -> CodecResult<i64> {
        self.expect_type(PacketType::HeartbeatAck)?;
        let mut buf = &self.payload[..];
        read_i64(&mut buf, "server_time")
    }

    fn expect_type(&self, expected: PacketType) -> CodecResult<()> {
        if self.packet_type == expected {
            Ok(())
        } else {
            Err(CodecError::InvalidPayload(format!(
                "expected {expected} envelope, got {}",
                self.packet_type
            )))
        }
    }
}

/// Reason codes carried by `Error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Malformed or oversized frame.
    FrameRejected = 1,
    /// Token invalid or expired.
    AuthFailed = 2,
    /// No `Auth` within the auth window.
    AuthTimeout = 3,
    /// Envelope type not allowed in the current state.
    ProtocolViolation = 4,
    /// A newer connection for the same identity took over.
    Evicted = 5,
    /// Identity is banned.
    Banned = 6,
    /// Device was kicked offline.
    Kicked = 7,
    /// No inbound traffic within the idle window.
    IdleTimeout = 8,
    /// Gateway is shutting down.
    ShuttingDown = 9,
    /// Unexpected server-side failure.
    Internal = 10,
}

impl ErrorCode {
    /// Wire representation.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire code.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::FrameRejected),
            2 => Some(Self::AuthFailed),
            3 => Some(Self::AuthTimeout),
            4 => Some(Self::ProtocolViolation),
            5 => Some(Self::Evicted),
            6 => Some(Self::Banned),
            7 => Some(Self::Kicked),
            8 => Some(Self::IdleTimeout),
            9 => Some(Self::ShuttingDown),
            10 => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Payload of an `Error` envelope: `u16` code followed by a UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Reason code.
    pub code: ErrorCode,
    /// Human-readable reason.
    pub reason: String,
}

impl ErrorPayload {
    /// Create a new error payload.
    #[must_use]
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Encode to payload bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code.as_u16());
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }

    /// Decode from payload bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is unknown or the reason is not UTF-8.
    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut buf = payload;
        let raw = read_u16(&mut buf, "error_code")?;
        let code = ErrorCode::from_u16(raw)
            .ok_or_else(|| CodecError::InvalidPayload(format!("unknown error code {raw}")))?;
        let reason = std::str::from_utf8(buf)
            .map_err(|_| CodecError::InvalidUtf8("error_reason"))?
            .to_string();
        Ok(Self { code, reason })
    }
}

/// Payload of an `Auth` envelope.
///
/// Layout: `u16` token length, token bytes, `u16` device-id length, device-id
/// bytes. A zero device-id length means no device id.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Opaque bearer token.
    pub token: String,
    /// Client-supplied device identifier.
    pub device_id: Option<String>,
}

impl AuthRequest {
    /// Create a request with a token and no device id.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            device_id: None,
        }
    }

    /// Attach a device identifier.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Encode to payload bytes.
    ///
    /// Fields longer than `u16::MAX` bytes are truncated; tokens and device ids
    /// are far below that in practice.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let token = clamp(self.token.as_bytes());
        let device = clamp(self.device_id.as_deref().unwrap_or_default().as_bytes());
        let mut buf = BytesMut::with_capacity(4 + token.len() + device.len());
        buf.put_u16(token.len() as u16);
        buf.put_slice(token);
        buf.put_u16(device.len() as u16);
        buf.put_slice(device);
        buf.freeze()
    }

    /// Decode from payload bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on truncation, trailing bytes, invalid UTF-8 or an empty token.
    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let mut buf = payload;
        let token_len = usize::from(read_u16(&mut buf, "token_len")?);
        let token = read_str(&mut buf, token_len, "token")?;
        let device_len = usize::from(read_u16(&mut buf, "device_id_len")?);
        let device_id = read_str(&mut buf, device_len, "device_id")?;
        if !buf.is_empty() {
            return Err(CodecError::InvalidPayload(format!(
                "{} trailing bytes after auth request",
                buf.len()
            )));
        }
        if token.is_empty() {
            return Err(CodecError::InvalidPayload("empty token".to_string()));
        }
        Ok(Self {
            token,
            device_id: (!device_id.is_empty()).then_some(device_id),
        })
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("token", &"[REDACTED]")
            .field("device_id", &self.device_id)
            .finish()
    }
}

fn clamp(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(usize::from(u16::MAX))]
}
