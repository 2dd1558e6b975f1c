//! # imgate-proto
//!
//! Wire protocol for the imgate long-connection gateway.
//!
//! Every WebSocket binary frame carries exactly one [`Envelope`]:
//!
//! ```text
//! +------+-------+--------------------+-----------------+-------------+
//! | type | flags | correlation (i64)  | payload_len u32 | payload ... |
//! |  u8  |  u8   | only if flags & 1  |   big-endian    |             |
//! +------+-------+--------------------+-----------------+-------------+
//! ```
//!
//! The [`EnvelopeCodec`] enforces a maximum frame length before parsing and
//! rejects unknown packet types, unknown flag bits and length mismatches.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod types;

pub use codec::{DEFAULT_MAX_FRAME_LENGTH, EnvelopeCodec};
pub use envelope::{AuthRequest, Envelope, ErrorCode, ErrorPayload, PacketType};
pub use error::{CodecError, CodecResult};
pub use types::Identity;
