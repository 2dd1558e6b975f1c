//! Binary frame codec for [`Envelope`]s.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::envelope::{Envelope, PacketType};
use crate::error::{CodecError, CodecResult};

/// Default maximum frame length (64 KiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Flag bit: an `i64` correlation id follows the flags byte.
pub const FLAG_CORRELATION: u8 = 0b0000_0001;

const KNOWN_FLAGS: u8 = FLAG_CORRELATION;

/// Bytes before the payload, without a correlation id.
const BASE_HEADER_LEN: usize = 1 + 1 + 4;

/// Encodes and decodes envelopes, enforcing a frame length limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeCodec {
    max_frame_length: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl EnvelopeCodec {
    /// Create a codec with the given frame limit in bytes.
    #[must_use]
    pub const fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    /// Configured frame limit.
    #[must_use]
    pub const fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Encoded size of an envelope.
    #[must_use]
    pub fn encoded_len(envelope: &Envelope) -> usize {
        let correlation = if envelope.correlation_id().is_some() { 8 } else { 0 };
        BASE_HEADER_LEN + correlation + envelope.payload().len()
    }

    /// Encode an envelope into a single frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooLarge`] if the encoded frame would exceed the limit.
    /// Callers that queue envelopes for a connection are expected to check
    /// [`EnvelopeCodec::encoded_len`] first, so the writer only sees this
    /// error for frames that bypassed that check.
    pub fn encode(&self, envelope: &Envelope) -> CodecResult<Bytes> {
        let size = Self::encoded_len(envelope);
        if size > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                size,
                limit: self.max_frame_length,
            });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(envelope.packet_type().as_u8());
        match envelope.correlation_id() {
            Some(id) => {
                buf.put_u8(FLAG_CORRELATION);
                buf.put_i64(id);
            }
            None => buf.put_u8(0),
        }
        buf.put_u32(envelope.payload().len() as u32);
        buf.put_slice(envelope.payload());
        Ok(buf.freeze())
    }

    /// Decode a single frame.
    ///
    /// Checks run in a fixed order: frame size, header truncation, packet type,
    /// flags, then payload length.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] describing the first violation found.
    pub fn decode(&self, frame: &[u8]) -> CodecResult<Envelope> {
        if frame.len() > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                size: frame.len(),
                limit: self.max_frame_length,
            });
        }

        let mut buf = frame;
        let raw_type = read_u8(&mut buf, "packet_type")?;
        let flags = read_u8(&mut buf, "flags")?;
        let packet_type = PacketType::try_from(raw_type)?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CodecError::InvalidFlags(flags));
        }

        let correlation_id = if flags & FLAG_CORRELATION != 0 {
            Some(read_i64(&mut buf, "correlation_id")?)
        } else {
            None
        };

        let declared = read_u32(&mut buf, "payload_len")? as usize;
        if declared != buf.len() {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }

        Ok(Envelope::new(packet_type, Bytes::copy_from_slice(buf))
            .with_optional_correlation_id(correlation_id))
    }
}

fn ensure(buf: &[u8], needed: usize, field: &'static str) -> CodecResult<()> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            field,
            needed: needed - buf.len(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8], field: &'static str) -> CodecResult<u8> {
    ensure(buf, 1, field)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut &[u8], field: &'static str) -> CodecResult<u16> {
    ensure(buf, 2, field)?;
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut &[u8], field: &'static str) -> CodecResult<u32> {
    ensure(buf, 4, field)?;
    Ok(buf.get_u32())
}

pub(crate) fn read_i64(buf: &mut &[u8], field: &'static str) -> CodecResult<i64> {
    ensure(buf, 8, field)?;
    Ok(buf.get_i64())
}

pub(crate) fn read_str(buf: &mut &[u8], len: usize, field: &'static str) -> CodecResult<String> {
    ensure(buf, len, field)?;
    let (head, tail) = buf.split_at(len);
    let value = std::str::from_utf8(head)
        .map_err(|_| CodecError::InvalidUtf8(field))?
        .to_string();
    *buf = tail;
    Ok(value)
}
