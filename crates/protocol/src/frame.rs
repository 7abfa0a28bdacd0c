//! Binary frame envelope.
//!
//! ```text
//!  0       1       3       4               12              20      24
//!  +-------+-------+-------+---------------+---------------+-------+---------
//!  |  ver  | kind  | flags |      sid      |      seq      |  len  | payload
//!  +-------+-------+-------+---------------+---------------+-------+---------
//! ```
//!
//! All integers are big-endian.  Flag bit 0 marks the final fragment of a
//! logical message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::kind::MessageKind;
use crate::ProtocolError;

/// Envelope version written by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const ENVELOPE_OVERHEAD: usize = 24;

const FLAG_COMPLETED: u8 = 0b0000_0001;

/// One transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub sid: u64,
    pub seq: u64,
    pub completed: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, sid: u64, seq: u64, completed: bool, payload: Bytes) -> Self {
        Self {
            kind,
            sid,
            seq,
            completed,
            payload,
        }
    }

    /// A single-fragment message (`seq = 0`, `completed = true`).
    pub fn single(kind: MessageKind, sid: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(kind, sid, 0, true, payload.into())
    }

    /// Size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_OVERHEAD + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let len = length_field(self.payload.len())?;
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(self.kind.code());
        buf.put_u8(if self.completed { FLAG_COMPLETED } else { 0 });
        buf.put_u64(self.sid);
        buf.put_u64(self.seq);
        buf.put_u32(len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() < ENVELOPE_OVERHEAD {
            return Err(ProtocolError::Truncated {
                needed: ENVELOPE_OVERHEAD,
                got: raw.len(),
            });
        }
        let mut buf = raw;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let kind = MessageKind::from_code(buf.get_u16());
        let flags = buf.get_u8();
        let sid = buf.get_u64();
        let seq = buf.get_u64();
        let len = buf.get_u32() as usize;
        if buf.remaining() != len {
            return Err(ProtocolError::LengthMismatch {
                declared: len,
                actual: buf.remaining(),
            });
        }
        Ok(Self {
            kind,
            sid,
            seq,
            completed: flags & FLAG_COMPLETED != 0,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

fn length_field(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::PayloadTooLarge(len))
}

/// Payload bytes left per frame once the envelope is accounted for.
///
/// Transports call this when they are constructed; a limit that leaves no
/// room for payload is a configuration error.
pub fn usable_payload_size(transport_max: usize) -> Result<usize, ProtocolError> {
    match transport_max.checked_sub(ENVELOPE_OVERHEAD) {
        Some(n) if n > 0 => Ok(n),
        _ => Err(ProtocolError::PayloadLimit {
            limit: transport_max,
            overhead: ENVELOPE_OVERHEAD,
        }),
    }
}
