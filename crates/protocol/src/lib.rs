//! Node protocol: the frame envelope shared by every transport, message
//! kinds, and the JSON payloads that ride inside frames.
//!
//! Every transport message is exactly one [`Frame`].  Large logical messages
//! are split into several frames on the same `sid` with increasing `seq`,
//! the last one flagged `completed`.

mod frame;
mod kind;

pub use frame::{usable_payload_size, Frame, ENVELOPE_OVERHEAD, PROTOCOL_VERSION};
pub use kind::MessageKind;

use serde::{Deserialize, Serialize};

/// The connection-control session (hello / ping / pong).
pub const CONTROL_SID: u64 = 0;

/// Envelope decode / limit errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("payload length mismatch: header says {declared}, frame has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("max payload size {limit} leaves no room after {overhead}-byte envelope")]
    PayloadLimit { limit: usize, overhead: usize },
    #[error("payload of {0} bytes does not fit the 32-bit length field")]
    PayloadTooLarge(usize),
}

/// Error category reported back to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgs,
    NotSupported,
    NotFound,
    Failed,
    Timeout,
    Cancelled,
    StreamClosed,
    NotConnected,
}

/// Payload of a [`MessageKind::Error`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Payload of a [`MessageKind::StreamResize`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

/// Agent → controller handshake, for transports that have one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_payload_size: usize,
}

/// Controller → agent handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub controller_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_wire_shape() {
        let p = ErrorPayload::new(ErrorKind::NotSupported, "unknown command: other(77)");
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "not_supported");
        assert_eq!(json["message"], "unknown command: other(77)");
    }

    #[test]
    fn hello_capabilities_default_empty() {
        let hello: Hello =
            serde_json::from_str(r#"{"node_id":"n1","version":"0.1.0","max_payload_size":1000}"#)
                .unwrap();
        assert!(hello.capabilities.is_empty());
    }
}
