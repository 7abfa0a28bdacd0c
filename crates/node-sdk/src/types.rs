//! Core types for command handling: context, results, and errors.

use std::time::Duration;

use bytes::Bytes;
use el_protocol::{ErrorKind, ErrorPayload, MessageKind, ProtocolError};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::chunked::ChunkedPoster;
use crate::connectivity::TransportError;
use crate::latency::FlushTiers;
use crate::streams::{SessionStreamRegistry, StreamEnds, StreamError, StreamGuard};

/// Context provided to every command handler invocation.
#[derive(Clone)]
pub struct SessionContext {
    /// Session the command arrived on; replies and output go to the same sid.
    pub sid: u64,
    /// Kind of the command being handled.
    pub kind: MessageKind,

    // ── Cancellation ─────────────────────────────────────────────
    /// Cancelled when the connection drops or the node shuts down, and
    /// when the controller closes the session before its stream is open.
    pub cancel: CancellationToken,

    // ── Output / streams ─────────────────────────────────────────
    pub poster: ChunkedPoster,
    pub streams: SessionStreamRegistry,
    pub flush: FlushTiers,
}

impl SessionContext {
    /// Post a complete message on this session, chunked as needed.
    pub async fn post(&self, kind: MessageKind, payload: impl Into<Bytes>) -> Result<u64, PostError> {
        self.poster.post(self.sid, kind, payload).await
    }

    /// Register this session in the stream registry.
    ///
    /// The entry lives as long as the returned guard.  Input the controller
    /// sent after the command but before this call is delivered first.
    pub fn open_stream<F>(&self, factory: F) -> Result<StreamGuard, HandlerError>
    where
        F: FnOnce() -> StreamEnds,
    {
        if self.cancel.is_cancelled() {
            return Err(HandlerError::Cancelled("session closed".into()));
        }
        self.streams.add(self.sid, factory).map_err(|e| match e {
            StreamError::AlreadyExists(sid) => {
                HandlerError::Failed(format!("stream session {sid} is already open"))
            }
        })
    }

    pub fn interactive_flush(&self) -> Duration {
        self.flush.interactive
    }

    pub fn bulk_flush(&self) -> Duration {
        self.flush.bulk
    }
}

/// Result type for command handlers.  `Ok` bytes become the `Done` payload.
pub type HandlerResult = Result<Bytes, HandlerError>;

/// Errors a command handler can return.
///
/// The dispatcher turns these into an `Error` message on the handler's
/// session.  Each variant maps 1:1 to an [`el_protocol::ErrorKind`].
#[derive(thiserror::Error, Debug, Clone)]
pub enum HandlerError {
    #[error("invalid_args: {0}")]
    InvalidArgs(String),
    #[error("not_supported: {0}")]
    NotSupported(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("failed: {0}")]
    Failed(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("stream_closed: {0}")]
    StreamClosed(String),
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::InvalidArgs(_) => ErrorKind::InvalidArgs,
            HandlerError::NotSupported(_) => ErrorKind::NotSupported,
            HandlerError::NotFound(_) => ErrorKind::NotFound,
            HandlerError::Failed(_) => ErrorKind::Failed,
            HandlerError::Timeout(_) => ErrorKind::Timeout,
            HandlerError::Cancelled(_) => ErrorKind::Cancelled,
            HandlerError::StreamClosed(_) => ErrorKind::StreamClosed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::InvalidArgs(m)
            | HandlerError::NotSupported(m)
            | HandlerError::NotFound(m)
            | HandlerError::Failed(m)
            | HandlerError::Timeout(m)
            | HandlerError::Cancelled(m)
            | HandlerError::StreamClosed(m) => m,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.kind(), self.message())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => HandlerError::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => HandlerError::Timeout(e.to_string()),
            _ => HandlerError::Failed(e.to_string()),
        }
    }
}

impl From<PostError> for HandlerError {
    fn from(e: PostError) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

/// Decode a JSON command payload.  An empty payload decodes as `{}`.
pub fn decode_args<T: DeserializeOwned>(payload: &[u8]) -> Result<T, HandlerError> {
    let raw: &[u8] = if payload.is_empty() { b"{}" } else { payload };
    serde_json::from_slice(raw).map_err(|e| HandlerError::InvalidArgs(e.to_string()))
}

/// Encode a JSON reply payload.
pub fn encode_reply<T: serde::Serialize>(value: &T) -> HandlerResult {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| HandlerError::Failed(format!("failed to encode reply: {e}")))
}

/// Failure to deliver an outbound message.
#[derive(thiserror::Error, Debug)]
pub enum PostError {
    #[error("no active connection")]
    NotConnected,
    #[error("send failed on sid {sid} seq {seq}: {source}")]
    Transport {
        sid: u64,
        seq: u64,
        #[source]
        source: TransportError,
    },
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top-level SDK error.
#[derive(thiserror::Error, Debug)]
pub enum NodeSdkError {
    #[error("config: {0}")]
    Config(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, serde::Deserialize)]
    struct Args {
        #[serde(default)]
        text: String,
    }

    #[test]
    fn error_kinds_map_one_to_one() {
        assert_eq!(HandlerError::InvalidArgs("x".into()).kind(), ErrorKind::InvalidArgs);
        assert_eq!(HandlerError::NotSupported("x".into()).kind(), ErrorKind::NotSupported);
        assert_eq!(HandlerError::StreamClosed("x".into()).kind(), ErrorKind::StreamClosed);
        let p = HandlerError::Timeout("too slow".into()).to_payload();
        assert_eq!(p, ErrorPayload::new(ErrorKind::Timeout, "too slow"));
    }

    #[test]
    fn empty_payload_decodes_as_empty_object() {
        let args: Args = decode_args(b"").unwrap();
        assert!(args.text.is_empty());
    }

    #[test]
    fn malformed_payload_is_invalid_args() {
        let err = decode_args::<Args>(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(HandlerError::from(io).kind(), ErrorKind::NotFound);
    }
}
