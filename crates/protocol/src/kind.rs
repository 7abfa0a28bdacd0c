//! Message kinds carried in the frame envelope.

use std::fmt;

/// What a frame means.  Encoded on the wire as a `u16` code.
///
/// Codes the agent does not know decode to [`MessageKind::Other`] instead of
/// failing, so the router can still answer them with `not_supported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    // ── Connection control (sid 0) ───────────────────────────────────
    /// Agent → controller: first frame after a transport dial.
    Hello,
    /// Controller → agent: handshake accepted.
    Welcome,
    /// Bidirectional heartbeat.
    Ping,
    /// Heartbeat reply, echoes the ping payload.
    Pong,

    // ── Session lifecycle ────────────────────────────────────────────
    /// Either peer: tear the session down.
    SessionClose,
    /// Agent → controller: session-scoped failure (`ErrorPayload`).
    Error,
    /// Agent → controller: final result of a command.
    Done,

    // ── Interactive fast path (controller → agent) ───────────────────
    /// Raw stdin bytes for an open stream session.
    StreamData,
    /// Controller finished writing stdin.
    StreamEof,
    /// Terminal resize (`TermSize`).
    StreamResize,

    // ── Stream output (agent → controller) ───────────────────────────
    Stdout,
    Stderr,

    // ── Commands (reassembled, then dispatched) ──────────────────────
    Exec,
    Attach,
    Logs,
    PortForward,
    Metrics,
    Info,
    Echo,

    /// Any code this build does not know.
    Other(u16),
}

impl MessageKind {
    /// Wire code for this kind.
    pub fn code(self) -> u16 {
        match self {
            Self::Hello => 1,
            Self::Welcome => 2,
            Self::Ping => 3,
            Self::Pong => 4,
            Self::SessionClose => 10,
            Self::Error => 11,
            Self::Done => 12,
            Self::StreamData => 20,
            Self::StreamEof => 21,
            Self::StreamResize => 22,
            Self::Stdout => 30,
            Self::Stderr => 31,
            Self::Exec => 100,
            Self::Attach => 101,
            Self::Logs => 102,
            Self::PortForward => 103,
            Self::Metrics => 104,
            Self::Info => 105,
            Self::Echo => 106,
            Self::Other(code) => code,
        }
    }

    /// Decode a wire code.  Unknown codes map to [`MessageKind::Other`].
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::Hello,
            2 => Self::Welcome,
            3 => Self::Ping,
            4 => Self::Pong,
            10 => Self::SessionClose,
            11 => Self::Error,
            12 => Self::Done,
            20 => Self::StreamData,
            21 => Self::StreamEof,
            22 => Self::StreamResize,
            30 => Self::Stdout,
            31 => Self::Stderr,
            100 => Self::Exec,
            101 => Self::Attach,
            102 => Self::Logs,
            103 => Self::PortForward,
            104 => Self::Metrics,
            105 => Self::Info,
            106 => Self::Echo,
            other => Self::Other(other),
        }
    }

    /// Stream-control kinds that skip reassembly and dispatch.
    pub fn is_stream_control(self) -> bool {
        matches!(
            self,
            Self::StreamData | Self::StreamEof | Self::StreamResize | Self::SessionClose
        )
    }

    /// Lowercase name used in logs and capability lists.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Welcome => "welcome",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::SessionClose => "session_close",
            Self::Error => "error",
            Self::Done => "done",
            Self::StreamData => "stream_data",
            Self::StreamEof => "stream_eof",
            Self::StreamResize => "stream_resize",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Exec => "exec",
            Self::Attach => "attach",
            Self::Logs => "logs",
            Self::PortForward => "port_forward",
            Self::Metrics => "metrics",
            Self::Info => "info",
            Self::Echo => "echo",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "other({code})"),
            kind => f.write_str(kind.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_back() {
        for kind in [
            MessageKind::Hello,
            MessageKind::SessionClose,
            MessageKind::StreamData,
            MessageKind::Stderr,
            MessageKind::PortForward,
            MessageKind::Echo,
        ] {
            assert_eq!(MessageKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn unknown_code_is_other() {
        assert_eq!(MessageKind::from_code(9000), MessageKind::Other(9000));
        assert_eq!(MessageKind::Other(9000).code(), 9000);
        assert_eq!(MessageKind::Other(9000).to_string(), "other(9000)");
    }

    #[test]
    fn fast_path_kinds() {
        assert!(MessageKind::StreamData.is_stream_control());
        assert!(MessageKind::SessionClose.is_stream_control());
        assert!(!MessageKind::Exec.is_stream_control());
        assert!(!MessageKind::Ping.is_stream_control());
    }
}
