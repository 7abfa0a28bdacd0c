use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Node identity, session limits and stream flush tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable node identifier reported in the transport handshake.
    #[serde(default = "d_node_id")]
    pub node_id: String,
    /// Interval between heartbeat pings on the control session.
    #[serde(default = "d_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Upper bound on command handlers running at the same time.
    #[serde(default = "d_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Out-of-order fragments buffered per session before it is dropped.
    #[serde(default = "d_max_pending_fragments")]
    pub max_pending_fragments: usize,
    /// Flush timeout for interactive streams (terminal latency).
    #[serde(default = "d_interactive_flush_ms")]
    pub interactive_flush_ms: u64,
    /// Flush timeout for bulk output such as logs (fewer, larger messages).
    #[serde(default = "d_bulk_flush_ms")]
    pub bulk_flush_ms: u64,
    /// Whether the host backend accepts `exec` commands.
    #[serde(default = "d_true")]
    pub allow_exec: bool,
    /// Whether the host backend accepts `port_forward` commands.
    #[serde(default)]
    pub allow_port_forward: bool,
    /// Directory `logs` requests are confined to.  `None` disables `logs`.
    #[serde(default)]
    pub logs_root: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: d_node_id(),
            heartbeat_interval_secs: d_heartbeat_secs(),
            max_concurrent_sessions: d_max_concurrent_sessions(),
            max_pending_fragments: d_max_pending_fragments(),
            interactive_flush_ms: d_interactive_flush_ms(),
            bulk_flush_ms: d_bulk_flush_ms(),
            allow_exec: true,
            allow_port_forward: false,
            logs_root: None,
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn interactive_flush(&self) -> Duration {
        Duration::from_millis(self.interactive_flush_ms)
    }

    pub fn bulk_flush(&self) -> Duration {
        Duration::from_millis(self.bulk_flush_ms)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_node_id() -> String {
    "edge-node".into()
}

fn d_heartbeat_secs() -> u64 {
    30
}

fn d_max_concurrent_sessions() -> usize {
    64
}

fn d_max_pending_fragments() -> usize {
    1024
}

fn d_interactive_flush_ms() -> u64 {
    20
}

fn d_bulk_flush_ms() -> u64 {
    200
}

fn d_true() -> bool {
    true
}
