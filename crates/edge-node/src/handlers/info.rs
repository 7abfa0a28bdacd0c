use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use el_node_sdk::{encode_reply, CommandHandler, HandlerResult, SessionContext};
use serde::{Deserialize, Serialize};

/// `info` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub version: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub capabilities: Vec<String>,
}

/// `info`: node identity, uptime and capabilities.
///
/// Args: none.
pub struct Info {
    node_id: String,
    version: String,
    hostname: String,
    capabilities: Vec<String>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Info {
    pub fn new(node_id: String, version: &str, capabilities: Vec<String>) -> Self {
        Self {
            node_id,
            version: version.to_string(),
            hostname: hostname(),
            capabilities,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
impl CommandHandler for Info {
    async fn handle(&self, _ctx: SessionContext, _payload: Bytes) -> HandlerResult {
        encode_reply(&NodeInfo {
            node_id: self.node_id.clone(),
            version: self.version.clone(),
            hostname: self.hostname.clone(),
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            capabilities: self.capabilities.clone(),
        })
    }
}

/// Best-effort hostname.
fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown".into())
}
