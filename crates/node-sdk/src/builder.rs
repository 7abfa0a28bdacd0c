//! Builder pattern for constructing a [`NodeAgent`].

use std::sync::Arc;
use std::time::Duration;

use el_domain::config::{sort_by_priority, AgentConfig, ConnectivityMethod};

use crate::client::NodeAgent;
use crate::chunked::SidLanes;
use crate::connectivity::{ActiveClient, TransportRegistry};
use crate::latency::FlushTiers;
use crate::reassembly::DEFAULT_MAX_PENDING;
use crate::registry::CommandDispatchTable;
use crate::streams::SessionStreamRegistry;
use crate::types::NodeSdkError;

/// Fluent builder for [`NodeAgent`].
///
/// # Example
///
/// ```rust,no_run
/// # use el_node_sdk::{CommandDispatchTable, NodeAgentBuilder, TransportRegistry};
/// # use el_domain::config::ConnectivityMethod;
/// # fn demo(transports: TransportRegistry, handlers: CommandDispatchTable) {
/// let agent = NodeAgentBuilder::new()
///     .node_id("edge-7")
///     .method(ConnectivityMethod::new("websocket", 0))
///     .transports(transports)
///     .handlers(handlers)
///     .heartbeat_interval(std::time::Duration::from_secs(30))
///     .build()
///     .unwrap();
/// # }
/// ```
pub struct NodeAgentBuilder {
    node_id: String,
    methods: Vec<ConnectivityMethod>,
    transports: TransportRegistry,
    handlers: CommandDispatchTable,
    heartbeat_interval: Duration,
    max_concurrent_sessions: usize,
    max_pending_fragments: usize,
    flush: FlushTiers,
    shutdown_grace: Duration,
    backoff_jitter: f64,
}

impl NodeAgentBuilder {
    pub fn new() -> Self {
        Self {
            node_id: "edge-node".into(),
            methods: Vec::new(),
            transports: TransportRegistry::new(),
            handlers: CommandDispatchTable::new(),
            heartbeat_interval: Duration::from_secs(30),
            max_concurrent_sessions: 64,
            max_pending_fragments: DEFAULT_MAX_PENDING,
            flush: FlushTiers::default(),
            shutdown_grace: Duration::from_secs(5),
            backoff_jitter: 0.0,
        }
    }

    /// Take identity, limits and flush tiers from the `[agent]` section.
    pub fn config(mut self, cfg: &AgentConfig) -> Self {
        self.node_id = cfg.node_id.clone();
        self.heartbeat_interval = cfg.heartbeat_interval();
        self.max_concurrent_sessions = cfg.max_concurrent_sessions;
        self.max_pending_fragments = cfg.max_pending_fragments;
        self.flush = FlushTiers {
            interactive: cfg.interactive_flush(),
            bulk: cfg.bulk_flush(),
        };
        self
    }

    // ── Connectivity ─────────────────────────────────────────────────

    /// Replace the connectivity methods.
    pub fn methods(mut self, methods: Vec<ConnectivityMethod>) -> Self {
        self.methods = methods;
        self
    }

    /// Append one connectivity method.
    pub fn method(mut self, method: ConnectivityMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = transports;
        self
    }

    pub fn handlers(mut self, handlers: CommandDispatchTable) -> Self {
        self.handlers = handlers;
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = id.into();
        self
    }

    /// Override the heartbeat interval (default 30s).
    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    /// Maximum concurrent command handlers (default 64).
    pub fn max_concurrent_sessions(mut self, n: usize) -> Self {
        self.max_concurrent_sessions = n;
        self
    }

    /// Out-of-order fragments buffered per session (default 1024).
    pub fn max_pending_fragments(mut self, n: usize) -> Self {
        self.max_pending_fragments = n;
        self
    }

    pub fn flush_tiers(mut self, flush: FlushTiers) -> Self {
        self.flush = flush;
        self
    }

    /// How long teardown waits for handler tasks (default 5s).
    pub fn shutdown_grace(mut self, d: Duration) -> Self {
        self.shutdown_grace = d;
        self
    }

    /// Extra share of each back-off wait, in `[0, 1]` (default 0).
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    /// Build the [`NodeAgent`].  Every configuration problem the agent
    /// cannot recover from at run time is reported here.
    pub fn build(mut self) -> Result<NodeAgent, NodeSdkError> {
        if self.node_id.trim().is_empty() {
            return Err(NodeSdkError::Config("node_id is required".into()));
        }
        if self.methods.is_empty() {
            return Err(NodeSdkError::Config(
                "at least one connectivity method is required".into(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(NodeSdkError::Config(
                "max_concurrent_sessions must be greater than 0".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(NodeSdkError::Config(
                "heartbeat_interval must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(NodeSdkError::Config("backoff_jitter must be within [0, 1]".into()));
        }

        for (i, method) in self.methods.iter().enumerate() {
            let field = format!("connectivity[{i}] ({})", method.name);
            if method.initial_backoff_ms == 0 || method.initial_backoff_ms > method.max_backoff_ms {
                return Err(NodeSdkError::Config(format!(
                    "{field}: backoff must satisfy 0 < initial <= max"
                )));
            }
            if !method.backoff_factor.is_finite() || method.backoff_factor < 1.0 {
                return Err(NodeSdkError::Config(format!(
                    "{field}: backoff_factor must be a finite number >= 1.0"
                )));
            }
            if method.dial_timeout_ms == 0 {
                return Err(NodeSdkError::Config(format!(
                    "{field}: dial_timeout_ms must be greater than 0"
                )));
            }
            let factory = self.transports.get(&method.name).ok_or_else(|| {
                NodeSdkError::Config(format!(
                    "{field}: unknown transport (registered: {})",
                    self.transports.names().join(", ")
                ))
            })?;
            factory
                .validate(method)
                .map_err(|e| NodeSdkError::Config(format!("{field}: {e}")))?;
        }

        sort_by_priority(&mut self.methods);

        Ok(NodeAgent {
            node_id: self.node_id,
            methods: self.methods,
            transports: self.transports,
            handlers: Arc::new(self.handlers),
            heartbeat_interval: self.heartbeat_interval,
            max_concurrent_sessions: self.max_concurrent_sessions,
            max_pending_fragments: self.max_pending_fragments.max(1),
            flush: self.flush,
            shutdown_grace: self.shutdown_grace,
            backoff_jitter: self.backoff_jitter,
            active: Arc::new(ActiveClient::new()),
            lanes: Arc::new(SidLanes::new()),
            streams: SessionStreamRegistry::new(),
        })
    }
}

impl Default for NodeAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}
