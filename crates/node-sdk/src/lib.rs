//! `el-node-sdk`: the EdgeLink agent core.
//!
//! A node keeps one long-lived connection to the controller over whichever
//! configured transport works, and multiplexes many independent sessions
//! over it.  Each session carries one command (exec, logs, port_forward,
//! ...) with its interactive input and its output streams.  This crate owns
//! everything between the transport and the command handlers: chunking,
//! reassembly, dispatch, stream routing, output batching and reconnection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  NodeAgent (orchestrator)                                    │
//! │    methods by priority ─► TransportFactory ─► client         │
//! │    backoff per name@index, heartbeat on sid 0                │
//! │                                                              │
//! │  client.start(inbound) ──► InboundRouter                     │
//! │     StreamData/Eof/Resize/Close ─► SessionStreamRegistry     │
//! │     Ping ─► Pong                                             │
//! │     commands ─► SeqReassembler ─► CommandDispatchTable       │
//! │                                     │ (semaphore, tracked)   │
//! │                                     ▼                        │
//! │                             CommandHandler::handle           │
//! │                                     │                        │
//! │  ChunkedPoster ◄── Done / Error / Stdout / Stderr ◄──────────┘
//! │       └─► ActiveClient ─► client.post_msg(frame)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow
//!
//! 1. Sort connectivity methods by ascending priority.
//! 2. Create a client for the next method and `connect` it within the
//!    method's dial timeout.
//! 3. Install it as the active client, start the router and heartbeat, and
//!    `start` the client.
//! 4. When `start` returns: clear the active client, cancel in-flight
//!    handlers, close every stream session, wait (bounded) for handlers.
//! 5. On failure back off (1s, 2s, 4s, ... capped) for that transport, then
//!    try the next method.
//!
//! # Example
//!
//! ```rust,no_run
//! # use el_node_sdk::{CommandDispatchTable, NodeAgent, TransportRegistry};
//! # use el_domain::config::ConnectivityMethod;
//! # async fn demo(transports: TransportRegistry, handlers: CommandDispatchTable) {
//! let shutdown = tokio_util::sync::CancellationToken::new();
//! NodeAgent::builder()
//!     .node_id("edge-7")
//!     .method(ConnectivityMethod::new("websocket", 0))
//!     .transports(transports)
//!     .handlers(handlers)
//!     .build()
//!     .unwrap()
//!     .run(shutdown)
//!     .await
//!     .unwrap();
//! # }
//! ```

pub mod builder;
pub mod chunked;
pub mod client;
pub mod connectivity;
pub mod latency;
pub mod reassembly;
pub mod reconnect;
pub mod registry;
mod router;
pub mod streams;
pub mod types;

#[cfg(test)]
mod test_support;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::NodeAgentBuilder;
pub use chunked::{chunk_payload, Chunk, ChunkedPoster, SidLanes};
pub use client::{heartbeat_timestamp, NodeAgent};
pub use connectivity::{
    ActiveClient, ClientLifecycle, ClientState, ConnectivityClient, InboundSink, TransportError,
    TransportFactory, TransportRegistry,
};
pub use latency::{pump_output, BoundedLatencyReader, FlushTiers};
pub use reassembly::{ReassemblyError, SeqReassembler};
pub use reconnect::{BackoffPolicy, BackoffState};
pub use registry::{CommandDispatchTable, CommandHandler};
pub use streams::{
    stdin_pipe, stdin_pipe_with_limit, SessionStreamRegistry, StdinError, StdinReader, StdinSender, StreamEnds,
    StreamError, StreamGuard, STDIN_QUEUE_LIMIT,
};
pub use types::{decode_args, encode_reply, HandlerError, HandlerResult, NodeSdkError, PostError, SessionContext};

// Re-export protocol types so handlers and transports rarely need el-protocol directly.
pub use el_protocol::{ErrorKind, ErrorPayload, Frame, MessageKind, TermSize, CONTROL_SID};
