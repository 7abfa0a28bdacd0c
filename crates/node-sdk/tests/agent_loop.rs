//! Integration test: runs a real [`NodeAgent`] against in-process memory
//! transports and plays the controller side by hand.
//!
//! Covers the paths a unit test cannot see end to end:
//! - chunked command in, chunked `Done` out, through reassembly + dispatch
//! - unknown command kinds answer `not_supported` on the same sid
//! - stdin / EOF routing through the stream registry into a handler, even
//!   when it arrives before the handler has opened its stream
//! - heartbeat pings and ping → pong
//! - failover to the next transport, back-off, and cancellation mid-wait
//! - stream sessions are torn down when the connection drops

use std::time::Duration;

use bytes::Bytes;
use el_domain::config::ConnectivityMethod;
use el_node_sdk::{
    pump_output, stdin_pipe, BoundedLatencyReader, CommandDispatchTable, CommandHandler, ErrorKind,
    ErrorPayload, Frame, HandlerError, HandlerResult, MessageKind, NodeAgent, SessionContext,
    StreamEnds, TransportRegistry,
};
use el_transports::memory::{join_payloads, memory_transport, ControllerConn};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

// ── Test handlers ───────────────────────────────────────────────────────

struct Echo;

#[async_trait::async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, _ctx: SessionContext, payload: Bytes) -> HandlerResult {
        Ok(payload)
    }
}

/// Copies stdin to stdout until EOF, then reports the byte count.
struct Cat;

#[async_trait::async_trait]
impl CommandHandler for Cat {
    async fn handle(&self, ctx: SessionContext, _payload: Bytes) -> HandlerResult {
        let (tx, stdin) = stdin_pipe();
        let guard = ctx.open_stream(|| StreamEnds::none().with_stdin(tx))?;
        ctx.post(MessageKind::Stdout, "ready").await?;

        let sent = pump_output(
            BoundedLatencyReader::new(stdin),
            ctx.poster.clone(),
            ctx.sid,
            MessageKind::Stdout,
            ctx.interactive_flush(),
            guard.cancel_token().clone(),
        )
        .await?;
        Ok(Bytes::from(sent.to_string()))
    }
}

/// Holds a stream session open until it is closed from outside.
struct Hold;

#[async_trait::async_trait]
impl CommandHandler for Hold {
    async fn handle(&self, ctx: SessionContext, _payload: Bytes) -> HandlerResult {
        let guard = ctx.open_stream(StreamEnds::none)?;
        ctx.post(MessageKind::Stdout, "ready").await?;
        tokio::select! {
            _ = guard.cancel_token().cancelled() => {}
            _ = ctx.cancel.cancelled() => {}
        }
        Err(HandlerError::Cancelled("session closed".into()))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn method(name: &str, priority: i32) -> ConnectivityMethod {
    let mut m = ConnectivityMethod::new(name, priority);
    // 8 payload bytes per frame so small messages get chunked.
    m.max_payload_size = 32;
    m.initial_backoff_ms = 10;
    m.max_backoff_ms = 50;
    m.dial_timeout_ms = 1_000;
    m
}

fn handlers() -> CommandDispatchTable {
    let mut table = CommandDispatchTable::new();
    table
        .register(MessageKind::Echo, Echo)
        .register(MessageKind::Exec, Cat)
        .register(MessageKind::Attach, Hold);
    table
}

/// Reassemble the (chunked) `Error` reply among `frames`.
fn error_payload(frames: &[Frame]) -> ErrorPayload {
    assert_eq!(frames.last().map(|f| f.kind), Some(MessageKind::Error));
    serde_json::from_slice(&join_payloads(frames, MessageKind::Error)).unwrap()
}

/// Skip frames until one on `sid` of `kind` arrives.
async fn wait_for(conn: &mut ControllerConn, sid: u64, kind: MessageKind) -> Frame {
    loop {
        let frame = conn
            .recv_timeout(WAIT)
            .await
            .unwrap_or_else(|| panic!("timeout waiting for {kind} on sid {sid}"));
        if frame.sid == sid && frame.kind == kind {
            return frame;
        }
    }
}

struct Harness {
    conn: ControllerConn,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), el_node_sdk::NodeSdkError>>,
}

async fn start_agent() -> (Harness, el_transports::MemoryListener) {
    let (factory, mut listener) = memory_transport("memory");
    let mut transports = TransportRegistry::new();
    transports.register(factory);

    let agent = NodeAgent::builder()
        .node_id("test-node")
        .method(method("memory", 0))
        .transports(transports)
        .handlers(handlers())
        .heartbeat_interval(Duration::from_millis(50))
        .shutdown_grace(Duration::from_millis(200))
        .build()
        .unwrap();

    let shutdown = CancellationToken::new();
    let task = agent.spawn(shutdown.clone());
    let conn = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("agent did not connect")
        .unwrap();
    (
        Harness {
            conn,
            shutdown,
            task,
        },
        listener,
    )
}

impl Harness {
    async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(WAIT, self.task)
            .await
            .expect("agent did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn chunked_echo_roundtrip() {
    let (mut h, _listener) = start_agent().await;

    let body = "the quick brown fox jumps over the lazy dog";
    assert!(h.conn.send_message(MessageKind::Echo, 11, body).await);

    let reply = h.conn.recv_reply(11, WAIT).await.expect("no reply");
    assert!(reply.len() > 1, "reply should be chunked");
    assert!(reply.iter().all(|f| f.payload.len() <= 8));
    assert_eq!(&join_payloads(&reply, MessageKind::Done)[..], body.as_bytes());

    h.stop().await;
}

#[tokio::test]
async fn unknown_kind_is_not_supported_on_same_sid() {
    let (mut h, _listener) = start_agent().await;

    assert!(h.conn.send_message(MessageKind::Metrics, 21, "{}").await);
    let reply = h.conn.recv_reply(21, WAIT).await.expect("no reply");
    let err = error_payload(&reply);
    assert_eq!(err.kind, ErrorKind::NotSupported);

    // The connection keeps working.
    assert!(h.conn.send_message(MessageKind::Echo, 22, "ok").await);
    let reply = h.conn.recv_reply(22, WAIT).await.expect("no reply");
    assert_eq!(&join_payloads(&reply, MessageKind::Done)[..], b"ok");

    h.stop().await;
}

#[tokio::test]
async fn stdin_flows_through_stream_registry() {
    let (mut h, _listener) = start_agent().await;

    assert!(h.conn.send_message(MessageKind::Exec, 5, "{}").await);
    let ready = wait_for(&mut h.conn, 5, MessageKind::Stdout).await;
    assert_eq!(&ready.payload[..], b"ready");

    assert!(h.conn.send(Frame::single(MessageKind::StreamData, 5, "abc")).await);
    assert!(h.conn.send(Frame::single(MessageKind::StreamData, 5, "def")).await);
    assert!(h.conn.send(Frame::single(MessageKind::StreamEof, 5, Bytes::new())).await);

    let reply = h.conn.recv_reply(5, WAIT).await.expect("no reply");
    assert_eq!(&join_payloads(&reply, MessageKind::Stdout)[..], b"abcdef");
    assert!(reply
        .iter()
        .filter(|f| f.kind == MessageKind::Stdout)
        .all(|f| f.seq == 0 && f.completed));
    assert_eq!(&join_payloads(&reply, MessageKind::Done)[..], b"6");

    h.stop().await;
}

#[tokio::test]
async fn stdin_sent_with_the_command_is_not_lost() {
    let (mut h, _listener) = start_agent().await;

    assert!(h.conn.send_message(MessageKind::Exec, 6, "{}").await);
    assert!(h.conn.send(Frame::single(MessageKind::StreamData, 6, "abc")).await);
    assert!(h.conn.send(Frame::single(MessageKind::StreamEof, 6, Bytes::new())).await);

    let reply = h.conn.recv_reply(6, WAIT).await.expect("no reply");
    assert!(reply.iter().all(|f| f.kind != MessageKind::Error));
    assert_eq!(&join_payloads(&reply, MessageKind::Stdout)[..], b"readyabc");
    assert_eq!(&join_payloads(&reply, MessageKind::Done)[..], b"3");

    h.stop().await;
}

#[tokio::test]
async fn stream_data_without_session_is_stream_closed() {
    let (mut h, _listener) = start_agent().await;

    assert!(h.conn.send(Frame::single(MessageKind::StreamData, 77, "x")).await);
    let reply = h.conn.recv_reply(77, WAIT).await.expect("no reply");
    let err = error_payload(&reply);
    assert_eq!(err.kind, ErrorKind::StreamClosed);

    h.stop().await;
}

#[tokio::test]
async fn heartbeat_and_pong() {
    let (mut h, _listener) = start_agent().await;

    let ping = wait_for(&mut h.conn, 0, MessageKind::Ping).await;
    assert!(el_node_sdk::heartbeat_timestamp(&ping).is_some());

    assert!(h.conn.send(Frame::single(MessageKind::Ping, 0, vec![7u8; 8])).await);
    let pong = wait_for(&mut h.conn, 0, MessageKind::Pong).await;
    assert_eq!(&pong.payload[..], &[7u8; 8]);

    h.stop().await;
}

#[tokio::test]
async fn dropped_connection_closes_streams_and_reconnects() {
    let (mut h, mut listener) = start_agent().await;

    assert!(h.conn.send_message(MessageKind::Attach, 9, "{}").await);
    wait_for(&mut h.conn, 9, MessageKind::Stdout).await;

    // Controller hangs up; the agent reconnects over the same transport.
    let Harness {
        conn,
        shutdown,
        task,
    } = h;
    drop(conn);
    let mut conn = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("agent did not reconnect")
        .unwrap();

    assert!(conn.send(Frame::single(MessageKind::StreamData, 9, "late")).await);
    let reply = conn.recv_reply(9, WAIT).await.expect("no reply");
    let err = error_payload(&reply);
    assert_eq!(err.kind, ErrorKind::StreamClosed);

    Harness {
        conn,
        shutdown,
        task,
    }
    .stop()
    .await;
}

#[tokio::test]
async fn fails_over_to_next_priority() {
    let (primary, primary_listener) = memory_transport("primary");
    let (secondary, mut secondary_listener) = memory_transport("secondary");
    primary_listener.set_accepting(false);

    let mut transports = TransportRegistry::new();
    transports.register(primary).register(secondary);

    // Listed out of order on purpose; priority decides.
    let agent = NodeAgent::builder()
        .methods(vec![method("secondary", 5), method("primary", 1)])
        .transports(transports)
        .handlers(handlers())
        .build()
        .unwrap();
    assert_eq!(agent.transport_ids(), vec!["primary@0", "secondary@1"]);

    let shutdown = CancellationToken::new();
    let task = agent.spawn(shutdown.clone());

    let mut conn = tokio::time::timeout(WAIT, secondary_listener.accept())
        .await
        .expect("agent never reached the secondary transport")
        .unwrap();
    assert!(primary_listener.dials() >= 1);

    assert!(conn.send_message(MessageKind::Echo, 1, "hi").await);
    let reply = conn.recv_reply(1, WAIT).await.expect("no reply");
    assert_eq!(&join_payloads(&reply, MessageKind::Done)[..], b"hi");

    shutdown.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let (factory, listener) = memory_transport("memory");
    listener.set_accepting(false);
    let mut transports = TransportRegistry::new();
    transports.register(factory);

    let mut m = method("memory", 0);
    m.initial_backoff_ms = 60_000;
    m.max_backoff_ms = 60_000;

    let shutdown = CancellationToken::new();
    let task = NodeAgent::builder()
        .method(m)
        .transports(transports)
        .build()
        .unwrap()
        .spawn(shutdown.clone());

    tokio::time::timeout(WAIT, async {
        while listener.dials() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("agent never dialed");

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("agent kept sleeping after cancellation")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(listener.dials(), 1);
}
