//! In-process transport.  Each `connect` hands a fresh channel pair to a
//! [`MemoryListener`], which plays the controller side.  Used by tests and
//! by embedders that run the controller in the same process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use el_domain::config::ConnectivityMethod;
use el_node_sdk::chunk_payload;
use el_node_sdk::connectivity::{
    ClientLifecycle, ClientState, ConnectivityClient, InboundSink, TransportError, TransportFactory,
};
use el_protocol::{usable_payload_size, Frame, MessageKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const TRANSPORT_NAME: &str = "memory";

const CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Default)]
struct Shared {
    accepting: AtomicBool,
    dials: AtomicUsize,
}

/// Create a connected factory / listener pair.  The factory registers under
/// `name` so several in-process transports can coexist.
pub fn memory_transport(name: impl Into<String>) -> (MemoryFactory, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        accepting: AtomicBool::new(true),
        dials: AtomicUsize::new(0),
    });
    (
        MemoryFactory {
            name: name.into(),
            accept_tx,
            shared: shared.clone(),
        },
        MemoryListener { accept_rx, shared },
    )
}

pub struct MemoryFactory {
    name: String,
    accept_tx: mpsc::UnboundedSender<ControllerConn>,
    shared: Arc<Shared>,
}

impl TransportFactory for MemoryFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, method: &ConnectivityMethod) -> Result<(), TransportError> {
        usable_payload_size(method.max_payload_size)?;
        Ok(())
    }

    fn create(&self, method: &ConnectivityMethod) -> Result<Arc<dyn ConnectivityClient>, TransportError> {
        Ok(Arc::new(MemoryClient {
            name: self.name.clone(),
            max_payload: usable_payload_size(method.max_payload_size)?,
            accept_tx: self.accept_tx.clone(),
            shared: self.shared.clone(),
            lifecycle: ClientLifecycle::new(),
            to_controller: Mutex::new(None),
            from_controller: Mutex::new(None),
            closed: CancellationToken::new(),
        }))
    }
}

pub struct MemoryClient {
    name: String,
    max_payload: usize,
    accept_tx: mpsc::UnboundedSender<ControllerConn>,
    shared: Arc<Shared>,
    lifecycle: ClientLifecycle,
    to_controller: Mutex<Option<mpsc::Sender<Frame>>>,
    from_controller: Mutex<Option<mpsc::Receiver<Frame>>>,
    closed: CancellationToken,
}

#[async_trait]
impl ConnectivityClient for MemoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn state(&self) -> ClientState {
        self.lifecycle.state()
    }

    async fn connect(&self, _deadline: Instant) -> Result<(), TransportError> {
        self.lifecycle.expect(ClientState::Created)?;
        self.shared.dials.fetch_add(1, Ordering::SeqCst);
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::Dial("connection refused".into()));
        }

        let (agent_tx, agent_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CHANNEL_DEPTH);
        let conn = ControllerConn {
            to_agent: ctrl_tx,
            from_agent: agent_rx,
            max_payload: self.max_payload,
        };
        self.accept_tx
            .send(conn)
            .map_err(|_| TransportError::Dial("no listener".into()))?;

        *self.to_controller.lock() = Some(agent_tx);
        *self.from_controller.lock() = Some(ctrl_rx);
        self.lifecycle.mark_connected()
    }

    async fn start(&self, inbound: InboundSink, cancel: CancellationToken) -> Result<(), TransportError> {
        self.lifecycle.mark_started()?;
        let mut rx = self
            .from_controller
            .lock()
            .take()
            .ok_or(TransportError::NotConnected)?;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.closed.cancelled() => return Ok(()),
                frame = rx.recv() => frame,
            };
            match frame {
                Some(frame) => {
                    if inbound.send(frame).await.is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    async fn post_msg(&self, frame: Frame) -> Result<(), TransportError> {
        self.lifecycle.ensure_started()?;
        if frame.payload.len() > self.max_payload {
            return Err(TransportError::Other(format!(
                "payload of {} bytes exceeds {}",
                frame.payload.len(),
                self.max_payload
            )));
        }
        let tx = self
            .to_controller
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.lifecycle.mark_closed() {
            self.closed.cancel();
            self.to_controller.lock().take();
            self.from_controller.lock().take();
        }
        Ok(())
    }
}

// ── Controller side ──────────────────────────────────────────────────

/// Accepts in-process connections.
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<ControllerConn>,
    shared: Arc<Shared>,
}

impl MemoryListener {
    /// Next connection from the agent.
    pub async fn accept(&mut self) -> Option<ControllerConn> {
        self.accept_rx.recv().await
    }

    /// Refuse (or accept again) new connections.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Number of `connect` attempts so far, refused ones included.
    pub fn dials(&self) -> usize {
        self.shared.dials.load(Ordering::SeqCst)
    }
}

/// The controller end of one in-process connection.  Dropping it ends the
/// agent's `start` gracefully.
pub struct ControllerConn {
    to_agent: mpsc::Sender<Frame>,
    from_agent: mpsc::Receiver<Frame>,
    max_payload: usize,
}

impl ControllerConn {
    pub async fn send(&self, frame: Frame) -> bool {
        self.to_agent.send(frame).await.is_ok()
    }

    /// Send a whole message on `sid`, chunked to the connection's limit.
    pub async fn send_message(&self, kind: MessageKind, sid: u64, payload: impl Into<Bytes>) -> bool {
        for chunk in chunk_payload(payload.into(), self.max_payload) {
            let frame = Frame::new(kind, sid, chunk.seq, chunk.completed, chunk.data);
            if !self.send(frame).await {
                return false;
            }
        }
        true
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_agent.recv().await
    }

    /// Next frame within `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.from_agent.recv())
            .await
            .ok()
            .flatten()
    }

    /// Collect frames until a completed `Done` or `Error` arrives on `sid`.
    /// Returns every frame seen on `sid` in arrival order, the terminal one
    /// last.  Frames on other sids are skipped.
    pub async fn recv_reply(&mut self, sid: u64, timeout: Duration) -> Option<Vec<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout_at(deadline, self.from_agent.recv())
                .await
                .ok()??;
            if frame.sid != sid {
                continue;
            }
            let terminal =
                frame.completed && matches!(frame.kind, MessageKind::Done | MessageKind::Error);
            frames.push(frame);
            if terminal {
                return Some(frames);
            }
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload
    }
}

/// Concatenate the payloads of every frame of `kind`.
pub fn join_payloads(frames: &[Frame], kind: MessageKind) -> Bytes {
    let mut out = BytesMut::new();
    for frame in frames.iter().filter(|f| f.kind == kind) {
        out.extend_from_slice(&frame.payload);
    }
    out.freeze()
}
