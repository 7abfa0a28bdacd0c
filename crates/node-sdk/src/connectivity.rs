//! Transport abstraction: the [`ConnectivityClient`] trait every transport
//! implements, its lifecycle, the active-client slot used for outbound
//! traffic, and the factory registry the orchestrator builds clients from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use el_domain::config::ConnectivityMethod;
use el_protocol::{Frame, ProtocolError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where a started client delivers decoded inbound frames, in arrival order.
pub type InboundSink = mpsc::Sender<Frame>;

/// Transport-level failures.  All of them are recoverable: the orchestrator
/// logs them and moves on to back-off.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("dial timed out")]
    DialTimeout,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: ClientState,
        actual: ClientState,
    },
    #[error("config: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Connected,
    Started,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientState::Created => "created",
            ClientState::Connected => "connected",
            ClientState::Started => "started",
            ClientState::Closed => "closed",
        })
    }
}

/// Strictly linear `Created → Connected → Started → Closed` state holder
/// for transport implementations.  `Closed` is reachable from anywhere.
#[derive(Debug)]
pub struct ClientLifecycle {
    state: Mutex<ClientState>,
}

impl Default for ClientLifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(ClientState::Created),
        }
    }
}

impl ClientLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// `Created → Connected`.
    pub fn mark_connected(&self) -> Result<(), TransportError> {
        self.advance(ClientState::Created, ClientState::Connected)
    }

    /// `Connected → Started`.
    pub fn mark_started(&self) -> Result<(), TransportError> {
        self.advance(ClientState::Connected, ClientState::Started)
    }

    /// Move to `Closed`.  Returns `false` if it already was closed.
    pub fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        let was_open = *state != ClientState::Closed;
        *state = ClientState::Closed;
        was_open
    }

    /// Check that the client may carry traffic.
    pub fn ensure_started(&self) -> Result<(), TransportError> {
        match self.state() {
            ClientState::Started => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    pub fn expect(&self, expected: ClientState) -> Result<(), TransportError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(TransportError::InvalidState { expected, actual })
        }
    }

    fn advance(&self, from: ClientState, to: ClientState) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(TransportError::InvalidState {
                expected: from,
                actual: *state,
            });
        }
        *state = to;
        Ok(())
    }
}

// ── Client trait ─────────────────────────────────────────────────────

/// One connection to the controller over some transport.
///
/// Implementations are used through `Arc<dyn ConnectivityClient>` and keep
/// their mutable state behind interior mutability.  A client is used for
/// exactly one connection; the orchestrator builds a fresh one per attempt.
#[async_trait]
pub trait ConnectivityClient: Send + Sync + 'static {
    /// Transport name, e.g. `"websocket"`.
    fn name(&self) -> &str;

    /// Largest payload one frame may carry, envelope overhead already
    /// subtracted.  Always `> 0`.
    fn max_payload_size(&self) -> usize;

    fn state(&self) -> ClientState;

    /// Establish the connection (and any transport handshake) before
    /// `deadline`.
    async fn connect(&self, deadline: Instant) -> Result<(), TransportError>;

    /// Deliver inbound frames to `inbound` until the connection ends or
    /// `cancel` fires.  Returns `Ok(())` on graceful end or cancellation.
    async fn start(&self, inbound: InboundSink, cancel: CancellationToken) -> Result<(), TransportError>;

    /// Send one frame.  Fails with [`TransportError::NotConnected`] unless
    /// the client is started.
    async fn post_msg(&self, frame: Frame) -> Result<(), TransportError>;

    /// Release the connection.  Safe to call in any state, more than once.
    async fn close(&self) -> Result<(), TransportError>;
}

// ── Active client slot ───────────────────────────────────────────────

/// The client currently used for outbound traffic, if any.
#[derive(Default)]
pub struct ActiveClient {
    slot: RwLock<Option<Arc<dyn ConnectivityClient>>>,
}

impl ActiveClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `client` (or clear with `None`), returning the previous one.
    pub fn swap(&self, client: Option<Arc<dyn ConnectivityClient>>) -> Option<Arc<dyn ConnectivityClient>> {
        std::mem::replace(&mut *self.slot.write(), client)
    }

    pub fn current(&self) -> Option<Arc<dyn ConnectivityClient>> {
        self.slot.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.slot.read().is_some()
    }
}

impl fmt::Debug for ActiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.slot.read().as_ref().map(|c| c.name().to_string());
        f.debug_struct("ActiveClient").field("client", &name).finish()
    }
}

// ── Factories ────────────────────────────────────────────────────────

/// Builds clients for one transport name from its connectivity method.
pub trait TransportFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Check the method's options and limits.  Called once at build time;
    /// errors are fatal configuration errors.
    fn validate(&self, method: &ConnectivityMethod) -> Result<(), TransportError>;

    /// Create a fresh client in the `Created` state.
    fn create(&self, method: &ConnectivityMethod) -> Result<Arc<dyn ConnectivityClient>, TransportError>;
}

/// Transport factories by (lowercase) name, assembled by the composition
/// root.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its own name.  A later registration with
    /// the same name replaces the earlier one.
    pub fn register<F: TransportFactory>(&mut self, factory: F) -> &mut Self {
        self.register_arc(Arc::new(factory))
    }

    pub fn register_arc(&mut self, factory: Arc<dyn TransportFactory>) -> &mut Self {
        self.factories
            .insert(factory.name().to_ascii_lowercase(), factory);
        self
    }

    /// Look up a factory by transport name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Registered transport names (sorted).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFactory(&'static str);

    impl TransportFactory for NullFactory {
        fn name(&self) -> &str {
            self.0
        }
        fn validate(&self, _method: &ConnectivityMethod) -> Result<(), TransportError> {
            Ok(())
        }
        fn create(&self, _method: &ConnectivityMethod) -> Result<Arc<dyn ConnectivityClient>, TransportError> {
            Err(TransportError::Other("null".into()))
        }
    }

    #[test]
    fn lifecycle_is_linear() {
        let lc = ClientLifecycle::new();
        assert_eq!(lc.state(), ClientState::Created);
        assert!(lc.mark_started().is_err());
        lc.mark_connected().unwrap();
        assert!(lc.mark_connected().is_err());
        assert!(matches!(lc.ensure_started(), Err(TransportError::NotConnected)));
        lc.mark_started().unwrap();
        lc.ensure_started().unwrap();
        assert!(lc.mark_closed());
        assert!(!lc.mark_closed());
        assert!(lc.mark_connected().is_err());
    }

    #[test]
    fn invalid_state_reports_both_states() {
        let lc = ClientLifecycle::new();
        let err = lc.expect(ClientState::Started).unwrap_err();
        assert_eq!(err.to_string(), "invalid state: expected started, was created");
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let mut reg = TransportRegistry::new();
        reg.register(NullFactory("WebSocket")).register(NullFactory("memory"));
        assert!(reg.get("websocket").is_some());
        assert!(reg.get("MEMORY").is_some());
        assert!(reg.get("mqtt").is_none());
        assert_eq!(reg.names(), vec!["memory", "websocket"]);
    }

    #[test]
    fn empty_slot_is_disconnected() {
        let slot = ActiveClient::new();
        assert!(!slot.is_connected());
        assert!(slot.current().is_none());
        assert!(slot.swap(None).is_none());
    }
}
