//! Connectivity orchestrator: walks the configured transports in priority
//! order, keeps one connection alive at a time, and wires each connection
//! to the inbound router, the heartbeat, and the command handlers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use el_domain::config::ConnectivityMethod;
use el_protocol::{Frame, MessageKind, CONTROL_SID};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chunked::{ChunkedPoster, SidLanes};
use crate::connectivity::{ActiveClient, ConnectivityClient, TransportError, TransportRegistry};
use crate::latency::FlushTiers;
use crate::reassembly::SeqReassembler;
use crate::reconnect::{BackoffPolicy, BackoffState};
use crate::registry::CommandDispatchTable;
use crate::router::InboundRouter;
use crate::streams::SessionStreamRegistry;
use crate::types::NodeSdkError;

const INBOUND_QUEUE_DEPTH: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A fully-configured node agent ready to connect to the controller.
///
/// Create via [`NodeAgentBuilder`](crate::builder::NodeAgentBuilder).
pub struct NodeAgent {
    pub(crate) node_id: String,
    /// Sorted by ascending priority.
    pub(crate) methods: Vec<ConnectivityMethod>,
    pub(crate) transports: TransportRegistry,
    pub(crate) handlers: Arc<CommandDispatchTable>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) max_concurrent_sessions: usize,
    pub(crate) max_pending_fragments: usize,
    pub(crate) flush: FlushTiers,
    pub(crate) shutdown_grace: Duration,
    pub(crate) backoff_jitter: f64,
    pub(crate) active: Arc<ActiveClient>,
    pub(crate) lanes: Arc<SidLanes>,
    pub(crate) streams: SessionStreamRegistry,
}

impl NodeAgent {
    /// Start a new builder.
    pub fn builder() -> crate::builder::NodeAgentBuilder {
        crate::builder::NodeAgentBuilder::new()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Transport identities (`name@index`) in the order they are tried.
    pub fn transport_ids(&self) -> Vec<String> {
        self.methods
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}@{}", m.name, i))
            .collect()
    }

    /// Poster bound to whichever connection is active, for messages that
    /// do not answer a command.
    pub fn poster(&self) -> ChunkedPoster {
        ChunkedPoster::with_lanes(self.active.clone(), self.lanes.clone())
    }

    /// Run the agent.  Connects over the highest-priority transport, serves
    /// it until it drops, then moves on to the next one, backing off per
    /// transport after failures.
    ///
    /// Transport errors never end the loop; it returns `Ok(())` once
    /// `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), NodeSdkError> {
        let mut backoff = BackoffState::new();
        let mut index = 0usize;

        tracing::info!(
            node_id = %self.node_id,
            transports = ?self.transport_ids(),
            commands = ?self.handlers.capabilities(),
            "node agent starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let method = &self.methods[index];
            let identity = format!("{}@{}", method.name, index);
            let policy = BackoffPolicy::from_method(method).with_jitter(self.backoff_jitter);

            let result = self.connect_and_serve(method, &identity, &shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }

            let delay = match result {
                Ok(()) => {
                    tracing::info!(transport = %identity, "connection closed gracefully");
                    backoff.reset(&identity);
                    policy.initial_delay
                }
                Err(e) => {
                    let delay = backoff.next(&identity, &policy);
                    tracing::warn!(
                        transport = %identity,
                        failures = backoff.failures(&identity),
                        error = %e,
                        "connection attempt failed"
                    );
                    delay
                }
            };

            index = (index + 1) % self.methods.len();
            tracing::info!(
                next = %format!("{}@{}", self.methods[index].name, index),
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.active.swap(None);
        self.streams.close_all();
        tracing::info!(node_id = %self.node_id, "node agent stopped");
        Ok(())
    }

    /// Same as [`run`](Self::run), but returns a `JoinHandle` for embedding
    /// in other runtimes.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<(), NodeSdkError>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// One connection lifecycle: create -> connect -> serve -> close.
    async fn connect_and_serve(
        &self,
        method: &ConnectivityMethod,
        identity: &str,
        shutdown: &CancellationToken,
    ) -> Result<(), TransportError> {
        let factory = self
            .transports
            .get(&method.name)
            .ok_or_else(|| TransportError::Config(format!("unknown transport: {}", method.name)))?;
        let client = factory.create(method)?;

        tracing::info!(transport = %identity, "connecting");
        let deadline = Instant::now() + method.dial_timeout();
        let dialed = tokio::select! {
            r = tokio::time::timeout_at(deadline, client.connect(deadline)) => {
                r.unwrap_or(Err(TransportError::DialTimeout))
            }
            _ = shutdown.cancelled() => {
                close_quietly(client.as_ref()).await;
                return Ok(());
            }
        };
        if let Err(e) = dialed {
            close_quietly(client.as_ref()).await;
            return Err(e);
        }

        tracing::info!(
            transport = %identity,
            max_payload_size = client.max_payload_size(),
            "connected"
        );

        let result = self.serve(client.clone(), shutdown).await;
        close_quietly(client.as_ref()).await;
        result
    }

    /// Serve a connected client until `start` returns, then tear the
    /// connection down.  Teardown runs whatever `start` returned.
    async fn serve(
        &self,
        client: Arc<dyn ConnectivityClient>,
        shutdown: &CancellationToken,
    ) -> Result<(), TransportError> {
        let conn_cancel = shutdown.child_token();
        let tracker = TaskTracker::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        // Handlers of this connection only ever post through this slot, so
        // stragglers cannot leak onto a later connection.
        let conn_slot = Arc::new(ActiveClient::new());
        conn_slot.swap(Some(client.clone()));
        self.active.swap(Some(client.clone()));
        let poster = ChunkedPoster::with_lanes(conn_slot.clone(), self.lanes.clone());

        let router = InboundRouter {
            reassembler: SeqReassembler::new(self.max_pending_fragments),
            table: self.handlers.clone(),
            poster: poster.clone(),
            streams: self.streams.clone(),
            semaphore: Arc::new(Semaphore::new(self.max_concurrent_sessions)),
            tracker: tracker.clone(),
            cancel: conn_cancel.clone(),
            flush: self.flush,
        };
        let router_task = tokio::spawn(router.run(inbound_rx));
        let heartbeat_task = tokio::spawn(heartbeat(poster, self.heartbeat_interval, conn_cancel.clone()));

        let result = client.start(inbound_tx, conn_cancel.clone()).await;

        self.active.swap(None);
        conn_slot.swap(None);
        conn_cancel.cancel();
        self.streams.close_all();

        if let Err(e) = router_task.await {
            tracing::error!(error = %e, "inbound router task failed");
        }
        let _ = heartbeat_task.await;

        tracker.close();
        if tokio::time::timeout(self.shutdown_grace, tracker.wait()).await.is_err() {
            tracing::warn!(
                pending = tracker.len(),
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "handler tasks still running after grace period"
            );
        }

        result
    }
}

/// Close `client`, giving up after [`CLOSE_TIMEOUT`] so a peer that stopped
/// reading cannot hold the agent.
async fn close_quietly(client: &dyn ConnectivityClient) {
    match tokio::time::timeout(CLOSE_TIMEOUT, client.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(transport = client.name(), error = %e, "close failed"),
        Err(_) => tracing::warn!(transport = client.name(), "close timed out"),
    }
}

/// Post `Ping{timestamp_ms}` on the control session every `interval`.
async fn heartbeat(poster: ChunkedPoster, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let timestamp = Utc::now().timestamp_millis();
                if let Err(e) = poster
                    .post(CONTROL_SID, MessageKind::Ping, timestamp.to_be_bytes().to_vec())
                    .await
                {
                    tracing::debug!(error = %e, "heartbeat ping failed");
                }
            }
        }
    }
}

/// Decode the timestamp carried by a heartbeat `Ping` / `Pong`.
pub fn heartbeat_timestamp(frame: &Frame) -> Option<i64> {
    let raw: [u8; 8] = frame.payload.as_ref().try_into().ok()?;
    Some(i64::from_be_bytes(raw))
}
