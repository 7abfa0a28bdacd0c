//! In-crate fake transport for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use el_protocol::Frame;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connectivity::{ClientLifecycle, ClientState, ConnectivityClient, InboundSink, TransportError};

/// Records every posted frame.  Optionally fails after a number of sends.
/// Each send yields once so concurrent posters get a chance to interleave.
pub(crate) struct RecordingClient {
    lifecycle: ClientLifecycle,
    max_payload: usize,
    sent: Mutex<Vec<Frame>>,
    fail_after: Mutex<Option<usize>>,
}

impl RecordingClient {
    pub(crate) fn started(max_payload: usize) -> Arc<Self> {
        let client = Self {
            lifecycle: ClientLifecycle::new(),
            max_payload,
            sent: Mutex::new(Vec::new()),
            fail_after: Mutex::new(None),
        };
        client.lifecycle.mark_connected().unwrap();
        client.lifecycle.mark_started().unwrap();
        Arc::new(client)
    }

    pub(crate) fn fail_after(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }

    pub(crate) fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ConnectivityClient for RecordingClient {
    fn name(&self) -> &str {
        "recording"
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn state(&self) -> ClientState {
        self.lifecycle.state()
    }

    async fn connect(&self, _deadline: Instant) -> Result<(), TransportError> {
        self.lifecycle.mark_connected()
    }

    async fn start(&self, _inbound: InboundSink, cancel: CancellationToken) -> Result<(), TransportError> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn post_msg(&self, frame: Frame) -> Result<(), TransportError> {
        self.lifecycle.ensure_started()?;
        tokio::task::yield_now().await;
        let mut sent = self.sent.lock();
        if matches!(*self.fail_after.lock(), Some(n) if sent.len() >= n) {
            return Err(TransportError::Closed);
        }
        sent.push(frame);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lifecycle.mark_closed();
        Ok(())
    }
}
