//! Per-connection inbound routing.
//!
//! Stream-control frames take the fast path straight into the stream
//! registry; everything else goes through the reassembler and, once a
//! message is complete, to the dispatch table on a tracked task.  Routing
//! itself never awaits, so a slow handler or a slow outbound send cannot
//! stall inbound processing.

use std::sync::Arc;

use bytes::Bytes;
use el_protocol::{ErrorKind, Frame, MessageKind, TermSize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chunked::ChunkedPoster;
use crate::latency::FlushTiers;
use crate::reassembly::SeqReassembler;
use crate::registry::CommandDispatchTable;
use crate::streams::SessionStreamRegistry;
use crate::types::SessionContext;

pub(crate) struct InboundRouter {
    pub(crate) reassembler: SeqReassembler,
    pub(crate) table: Arc<CommandDispatchTable>,
    pub(crate) poster: ChunkedPoster,
    pub(crate) streams: SessionStreamRegistry,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) tracker: TaskTracker,
    /// Connection token; handler contexts get children of it.
    pub(crate) cancel: CancellationToken,
    pub(crate) flush: FlushTiers,
}

impl InboundRouter {
    /// Route frames in arrival order until the inbound channel closes or the
    /// connection is cancelled.
    pub(crate) async fn run(mut self, mut inbound: mpsc::Receiver<Frame>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.route(frame),
                    None => break,
                },
            }
        }
        self.reassembler.clear();
        tracing::debug!("inbound router stopped");
    }

    pub(crate) fn route(&mut self, frame: Frame) {
        let Frame {
            kind,
            sid,
            seq,
            completed,
            payload,
        } = frame;

        match kind {
            // ── Fast path ────────────────────────────────────────────
            MessageKind::StreamData => {
                if !self.streams.write(sid, seq, payload) {
                    tracing::debug!(sid, seq, "stream data for closed session");
                    self.reply_error(sid, ErrorKind::StreamClosed, "stream session is not open");
                }
            }
            MessageKind::StreamEof => self.streams.close_read(sid, seq),
            MessageKind::StreamResize => match serde_json::from_slice::<TermSize>(&payload) {
                Ok(size) => {
                    if !self.streams.resize(sid, size.cols, size.rows) {
                        tracing::debug!(sid, cols = size.cols, rows = size.rows, "resize not applied");
                    }
                }
                Err(e) => tracing::debug!(sid, error = %e, "malformed resize payload"),
            },
            MessageKind::SessionClose => {
                self.streams.close(sid);
                self.reassembler.forget(sid);
            }

            // ── Connection control ───────────────────────────────────
            MessageKind::Ping => self.spawn_post(sid, MessageKind::Pong, payload),
            MessageKind::Pong | MessageKind::Hello | MessageKind::Welcome => {
                tracing::trace!(sid, kind = %kind, "control message");
            }
            MessageKind::Done | MessageKind::Error | MessageKind::Stdout | MessageKind::Stderr => {
                tracing::debug!(sid, kind = %kind, "ignoring agent-bound reply kind");
            }

            // ── Commands ─────────────────────────────────────────────
            _ => match self.reassembler.push(sid, seq, completed, payload) {
                Ok(Some(message)) => self.dispatch(sid, kind, message),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(sid, kind = %kind, error = %e, "dropping session");
                    self.reply_error(sid, ErrorKind::InvalidArgs, e.to_string());
                }
            },
        }
    }

    fn dispatch(&self, sid: u64, kind: MessageKind, payload: Bytes) {
        let cancel = self.cancel.child_token();
        // Input sent right behind the command queues until the handler
        // opens its stream.
        let reservation = if self.table.contains(kind) {
            self.streams.reserve(sid, cancel.clone())
        } else {
            None
        };
        let ctx = SessionContext {
            sid,
            kind,
            cancel,
            poster: self.poster.clone(),
            streams: self.streams.clone(),
            flush: self.flush,
        };
        let table = self.table.clone();
        let semaphore = self.semaphore.clone();

        self.tracker.spawn(async move {
            let _reservation = reservation;
            // Acquire concurrency permit.
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                _ = ctx.cancel.cancelled() => return,
            };
            let Ok(_permit) = permit else {
                return;
            };
            table.dispatch(ctx, payload).await;
        });
    }

    fn spawn_post(&self, sid: u64, kind: MessageKind, payload: Bytes) {
        let poster = self.poster.clone();
        self.tracker.spawn(async move {
            if let Err(e) = poster.post(sid, kind, payload).await {
                tracing::debug!(sid, kind = %kind, error = %e, "failed to post reply");
            }
        });
    }

    fn reply_error(&self, sid: u64, kind: ErrorKind, message: impl Into<String>) {
        let poster = self.poster.clone();
        let message = message.into();
        self.tracker.spawn(async move {
            if let Err(e) = poster.post_error(sid, kind, message).await {
                tracing::debug!(sid, error = %e, "failed to post error reply");
            }
        });
    }
}
