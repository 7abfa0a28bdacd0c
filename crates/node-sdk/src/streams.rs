//! Session stream registry: routes interactive input (stdin bytes, EOF,
//! terminal resizes) straight to the handler that owns a session, bypassing
//! reassembly and dispatch.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use el_protocol::TermSize;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream session {0} already exists")]
    AlreadyExists(u64),
}

/// Most input bytes a session may have queued and not yet read.
pub const STDIN_QUEUE_LIMIT: usize = 1024 * 1024;

// ── Stdin pipe ───────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinError {
    #[error("stdin reader is gone")]
    Closed,
    #[error("stdin queue is full")]
    Full,
}

/// Write end of a session's stdin pipe.
#[derive(Clone, Debug)]
pub struct StdinSender {
    tx: mpsc::UnboundedSender<Bytes>,
    queued: Arc<AtomicUsize>,
    limit: usize,
}

impl StdinSender {
    /// Queue `data` without waiting.  Refused once the reader is more than
    /// the pipe's byte limit behind.
    pub fn send(&self, data: Bytes) -> Result<(), StdinError> {
        let len = data.len();
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                queued.checked_add(len).filter(|total| *total <= self.limit)
            })
            .map_err(|_| StdinError::Full)?;
        if self.tx.send(data).is_err() {
            self.queued.fetch_sub(len, Ordering::AcqRel);
            return Err(StdinError::Closed);
        }
        Ok(())
    }
}

/// Create a stdin pipe holding at most [`STDIN_QUEUE_LIMIT`] unread bytes.
/// Writes never block the router; the reader sees EOF once every sender is
/// dropped.
pub fn stdin_pipe() -> (StdinSender, StdinReader) {
    stdin_pipe_with_limit(STDIN_QUEUE_LIMIT)
}

pub fn stdin_pipe_with_limit(limit: usize) -> (StdinSender, StdinReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    (
        StdinSender {
            tx,
            queued: queued.clone(),
            limit,
        },
        StdinReader {
            rx,
            queued,
            pending: Bytes::new(),
        },
    )
}

/// Read end of a stdin pipe.
pub struct StdinReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    queued: Arc<AtomicUsize>,
    pending: Bytes,
}

impl AsyncRead for StdinReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.queued.fetch_sub(chunk.len(), Ordering::AcqRel);
                    self.pending = chunk;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// What a handler hands the registry when it opens a stream session.
#[derive(Default)]
pub struct StreamEnds {
    pub stdin: Option<StdinSender>,
    pub resize: Option<watch::Sender<TermSize>>,
}

impl StreamEnds {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, stdin: StdinSender) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn with_resize(mut self, resize: watch::Sender<TermSize>) -> Self {
        self.resize = Some(resize);
        self
    }
}

enum Input {
    /// The command is dispatched but its handler has not opened the stream
    /// yet; input waits here.
    Early {
        queued: Vec<Bytes>,
        bytes: usize,
        eof: bool,
        size: Option<TermSize>,
    },
    Open {
        stdin: Option<StdinSender>,
        resize: Option<watch::Sender<TermSize>>,
    },
}

struct StreamSession {
    generation: u64,
    input: Input,
    cancel: CancellationToken,
    last_seq: Option<u64>,
}

#[derive(Default)]
struct Inner {
    sessions: Mutex<HashMap<u64, StreamSession>>,
    generation: AtomicU64,
}

/// Map of live interactive sessions.  Cheap to clone; clones share state.
///
/// The lock guards the map only.  Stdin sends never wait, and the queue
/// left by an early session is handed over under the lock so it stays
/// ahead of later input.
#[derive(Clone, Default)]
pub struct SessionStreamRegistry {
    inner: Arc<Inner>,
}

impl SessionStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Hold `sid` for a command about to run so input that beats its
    /// handler to [`add`](Self::add) is queued rather than refused.
    /// `cancel` fires if the controller closes the session first.
    ///
    /// `None` when the sid is already taken.
    pub(crate) fn reserve(&self, sid: u64, cancel: CancellationToken) -> Option<Reservation> {
        let mut sessions = self.inner.sessions.lock();
        if sessions.contains_key(&sid) {
            return None;
        }
        let generation = self.next_generation();
        sessions.insert(
            sid,
            StreamSession {
                generation,
                input: Input::Early {
                    queued: Vec::new(),
                    bytes: 0,
                    eof: false,
                    size: None,
                },
                cancel,
                last_seq: None,
            },
        );
        Some(Reservation {
            registry: self.clone(),
            sid,
            generation,
        })
    }

    /// Register `sid`.  `factory` runs only when the sid is free or merely
    /// reserved; a reservation's queued input and EOF pass to the new
    /// stdin end.
    pub fn add<F>(&self, sid: u64, factory: F) -> Result<StreamGuard, StreamError>
    where
        F: FnOnce() -> StreamEnds,
    {
        let mut sessions = self.inner.sessions.lock();
        let reserved = sessions.get(&sid).map(|s| matches!(s.input, Input::Early { .. }));
        let early = match reserved {
            Some(true) => sessions.remove(&sid),
            Some(false) => return Err(StreamError::AlreadyExists(sid)),
            None => None,
        };
        let StreamEnds { mut stdin, resize } = factory();

        let cancel = match early {
            Some(StreamSession {
                input:
                    Input::Early {
                        queued, eof, size, ..
                    },
                cancel,
                ..
            }) => {
                if let Some(tx) = &stdin {
                    for chunk in queued {
                        if let Err(e) = tx.send(chunk) {
                            tracing::debug!(sid, error = %e, "dropping early stream input");
                            break;
                        }
                    }
                }
                if eof {
                    stdin = None;
                }
                if let (Some(tx), Some(size)) = (&resize, size) {
                    let _ = tx.send(size);
                }
                cancel.child_token()
            }
            _ => CancellationToken::new(),
        };

        let generation = self.next_generation();
        sessions.insert(
            sid,
            StreamSession {
                generation,
                input: Input::Open { stdin, resize },
                cancel: cancel.clone(),
                last_seq: None,
            },
        );
        drop(sessions);

        tracing::debug!(sid, generation, "stream session opened");
        Ok(StreamGuard {
            registry: self.clone(),
            sid,
            generation,
            cancel,
        })
    }

    /// Forward stdin bytes.  `false` if the session is unknown, its input
    /// side is closed, or its queue is full.
    pub fn write(&self, sid: u64, seq: u64, data: Bytes) -> bool {
        let tx = {
            let mut sessions = self.inner.sessions.lock();
            let Some(session) = sessions.get_mut(&sid) else {
                return false;
            };
            if matches!(session.last_seq, Some(last) if seq < last) {
                tracing::debug!(sid, seq, "stream data arrived out of order");
            }
            session.last_seq = Some(seq);
            match &mut session.input {
                Input::Early {
                    queued, bytes, eof, ..
                } => {
                    if *eof || *bytes + data.len() > STDIN_QUEUE_LIMIT {
                        return false;
                    }
                    *bytes += data.len();
                    queued.push(data);
                    return true;
                }
                Input::Open { stdin: Some(tx), .. } => tx.clone(),
                Input::Open { stdin: None, .. } => return false,
            }
        };
        match tx.send(data) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(sid, seq, error = %e, "stream input refused");
                false
            }
        }
    }

    /// Best-effort terminal resize.  `false` when unsupported or gone.  A
    /// resize for a reserved session is kept for its handler.
    pub fn resize(&self, sid: u64, cols: u16, rows: u16) -> bool {
        let mut sessions = self.inner.sessions.lock();
        match sessions.get_mut(&sid).map(|s| &mut s.input) {
            Some(Input::Early { size, .. }) => {
                *size = Some(TermSize { cols, rows });
                true
            }
            Some(Input::Open { resize: Some(tx), .. }) => tx.send(TermSize { cols, rows }).is_ok(),
            _ => false,
        }
    }

    /// Close the input side of `sid` (the reader sees EOF).  The session
    /// stays registered so output keeps flowing.
    pub fn close_read(&self, sid: u64, seq: u64) {
        let stdin = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(&sid).map(|s| &mut s.input) {
                Some(Input::Early { eof, .. }) => {
                    *eof = true;
                    None
                }
                Some(Input::Open { stdin, .. }) => stdin.take(),
                None => None,
            }
        };
        if stdin.is_some() {
            tracing::debug!(sid, seq, "stream input closed");
        }
    }

    /// Tear down `sid`.  Idempotent.
    pub fn close(&self, sid: u64) {
        let removed = self.inner.sessions.lock().remove(&sid);
        if let Some(session) = removed {
            session.cancel.cancel();
            tracing::debug!(sid, "stream session closed");
        }
    }

    /// Tear down every session (connection lost or shutdown).
    pub fn close_all(&self) {
        let drained: Vec<(u64, StreamSession)> = self.inner.sessions.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "closing all stream sessions");
        }
        for (_, session) in drained {
            session.cancel.cancel();
        }
    }

    pub fn contains(&self, sid: u64) -> bool {
        self.inner.sessions.lock().contains_key(&sid)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close_generation(&self, sid: u64, generation: u64) {
        let removed = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get(&sid) {
                Some(s) if s.generation == generation => sessions.remove(&sid),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.cancel.cancel();
            tracing::debug!(sid, generation, "stream session released");
        }
    }

    fn release_reservation(&self, sid: u64, generation: u64) {
        let mut sessions = self.inner.sessions.lock();
        if matches!(sessions.get(&sid), Some(s) if s.generation == generation) {
            sessions.remove(&sid);
        }
    }
}

/// Holds a sid from dispatch until the handler opens its stream.  Dropping
/// it frees the sid unless the stream was opened.
pub(crate) struct Reservation {
    registry: SessionStreamRegistry,
    sid: u64,
    generation: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.registry.release_reservation(self.sid, self.generation);
    }
}

/// Owns one registry entry; dropping it closes that entry (and only that
/// generation of it).
pub struct StreamGuard {
    registry: SessionStreamRegistry,
    sid: u64,
    generation: u64,
    cancel: CancellationToken,
}

impl StreamGuard {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Cancelled when the session is closed by the controller, by
    /// `close_all`, or by dropping this guard.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.close_generation(self.sid, self.generation);
    }
}
