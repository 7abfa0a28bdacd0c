//! Bounded-latency reading of process / socket output.
//!
//! A background reader drains the source into a small queue while the
//! foreground batches whatever arrived within a flush timeout.  Interactive
//! streams use a short timeout so keystroke echoes feel immediate; bulk
//! streams use a longer one to send fewer, larger messages.

use std::io::Read;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use el_protocol::MessageKind;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::chunked::ChunkedPoster;
use crate::types::PostError;

/// Batch limit when no transport limit applies.
pub const DEFAULT_MAX_BATCH: usize = 32 * 1024;

const READ_BUF_SIZE: usize = 8 * 1024;
const QUEUE_DEPTH: usize = 16;

/// Flush timeouts for the two latency tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTiers {
    pub interactive: Duration,
    pub bulk: Duration,
}

impl Default for FlushTiers {
    fn default() -> Self {
        Self {
            interactive: Duration::from_millis(20),
            bulk: Duration::from_millis(200),
        }
    }
}

/// Batches output from a byte source with a bounded delay.
pub struct BoundedLatencyReader {
    rx: mpsc::Receiver<Bytes>,
    pending: BytesMut,
    max_batch: usize,
    finished: bool,
    task: Option<JoinHandle<()>>,
}

impl BoundedLatencyReader {
    /// Read an async source on a background task.
    pub fn new<R>(mut source: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match source.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "output source read failed");
                        break;
                    }
                }
            }
        });
        Self::with_receiver(rx, Some(task))
    }

    /// Read a blocking source on a dedicated thread.  The thread exits at
    /// EOF, on error, or on the first read after the reader is dropped.
    pub fn from_blocking<R>(mut source: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let spawned = std::thread::Builder::new()
            .name("el-output-reader".into())
            .spawn(move || {
                let mut buf = vec![0u8; READ_BUF_SIZE];
                loop {
                    match source.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::debug!(error = %e, "blocking output source read failed");
                            break;
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            // The sender was dropped with the closure, so the reader simply
            // reports EOF.
            tracing::warn!(error = %e, "failed to spawn output reader thread");
        }
        Self::with_receiver(rx, None)
    }

    fn with_receiver(rx: mpsc::Receiver<Bytes>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            rx,
            pending: BytesMut::new(),
            max_batch: DEFAULT_MAX_BATCH,
            finished: false,
            task,
        }
    }

    /// Cap on the size of one returned batch.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Wait until at least one byte is available.  `false` on EOF (with
    /// nothing left to read) or cancellation.
    pub async fn wait_for_data(&mut self, cancel: &CancellationToken) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        if self.finished {
            return false;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            chunk = self.rx.recv() => match chunk {
                Some(chunk) => {
                    self.pending.extend_from_slice(&chunk);
                    true
                }
                None => {
                    self.finished = true;
                    false
                }
            },
        }
    }

    /// Gather output for at most `timeout`.  Returns early when a full
    /// batch is ready or the source hit EOF.  The flag is `true` when the
    /// timer expired.
    pub async fn read_with_timeout(&mut self, timeout: Duration) -> (Bytes, bool) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending.len() >= self.max_batch || self.finished {
                return (self.take_batch(), false);
            }
            tokio::select! {
                _ = sleep_until(deadline) => return (self.take_batch(), true),
                chunk = self.rx.recv() => match chunk {
                    Some(chunk) => self.pending.extend_from_slice(&chunk),
                    None => self.finished = true,
                },
            }
        }
    }

    /// Source reached EOF and every byte has been handed out.
    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    fn take_batch(&mut self) -> Bytes {
        let n = self.pending.len().min(self.max_batch);
        self.pending.split_to(n).freeze()
    }
}

impl Drop for BoundedLatencyReader {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Ship `reader`'s output on `sid` as `kind` messages until EOF or
/// cancellation.  Each batch fits one frame, so a message is always a single
/// chunk.  Returns the number of bytes sent.
pub async fn pump_output(
    reader: BoundedLatencyReader,
    poster: ChunkedPoster,
    sid: u64,
    kind: MessageKind,
    flush: Duration,
    cancel: CancellationToken,
) -> Result<u64, PostError> {
    let mut reader = match poster.max_payload_size() {
        Some(max) if max < reader.max_batch() => reader.with_max_batch(max),
        _ => reader,
    };
    let mut sent = 0u64;
    while reader.wait_for_data(&cancel).await {
        let (batch, _) = reader.read_with_timeout(flush).await;
        if batch.is_empty() {
            continue;
        }
        sent += batch.len() as u64;
        poster.post(sid, kind, batch).await?;
    }
    tracing::trace!(sid, kind = %kind, bytes = sent, "output pump finished");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    use crate::connectivity::ActiveClient;
    use crate::test_support::RecordingClient;

    #[tokio::test]
    async fn batches_everything_written_before_timeout() {
        let (mut w, r) = tokio::io::duplex(64);
        let mut reader = BoundedLatencyReader::new(r);
        w.write_all(b"hello ").await.unwrap();
        w.write_all(b"world").await.unwrap();

        let cancel = CancellationToken::new();
        assert!(reader.wait_for_data(&cancel).await);
        let (batch, _) = reader.read_with_timeout(Duration::from_millis(50)).await;
        assert_eq!(&batch[..], b"hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_never_blocks_past_timeout() {
        let (mut w, r) = tokio::io::duplex(64);
        let mut reader = BoundedLatencyReader::new(r);
        let timeout = Duration::from_millis(20);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout * 2).await;
                if w.write_all(b".").await.is_err() {
                    break;
                }
            }
        });

        for _ in 0..5 {
            let started = Instant::now();
            let (batch, was_timeout) = reader.read_with_timeout(timeout).await;
            assert!(was_timeout);
            assert!(batch.len() <= 1);
            assert!(Instant::now() - started <= timeout + Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn eof_ends_wait_for_data() {
        let (w, r) = tokio::io::duplex(64);
        drop(w);
        let mut reader = BoundedLatencyReader::new(r);
        let cancel = CancellationToken::new();
        assert!(!reader.wait_for_data(&cancel).await);
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn cancellation_ends_wait_for_data() {
        let (_w, r) = tokio::io::duplex(64);
        let mut reader = BoundedLatencyReader::new(r);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!reader.wait_for_data(&cancel).await);
    }

    #[tokio::test]
    async fn blocking_source_is_read_on_a_thread() {
        let mut reader = BoundedLatencyReader::from_blocking(std::io::Cursor::new(b"abc".to_vec()));
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        while reader.wait_for_data(&cancel).await {
            let (batch, _) = reader.read_with_timeout(Duration::from_millis(10)).await;
            out.extend_from_slice(&batch);
        }
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn full_batch_returns_before_timeout() {
        let (mut w, r) = tokio::io::duplex(1024);
        let mut reader = BoundedLatencyReader::new(r).with_max_batch(4);
        w.write_all(b"0123456789").await.unwrap();
        let cancel = CancellationToken::new();
        assert!(reader.wait_for_data(&cancel).await);
        let (batch, was_timeout) = reader.read_with_timeout(Duration::from_secs(60)).await;
        assert_eq!(batch.len(), 4);
        assert!(!was_timeout);
    }

    #[tokio::test]
    async fn pump_sends_single_chunk_messages() {
        let client = RecordingClient::started(3);
        let active = Arc::new(ActiveClient::new());
        active.swap(Some(client.clone()));
        let poster = ChunkedPoster::new(active);

        let reader = BoundedLatencyReader::from_blocking(std::io::Cursor::new(b"abcdefgh".to_vec()));
        let sent = pump_output(
            reader,
            poster,
            11,
            MessageKind::Stdout,
            Duration::from_millis(5),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(sent, 8);

        let frames = client.sent();
        assert!(frames.iter().all(|f| f.seq == 0 && f.completed && f.sid == 11));
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, b"abcdefgh");
    }
}
