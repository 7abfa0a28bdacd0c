//! `logs`: stream a file under `logs_root`.
//!
//! Args: `{ "path": "relative/to/root.log", "follow": bool, "tail_bytes": n }`
//! Returns: `{ "bytes": n }` once the file is exhausted (or, when following,
//! once the session is closed).
//!
//! Content goes out as `stdout` messages on the bulk flush tier.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use el_node_sdk::{
    decode_args, encode_reply, pump_output, BoundedLatencyReader, CommandHandler, HandlerError,
    HandlerResult, MessageKind, SessionContext, StreamEnds,
};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Poll interval while following a file that has no new data.
const FOLLOW_POLL: Duration = Duration::from_millis(250);

const FOLLOW_PIPE_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct LogsArgs {
    path: String,
    #[serde(default)]
    follow: bool,
    #[serde(default)]
    tail_bytes: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogsReply {
    pub bytes: u64,
}

pub struct Logs {
    root: PathBuf,
}

impl Logs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl CommandHandler for Logs {
    async fn handle(&self, ctx: SessionContext, payload: Bytes) -> HandlerResult {
        let args: LogsArgs = decode_args(&payload)?;
        let path = resolve_within(&self.root, &args.path)?;

        let mut file = File::open(&path).await?;
        if let Some(tail) = args.tail_bytes {
            let len = file.metadata().await?.len();
            file.seek(SeekFrom::Start(len.saturating_sub(tail))).await?;
        }

        let guard = ctx.open_stream(StreamEnds::none)?;
        let cancel = guard.cancel_token().child_token();
        tracing::debug!(sid = ctx.sid, path = %path.display(), follow = args.follow, "streaming log file");

        let reader = if args.follow {
            BoundedLatencyReader::new(follow(file, cancel.clone()))
        } else {
            BoundedLatencyReader::new(file)
        };

        let connection = ctx.cancel.clone();
        let stop = cancel.clone();
        let watcher = tokio::spawn(async move {
            connection.cancelled().await;
            stop.cancel();
        });

        let sent = pump_output(
            reader,
            ctx.poster.clone(),
            ctx.sid,
            MessageKind::Stdout,
            ctx.bulk_flush(),
            cancel,
        )
        .await;
        watcher.abort();
        drop(guard);

        encode_reply(&LogsReply { bytes: sent? })
    }
}

/// Resolve `requested` under `root`, refusing anything that escapes it.
fn resolve_within(root: &Path, requested: &str) -> Result<PathBuf, HandlerError> {
    if requested.trim().is_empty() {
        return Err(HandlerError::InvalidArgs("path must not be empty".into()));
    }
    let canonical_root = root
        .canonicalize()
        .map_err(|e| HandlerError::Failed(format!("logs root error: {e}")))?;
    let canonical_file = root
        .join(requested)
        .canonicalize()
        .map_err(|e| HandlerError::NotFound(format!("{requested}: {e}")))?;
    if !canonical_file.starts_with(&canonical_root) {
        return Err(HandlerError::InvalidArgs(format!(
            "access denied: {requested} is outside the logs root"
        )));
    }
    if !canonical_file.is_file() {
        return Err(HandlerError::InvalidArgs(format!("{requested} is not a file")));
    }
    Ok(canonical_file)
}

/// Tail `file` forever, polling for growth, until `cancel` fires.  The
/// returned reader reaches EOF after cancellation.
fn follow(mut file: File, cancel: CancellationToken) -> tokio::io::DuplexStream {
    let (mut tx, rx) = tokio::io::duplex(FOLLOW_PIPE_SIZE);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                n = file.read(&mut buf) => match n {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(error = %e, "follow read failed");
                        break;
                    }
                },
            };
            if n == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(FOLLOW_POLL) => continue,
                }
            }
            if tx.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });
    rx
}
