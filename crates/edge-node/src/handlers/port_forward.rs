//! `port_forward`: bridge the session to a TCP endpoint reachable from
//! this host.
//!
//! Args: `{ "host": "127.0.0.1", "port": n, "connect_timeout_secs": n }`
//! Returns: `{ "bytes": n }` (bytes sent to the controller) once the remote
//! side closes or the session is closed.
//!
//! Controller → remote: `stream_data`, with `stream_eof` half-closing the
//! socket.  Remote → controller: `stdout` messages on the interactive tier.

use std::time::Duration;

use bytes::Bytes;
use el_node_sdk::{
    decode_args, encode_reply, pump_output, stdin_pipe, BoundedLatencyReader, CommandHandler,
    HandlerError, HandlerResult, MessageKind, SessionContext, StreamEnds,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ForwardArgs {
    #[serde(default = "d_host")]
    host: String,
    port: u16,
    #[serde(default)]
    connect_timeout_secs: Option<u64>,
}

fn d_host() -> String {
    "127.0.0.1".into()
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardReply {
    pub bytes: u64,
}

pub struct PortForward;

#[async_trait::async_trait]
impl CommandHandler for PortForward {
    async fn handle(&self, ctx: SessionContext, payload: Bytes) -> HandlerResult {
        let args: ForwardArgs = decode_args(&payload)?;
        if args.port == 0 {
            return Err(HandlerError::InvalidArgs("port must be non-zero".into()));
        }
        let timeout = args
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let target = format!("{}:{}", args.host, args.port);
        let stream = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(HandlerError::Cancelled("session cancelled".into()));
            }
            res = tokio::time::timeout(timeout, TcpStream::connect(&target)) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(HandlerError::Failed(format!("connect {target}: {e}"))),
                Err(_) => return Err(HandlerError::Timeout(format!("connect {target} timed out"))),
            },
        };
        let (remote_read, mut remote_write) = stream.into_split();

        let (stdin_tx, mut stdin_rx) = stdin_pipe();
        let guard = ctx.open_stream(|| StreamEnds::none().with_stdin(stdin_tx))?;
        tracing::debug!(sid = ctx.sid, target = %target, "port forward open");

        let upstream = tokio::spawn(async move {
            match tokio::io::copy(&mut stdin_rx, &mut remote_write).await {
                Ok(_) => {
                    let _ = remote_write.shutdown().await;
                }
                Err(e) => tracing::debug!(error = %e, "port forward upstream ended"),
            }
        });

        let cancel = guard.cancel_token().child_token();
        let connection = ctx.cancel.clone();
        let stop = cancel.clone();
        let watcher = tokio::spawn(async move {
            connection.cancelled().await;
            stop.cancel();
        });

        let sent = pump_output(
            BoundedLatencyReader::new(remote_read),
            ctx.poster.clone(),
            ctx.sid,
            MessageKind::Stdout,
            ctx.interactive_flush(),
            cancel,
        )
        .await;

        watcher.abort();
        upstream.abort();
        drop(guard);
        tracing::debug!(sid = ctx.sid, target = %target, "port forward closed");

        encode_reply(&ForwardReply { bytes: sent? })
    }
}
