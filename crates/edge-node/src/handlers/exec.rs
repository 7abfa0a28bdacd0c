//! `exec`: run a shell command, streaming its output on the session.
//!
//! Args: `{ "command": "...", "env": {..}, "workdir": "...", "stdin": bool,
//! "timeout_secs": n }`
//! Returns: `{ "exit_code": n | null }`
//!
//! stdout and stderr are posted as `stdout` / `stderr` messages on the
//! interactive flush tier while the process runs.  With `stdin = true`,
//! `stream_data` / `stream_eof` from the controller feed the process.
//! `session_close` or a dropped connection kills it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use el_node_sdk::{
    decode_args, encode_reply, pump_output, stdin_pipe, BoundedLatencyReader, CommandHandler,
    HandlerError, HandlerResult, MessageKind, PostError, SessionContext, StreamEnds,
};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::backend::{is_dangerous_env_var, LaunchSpec, ProcessLauncher};

/// How long to wait for output to drain after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ExecArgs {
    command: String,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    workdir: Option<PathBuf>,
    #[serde(default)]
    stdin: bool,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecReply {
    pub exit_code: Option<i32>,
}

pub struct Exec {
    launcher: Arc<dyn ProcessLauncher>,
}

impl Exec {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { launcher }
    }
}

impl ExecArgs {
    fn into_spec(self) -> Result<(LaunchSpec, Option<Duration>), HandlerError> {
        if self.command.trim().is_empty() {
            return Err(HandlerError::InvalidArgs("command must not be empty".into()));
        }
        if let Some(name) = self.env.keys().find(|k| is_dangerous_env_var(k)) {
            return Err(HandlerError::InvalidArgs(format!(
                "environment variable '{name}' is blocked by security policy"
            )));
        }
        let timeout = self.timeout_secs.map(Duration::from_secs);
        Ok((
            LaunchSpec {
                command: self.command,
                env: self.env,
                workdir: self.workdir,
                stdin: self.stdin,
            },
            timeout,
        ))
    }
}

#[async_trait::async_trait]
impl CommandHandler for Exec {
    async fn handle(&self, ctx: SessionContext, payload: Bytes) -> HandlerResult {
        let (spec, timeout) = decode_args::<ExecArgs>(&payload)?.into_spec()?;

        let (stdin_tx, stdin_rx) = stdin_pipe();
        let guard = if spec.stdin {
            ctx.open_stream(|| StreamEnds::none().with_stdin(stdin_tx))?
        } else {
            ctx.open_stream(StreamEnds::none)?
        };

        let mut child = self
            .launcher
            .launch(&spec)
            .map_err(|e| HandlerError::Failed(format!("failed to spawn: {e}")))?;
        tracing::debug!(sid = ctx.sid, pid = child.id(), "exec started");

        let stdin_task = child.stdin.take().map(|mut child_stdin| {
            let mut stdin_rx = stdin_rx;
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut stdin_rx, &mut child_stdin).await {
                    tracing::debug!(error = %e, "exec stdin copy ended");
                }
            })
        });

        let pump_cancel = guard.cancel_token().clone();
        let mut pumps: Vec<JoinHandle<Result<u64, PostError>>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(
                BoundedLatencyReader::new(stdout),
                ctx.poster.clone(),
                ctx.sid,
                MessageKind::Stdout,
                ctx.interactive_flush(),
                pump_cancel.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(
                BoundedLatencyReader::new(stderr),
                ctx.poster.clone(),
                ctx.sid,
                MessageKind::Stderr,
                ctx.interactive_flush(),
                pump_cancel.clone(),
            )));
        }

        let outcome = wait_child(&mut child, &ctx, guard.cancel_token(), timeout).await;
        if let Some(task) = stdin_task {
            task.abort();
        }

        let drained = drain(pumps).await;
        drop(guard);

        let status = outcome?;
        drained?;
        encode_reply(&ExecReply {
            exit_code: status.code(),
        })
    }
}

/// Wait for the child, killing it on cancellation or timeout.
async fn wait_child(
    child: &mut Child,
    ctx: &SessionContext,
    session: &tokio_util::sync::CancellationToken,
    timeout: Option<Duration>,
) -> Result<std::process::ExitStatus, HandlerError> {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };

    let err = tokio::select! {
        status = child.wait() => return status.map_err(HandlerError::from),
        _ = session.cancelled() => HandlerError::Cancelled("session closed".into()),
        _ = ctx.cancel.cancelled() => HandlerError::Cancelled("connection closed".into()),
        _ = deadline => HandlerError::Timeout(format!(
            "command timed out after {}s",
            timeout.map(|t| t.as_secs()).unwrap_or_default()
        )),
    };

    if let Err(e) = child.kill().await {
        tracing::debug!(sid = ctx.sid, error = %e, "failed to kill exec child");
    }
    Err(err)
}

/// Let the output pumps reach EOF.  A pump still running after
/// [`DRAIN_TIMEOUT`] (a grandchild holding the pipe) is aborted.
async fn drain(pumps: Vec<JoinHandle<Result<u64, PostError>>>) -> Result<(), HandlerError> {
    let mut result = Ok(());
    for mut pump in pumps {
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => result = Err(HandlerError::from(e)),
            Ok(Err(join)) => tracing::debug!(error = %join, "output pump task failed"),
            Err(_) => {
                tracing::debug!("output still open after exit; abandoning");
                pump.abort();
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(json: &str) -> ExecArgs {
        decode_args(json.as_bytes()).unwrap()
    }

    #[test]
    fn empty_command_is_invalid() {
        let err = args(r#"{"command": "  "}"#).into_spec().unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArgs(_)));
    }

    #[test]
    fn blocked_env_is_invalid() {
        let err = args(r#"{"command": "true", "env": {"LD_PRELOAD": "/tmp/x.so"}}"#)
            .into_spec()
            .unwrap_err();
        assert!(err.message().contains("LD_PRELOAD"));
    }

    #[test]
    fn spec_carries_options() {
        let (spec, timeout) = args(
            r#"{"command": "cat", "stdin": true, "timeout_secs": 5, "env": {"MODE": "x"}}"#,
        )
        .into_spec()
        .unwrap();
        assert!(spec.stdin);
        assert_eq!(spec.env.get("MODE").map(String::as_str), Some("x"));
        assert_eq!(timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn missing_command_is_invalid_args() {
        let err = decode_args::<ExecArgs>(b"{}").unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArgs(_)));
    }
}
