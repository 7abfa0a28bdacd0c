//! Command dispatch table: maps message kinds to handlers and turns handler
//! outcomes into `Done` / `Error` replies.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use el_protocol::{ErrorKind, MessageKind};
use futures_util::FutureExt;

use crate::types::{HandlerResult, SessionContext};

/// Implement this trait to handle one command kind.
///
/// The dispatcher hands over the fully reassembled payload; handlers decode
/// it themselves (see [`decode_args`](crate::types::decode_args)).  Handlers
/// run on the Tokio runtime and may post intermediate output through
/// [`SessionContext::post`] before returning.
///
/// # Example
///
/// ```rust,no_run
/// use bytes::Bytes;
/// use el_node_sdk::{CommandHandler, HandlerResult, SessionContext};
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl CommandHandler for Echo {
///     async fn handle(&self, _ctx: SessionContext, payload: Bytes) -> HandlerResult {
///         Ok(payload)
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Execute the command.  `Ok` bytes are sent back as the `Done` payload.
    async fn handle(&self, ctx: SessionContext, payload: Bytes) -> HandlerResult;
}

/// Static kind → handler map, built once by the composition root.
#[derive(Clone, Default)]
pub struct CommandDispatchTable {
    handlers: HashMap<MessageKind, Arc<dyn CommandHandler>>,
}

impl CommandDispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any earlier one.
    ///
    /// Returns `&mut Self` for method chaining.
    pub fn register<H: CommandHandler>(&mut self, kind: MessageKind, handler: H) -> &mut Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Register a pre-wrapped handler.
    pub fn register_arc(&mut self, kind: MessageKind, handler: Arc<dyn CommandHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: MessageKind) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// All registered kinds (sorted by wire code).
    pub fn kinds(&self) -> Vec<MessageKind> {
        let mut kinds: Vec<MessageKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.code());
        kinds
    }

    /// Registered command names, as advertised in a transport handshake.
    pub fn capabilities(&self) -> Vec<String> {
        self.kinds().into_iter().map(|k| k.as_str().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `ctx.kind` and always post a reply on `ctx.sid`:
    /// `Done` on success, `Error` on failure, unknown kind or panic.
    ///
    /// A failure to post the reply is logged and not retried.
    pub async fn dispatch(&self, ctx: SessionContext, payload: Bytes) {
        let sid = ctx.sid;
        let kind = ctx.kind;
        let poster = ctx.poster.clone();

        let Some(handler) = self.get(kind) else {
            tracing::warn!(sid, kind = %kind, "no handler registered for command");
            if let Err(e) = poster
                .post_error(sid, ErrorKind::NotSupported, format!("unknown command: {kind}"))
                .await
            {
                tracing::warn!(sid, error = %e, "failed to post not_supported reply");
            }
            return;
        };

        tracing::debug!(sid, kind = %kind, bytes = payload.len(), "dispatching command");

        // catch_unwind: a panicking handler still produces a reply.
        let outcome = AssertUnwindSafe(handler.handle(ctx, payload))
            .catch_unwind()
            .await;

        let posted = match outcome {
            Ok(Ok(body)) => poster.post(sid, MessageKind::Done, body).await,
            Ok(Err(e)) => {
                tracing::debug!(sid, kind = %kind, error = %e, "command failed");
                poster.post_error_payload(sid, &e.to_payload()).await
            }
            Err(_panic) => {
                tracing::error!(sid, kind = %kind, "command handler panicked");
                poster
                    .post_error(sid, ErrorKind::Failed, "command handler panicked")
                    .await
            }
        };

        if let Err(e) = posted {
            tracing::warn!(sid, kind = %kind, error = %e, "failed to post command reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use el_protocol::ErrorPayload;
    use tokio_util::sync::CancellationToken;

    use crate::chunked::ChunkedPoster;
    use crate::connectivity::ActiveClient;
    use crate::latency::FlushTiers;
    use crate::streams::SessionStreamRegistry;
    use crate::test_support::RecordingClient;
    use crate::types::HandlerError;

    struct Echo;
    #[async_trait::async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, _ctx: SessionContext, payload: Bytes) -> HandlerResult {
            Ok(payload)
        }
    }

    struct Fail;
    #[async_trait::async_trait]
    impl CommandHandler for Fail {
        async fn handle(&self, _ctx: SessionContext, _payload: Bytes) -> HandlerResult {
            Err(HandlerError::NotFound("intentional".into()))
        }
    }

    struct Panic;
    #[async_trait::async_trait]
    impl CommandHandler for Panic {
        async fn handle(&self, _ctx: SessionContext, _payload: Bytes) -> HandlerResult {
            panic!("boom");
        }
    }

    fn ctx(sid: u64, kind: MessageKind, client: &Arc<RecordingClient>) -> SessionContext {
        let active = Arc::new(ActiveClient::new());
        active.swap(Some(client.clone()));
        SessionContext {
            sid,
            kind,
            cancel: CancellationToken::new(),
            poster: ChunkedPoster::new(active),
            streams: SessionStreamRegistry::new(),
            flush: FlushTiers::default(),
        }
    }

    fn error_of(frame: &el_protocol::Frame) -> ErrorPayload {
        assert_eq!(frame.kind, MessageKind::Error);
        serde_json::from_slice(&frame.payload).unwrap()
    }

    #[test]
    fn kinds_sorted_by_code() {
        let mut table = CommandDispatchTable::new();
        table.register(MessageKind::Echo, Echo).register(MessageKind::Exec, Echo);
        assert_eq!(table.kinds(), vec![MessageKind::Exec, MessageKind::Echo]);
        assert_eq!(table.capabilities(), vec!["exec", "echo"]);
        assert!(table.contains(MessageKind::Exec));
        assert!(!table.contains(MessageKind::Logs));
    }

    #[tokio::test]
    async fn success_posts_done_on_same_sid() {
        let client = RecordingClient::started(1024);
        let mut table = CommandDispatchTable::new();
        table.register(MessageKind::Echo, Echo);

        table
            .dispatch(ctx(8, MessageKind::Echo, &client), Bytes::from_static(b"ping"))
            .await;
        let frames = client.sent();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageKind::Done);
        assert_eq!(frames[0].sid, 8);
        assert_eq!(&frames[0].payload[..], b"ping");
    }

    #[tokio::test]
    async fn handler_error_posts_error_kind() {
        let client = RecordingClient::started(1024);
        let mut table = CommandDispatchTable::new();
        table.register(MessageKind::Logs, Fail);

        table.dispatch(ctx(2, MessageKind::Logs, &client), Bytes::new()).await;
        let err = error_of(&client.sent()[0]);
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message, "intentional");
    }

    #[tokio::test]
    async fn unknown_kind_is_not_supported() {
        let client = RecordingClient::started(1024);
        let table = CommandDispatchTable::new();
        table
            .dispatch(ctx(5, MessageKind::Other(777), &client), Bytes::new())
            .await;
        let frames = client.sent();
        assert_eq!(frames[0].sid, 5);
        let err = error_of(&frames[0]);
        assert_eq!(err.kind, ErrorKind::NotSupported);
        assert!(err.message.contains("other(777)"));
    }

    #[tokio::test]
    async fn panicking_handler_reports_failed() {
        let client = RecordingClient::started(1024);
        let mut table = CommandDispatchTable::new();
        table.register(MessageKind::Exec, Panic);

        table.dispatch(ctx(3, MessageKind::Exec, &client), Bytes::new()).await;
        assert_eq!(error_of(&client.sent()[0]).kind, ErrorKind::Failed);
    }

    #[tokio::test]
    async fn large_reply_is_chunked() {
        let client = RecordingClient::started(4);
        let mut table = CommandDispatchTable::new();
        table.register(MessageKind::Echo, Echo);

        table
            .dispatch(ctx(1, MessageKind::Echo, &client), Bytes::from_static(b"0123456789"))
            .await;
        let frames = client.sent();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.kind == MessageKind::Done));
        assert!(frames[2].completed);
    }
}
