use bytes::Bytes;
use el_node_sdk::{CommandHandler, HandlerResult, SessionContext};

/// `echo`: replies with the command payload unchanged.
pub struct Echo;

#[async_trait::async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, _ctx: SessionContext, payload: Bytes) -> HandlerResult {
        Ok(payload)
    }
}
