//! Message handlers for the worker.

use async_trait::async_trait;
use pubsub::{DeliveryContext, HandlerError, Message, MessageHandler};
use tracing::info;

/// Logs every message. JSON payloads (by `content-type`) must parse.
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, ctx: DeliveryContext, message: Message) -> Result<(), HandlerError> {
        let is_json = message
            .header("content-type")
            .is_some_and(|ct| ct.starts_with("application/json"));

        if is_json {
            let body: serde_json::Value = message.parse_json()?;
            info!(
                topic = %ctx.topic(),
                id = ctx.message_id().unwrap_or("-"),
                redelivered = ctx.is_redelivery(),
                body = %body,
                "Received message"
            );
        } else {
            info!(
                topic = %ctx.topic(),
                id = ctx.message_id().unwrap_or("-"),
                redelivered = ctx.is_redelivery(),
                bytes = message.payload().len(),
                "Received message"
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
