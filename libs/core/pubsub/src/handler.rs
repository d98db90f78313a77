//! The message handler seam.
//!
//! A handler is invoked once per delivered message. Returning `Ok(())`
//! means the message was processed; on the consumer-group driver that is
//! what allows it to be acknowledged. Returning an error leaves the message
//! unacknowledged and is logged; the driver does not retry it in-process.

use crate::message::Message;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;

/// Error returned by a handler for one message.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source("invalid JSON payload", err)
    }
}

/// Per-delivery information handed to the handler next to the message.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    topic: String,
    message_id: Option<String>,
    redelivered: bool,
    shutdown: watch::Receiver<bool>,
}

impl DeliveryContext {
    pub(crate) fn new(
        topic: impl Into<String>,
        message_id: Option<String>,
        redelivered: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            topic: topic.into(),
            message_id,
            redelivered,
            shutdown,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Transport id (stream entry id); `None` on the broadcast driver.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// The message was delivered before and was never acknowledged.
    pub fn is_redelivery(&self) -> bool {
        self.redelivered
    }

    /// The owning driver has started closing.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the owning driver starts closing.
    pub async fn shutdown_signal(&mut self) {
        while !*self.shutdown.borrow_and_update() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Processes delivered messages.
///
/// The same handler may be shared by many topics and, on the broadcast
/// driver, invoked concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: DeliveryContext, message: Message) -> Result<(), HandlerError>;

    /// Name used in logs and metrics.
    fn name(&self) -> &'static str {
        "handler"
    }
}

pub type SharedHandler = Arc<dyn MessageHandler>;

/// Run one handler call, turning a panic into a `HandlerError` so the
/// delivery loop survives it.
pub(crate) async fn invoke(
    handler: &dyn MessageHandler,
    ctx: DeliveryContext,
    message: Message,
) -> Result<(), HandlerError> {
    match AssertUnwindSafe(handler.handle(ctx, message)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::new(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct HandlerFn<F> {
    name: &'static str,
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(DeliveryContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { name: "handler_fn", f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(DeliveryContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: DeliveryContext, message: Message) -> Result<(), HandlerError> {
        (self.f)(ctx, message).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
