//! Pluggable publish/subscribe messaging.
//!
//! Two drivers share one surface:
//!
//! - [`ConsumerGroupDriver`]: at-least-once delivery over Redis Streams
//!   consumer groups. A message is acknowledged only after its handler
//!   succeeded; unacknowledged messages are redelivered.
//! - [`BroadcastDriver`]: fire-and-forget fan-out over NATS core subjects.
//!   No acknowledgement, no replay.
//!
//! [`Messaging`] picks one from [`MessagingConfig`] and forwards every call.
//!
//! ```text
//! ┌───────────┐ publish  ┌──────────────────────┐
//! │ Messaging │────────▶│ Redis Streams / NATS │
//! └─────┬─────┘          └──────────┬───────────┘
//!       │ subscribe_multiple        │ one delivery task per topic
//!       ▼                           ▼
//! ┌─────────────────────┐   ┌────────────────┐
//! │ SubscriptionManager │──▶│ MessageHandler │
//! └─────────────────────┘   └────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pubsub::{handler_fn, Messaging, MessagingConfig};
//! use std::sync::Arc;
//!
//! let messaging = Messaging::connect(MessagingConfig::from_env()?).await?;
//! let handler = Arc::new(handler_fn(|_ctx, msg| async move {
//!     tracing::info!(topic = msg.topic(), "received");
//!     Ok(())
//! }));
//! messaging.subscribe_multiple(&["orders", "invoices"], handler).await?;
//! messaging.publish("orders", b"{\"id\":1}".to_vec(), Default::default()).await?;
//! messaging.close().await?;
//! ```

pub mod broadcast;
pub mod config;
mod connection;
pub mod consumer_group;
pub mod error;
pub mod handler;
pub mod health;
pub mod message;
pub mod metrics;
mod subscription;

pub use broadcast::{BroadcastDriver, MemoryBus};
pub use config::{Backend, BackoffStrategy, BroadcastConfig, ConsumerGroupConfig, MessagingConfig};
pub use consumer_group::{ConsumerGroupDriver, MemoryLog};
pub use error::{
    AggregateSubscribeError, CloseError, ConnectionError, DeliveryError, PublishError,
    SubscribeError, TopicError, TransportError,
};
pub use handler::{handler_fn, DeliveryContext, HandlerError, MessageHandler, SharedHandler};
pub use health::HealthStatus;
pub use message::{Headers, Message, MessageError};
pub use metrics::{init_metrics, render_metrics};
pub use subscription::{SubscriptionInfo, TaskState};

use std::time::Duration;

/// A connected messaging driver chosen at startup.
///
/// Cheap to clone; clones share the same connection and subscriptions.
#[derive(Clone)]
pub enum Messaging {
    ConsumerGroup(ConsumerGroupDriver),
    Broadcast(BroadcastDriver),
}

impl Messaging {
    /// Connect the configured backend. Fails if it is unreachable.
    pub async fn connect(config: impl Into<MessagingConfig>) -> Result<Self, ConnectionError> {
        Ok(match config.into() {
            MessagingConfig::ConsumerGroup(config) => {
                Messaging::ConsumerGroup(ConsumerGroupDriver::connect(config).await?)
            }
            MessagingConfig::Broadcast(config) => {
                Messaging::Broadcast(BroadcastDriver::connect(config).await?)
            }
        })
    }

    pub fn backend(&self) -> Backend {
        match self {
            Messaging::ConsumerGroup(_) => Backend::ConsumerGroup,
            Messaging::Broadcast(_) => Backend::Broadcast,
        }
    }

    /// Publish `payload` with `headers` to `topic`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        headers: Headers,
    ) -> Result<(), PublishError> {
        let message = Message::new(topic, payload)?.with_headers(headers);
        self.publish_message(&message).await
    }

    pub async fn publish_message(&self, message: &Message) -> Result<(), PublishError> {
        match self {
            Messaging::ConsumerGroup(driver) => driver.publish(message).await,
            Messaging::Broadcast(driver) => driver.publish(message).await,
        }
    }

    pub async fn subscribe(&self, topic: &str, handler: SharedHandler) -> Result<(), SubscribeError> {
        match self {
            Messaging::ConsumerGroup(driver) => driver.subscribe(topic, handler).await,
            Messaging::Broadcast(driver) => driver.subscribe(topic, handler).await,
        }
    }

    pub async fn subscribe_multiple(
        &self,
        topics: &[&str],
        handler: SharedHandler,
    ) -> Result<(), AggregateSubscribeError> {
        match self {
            Messaging::ConsumerGroup(driver) => driver.subscribe_multiple(topics, handler).await,
            Messaging::Broadcast(driver) => driver.subscribe_multiple(topics, handler).await,
        }
    }

    pub async fn close(&self) -> Result<(), CloseError> {
        match self {
            Messaging::ConsumerGroup(driver) => driver.close().await,
            Messaging::Broadcast(driver) => driver.close().await,
        }
    }

    /// Liveness of the backend within `deadline`. Read-only.
    pub async fn health_check(&self, deadline: Duration) -> HealthStatus {
        match self {
            Messaging::ConsumerGroup(driver) => driver.health_check(deadline).await,
            Messaging::Broadcast(driver) => driver.health_check(deadline).await,
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        match self {
            Messaging::ConsumerGroup(driver) => driver.subscriptions(),
            Messaging::Broadcast(driver) => driver.subscriptions(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Messaging::ConsumerGroup(driver) => driver.is_closed(),
            Messaging::Broadcast(driver) => driver.is_closed(),
        }
    }
}

impl From<ConsumerGroupDriver> for Messaging {
    fn from(driver: ConsumerGroupDriver) -> Self {
        Messaging::ConsumerGroup(driver)
    }
}

impl From<BroadcastDriver> for Messaging {
    fn from(driver: BroadcastDriver) -> Self {
        Messaging::Broadcast(driver)
    }
}
