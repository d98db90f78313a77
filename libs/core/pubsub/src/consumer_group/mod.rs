//! At-least-once delivery through durable consumer groups.
//!
//! Every instance configured with the same group shares the work on each
//! topic; each entry goes to one member. An entry is acknowledged only after
//! the handler succeeded, so a crash or handler failure leaves it pending:
//! the same consumer id picks it up on restart, and other members claim it
//! once it has been idle for `claim_idle`.
//!
//! ```ignore
//! let config = ConsumerGroupConfig::new("redis://localhost:6379", "billing");
//! let driver = ConsumerGroupDriver::connect(config).await?;
//! driver.subscribe_multiple(&["orders", "invoices"], handler).await?;
//! driver.publish(&Message::new("orders", payload)?).await?;
//! driver.close().await?;
//! ```

mod delivery;
pub mod memory;
pub mod redis;
pub mod transport;

use crate::config::ConsumerGroupConfig;
use crate::connection::Connection;
use crate::error::{
    AggregateSubscribeError, CloseError, ConnectionError, PublishError, SubscribeError,
};
use crate::handler::SharedHandler;
use crate::health::{self, HealthStatus};
use crate::message::{validate_topic, Message};
use crate::metrics::PubSubMetrics;
use crate::subscription::{SubscriptionInfo, SubscriptionManager};
use delivery::{DeliverySettings, DeliveryTask};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use transport::{GroupMember, LogTransport};

pub use self::memory::MemoryLog;
pub use self::redis::RedisStreams;

/// Consumer-group driver. Cheap to clone; clones share one connection and
/// one set of subscriptions.
#[derive(Clone)]
pub struct ConsumerGroupDriver {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConsumerGroupConfig,
    connection: Connection<dyn LogTransport>,
    subscriptions: SubscriptionManager,
    metrics: PubSubMetrics,
    span: Span,
}

impl ConsumerGroupDriver {
    /// Connect to Redis and verify it responds.
    pub async fn connect(config: ConsumerGroupConfig) -> Result<Self, ConnectionError> {
        let transport = RedisStreams::connect(&config).await?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Build a driver over any log transport.
    pub fn with_transport(transport: Arc<dyn LogTransport>, config: ConsumerGroupConfig) -> Self {
        let backend = transport.backend();
        let span = config.span.clone().unwrap_or_else(|| {
            info_span!(
                "pubsub",
                backend = backend,
                group = %config.group,
                consumer = %config.consumer_id
            )
        });

        Self {
            inner: Arc::new(Inner {
                connection: Connection::new(transport),
                subscriptions: SubscriptionManager::new(),
                metrics: PubSubMetrics::new(backend),
                span,
                config,
            }),
        }
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.inner.config.consumer_id
    }

    /// Append a message to its topic. Returns once the server accepted it.
    pub async fn publish(&self, message: &Message) -> Result<(), PublishError> {
        let inner = &self.inner;
        let topic = message.topic();
        validate_topic(topic)?;
        let transport = inner.connection.get().ok_or(PublishError::Closed)?;

        let started = Instant::now();
        let timeout = inner.config.publish_timeout;
        let appended = tokio::time::timeout(timeout, transport.append(message, inner.config.max_length))
            .instrument(inner.span.clone())
            .await;

        match appended {
            Ok(Ok(id)) => {
                inner.metrics.published(topic, started.elapsed());
                debug!(parent: &inner.span, topic = %topic, id = %id, "Published message");
                Ok(())
            }
            Ok(Err(source)) => {
                inner.metrics.publish_failed(topic, "transport");
                Err(PublishError::Transport {
                    topic: topic.to_string(),
                    source,
                })
            }
            Err(_) => {
                inner.metrics.publish_failed(topic, "timeout");
                Err(PublishError::Timeout {
                    topic: topic.to_string(),
                    timeout,
                })
            }
        }
    }

    pub async fn subscribe(&self, topic: &str, handler: SharedHandler) -> Result<(), SubscribeError> {
        self.subscribe_multiple(&[topic], handler)
            .await
            .map_err(|err| {
                err.into_failures()
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| SubscribeError::Closed {
                        topic: topic.to_string(),
                    })
            })
    }

    /// Join the group on every topic concurrently with one shared handler.
    ///
    /// Topics that succeed stay subscribed even if others fail; the error
    /// lists only the failures.
    pub async fn subscribe_multiple(
        &self,
        topics: &[&str],
        handler: SharedHandler,
    ) -> Result<(), AggregateSubscribeError> {
        let inner = &self.inner;
        let Some(transport) = inner.connection.get() else {
            let failures = topics
                .iter()
                .map(|topic| SubscribeError::Closed {
                    topic: topic.to_string(),
                })
                .collect();
            return Err(AggregateSubscribeError::new(topics.len(), failures));
        };

        let settings = DeliverySettings {
            batch_size: inner.config.batch_size,
            // Bounded so blocked reads never hold off idle claims.
            block: inner
                .config
                .block_timeout
                .filter(|block| !block.is_zero())
                .map(|block| block.min(inner.config.claim_interval)),
            poll_interval: inner.config.poll_interval,
            claim_idle: inner.config.claim_idle,
            claim_interval: inner.config.claim_interval,
            backoff: inner.config.read_backoff.clone(),
        };

        let result = inner
            .subscriptions
            .subscribe_all(topics, |ctx| {
                let span = info_span!(parent: &inner.span, "subscription", topic = %ctx.topic);
                let task = DeliveryTask {
                    member: GroupMember {
                        topic: ctx.topic.clone(),
                        group: inner.config.group.clone(),
                        consumer: inner.config.consumer_id.clone(),
                    },
                    ctx,
                    transport: transport.clone(),
                    handler: handler.clone(),
                    settings: settings.clone(),
                    metrics: inner.metrics.clone(),
                };
                tokio::spawn(task.run().instrument(span))
            })
            .await;

        inner
            .metrics
            .active_subscriptions(inner.subscriptions.active_count());
        result
    }

    /// Stop every delivery task, then release the connection.
    ///
    /// No handler starts after this is called. Handlers already running get
    /// up to `drain_timeout` to finish; their messages are acknowledged only
    /// if they finish in time. Calling close again is a no-op.
    pub async fn close(&self) -> Result<(), CloseError> {
        let inner = &self.inner;
        let Some(mut failures) = inner
            .subscriptions
            .shutdown(inner.config.drain_timeout)
            .instrument(inner.span.clone())
            .await
        else {
            return Ok(());
        };

        if let Some(transport) = inner.connection.take() {
            let grace = inner.config.drain_timeout;
            match tokio::time::timeout(grace, transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(format!("connection: {e}")),
                Err(_) => failures.push(format!("connection: close did not finish within {grace:?}")),
            }
        }
        inner.metrics.active_subscriptions(0);

        if failures.is_empty() {
            info!(parent: &inner.span, "Consumer-group driver closed");
        } else {
            warn!(parent: &inner.span, failures = ?failures, "Consumer-group driver closed with errors");
        }
        CloseError::from_failures(failures)
    }

    /// Ping the server within `deadline` and check that no delivery task
    /// died. Never publishes or consumes.
    pub async fn health_check(&self, deadline: Duration) -> HealthStatus {
        let inner = &self.inner;
        let Some(transport) = inner.connection.get() else {
            return HealthStatus::unhealthy("driver is closed");
        };
        health::probe(
            transport.backend(),
            deadline,
            transport.ping(),
            inner.subscriptions.failures(),
        )
        .await
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.subscriptions.is_closed()
    }
}
