//! Fire-and-forget delivery to every live subscriber.
//!
//! There is no acknowledgement and no replay: a message published while an
//! instance is not subscribed never reaches it, and a handler error only
//! gets logged. Each received message is handled on its own task, so one
//! slow handler does not hold up the topic; `max_in_flight` bounds how many
//! run at once.

pub mod memory;
pub mod nats;
pub mod transport;

use crate::config::BroadcastConfig;
use crate::connection::Connection;
use crate::error::{
    AggregateSubscribeError, CloseError, ConnectionError, DeliveryError, PublishError,
    SubscribeError, TransportError,
};
use crate::handler::{invoke, DeliveryContext, SharedHandler};
use crate::health::{self, HealthStatus};
use crate::message::{validate_topic, Message};
use crate::metrics::PubSubMetrics;
use crate::subscription::{SubscriptionInfo, SubscriptionManager, TaskContext, TaskResult, TaskState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use transport::{BusSubscription, BusTransport};

pub use self::memory::MemoryBus;
pub use self::nats::NatsBus;

/// Broadcast driver. Cheap to clone; clones share one client and one set of
/// subscriptions.
#[derive(Clone)]
pub struct BroadcastDriver {
    inner: Arc<Inner>,
}

struct Inner {
    config: BroadcastConfig,
    connection: Connection<dyn BusTransport>,
    subscriptions: SubscriptionManager,
    metrics: PubSubMetrics,
    span: Span,
}

impl BroadcastDriver {
    pub async fn connect(config: BroadcastConfig) -> Result<Self, ConnectionError> {
        let bus = NatsBus::connect(&config).await?;
        Ok(Self::with_transport(Arc::new(bus), config))
    }

    pub fn with_transport(transport: Arc<dyn BusTransport>, config: BroadcastConfig) -> Self {
        let backend = transport.backend();
        let span = config.span.clone().unwrap_or_else(|| {
            info_span!("pubsub", backend = backend, client = %config.connection_name)
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

    /// Send to every current subscriber of the topic. Success means the
    /// server has the message, not that anyone handled it.
    pub async fn publish(&self, message: &Message) -> Result<(), PublishError> {
        let inner = &self.inner;
        let topic = message.topic();
        validate_topic(topic)?;
        let transport = inner.connection.get().ok_or(PublishError::Closed)?;

        let started = Instant::now();
        let timeout = inner.config.publish_timeout;
        let sent = tokio::time::timeout(timeout, transport.publish(message))
            .instrument(inner.span.clone())
            .await;

        match sent {
            Ok(Ok(())) => {
                inner.metrics.published(topic, started.elapsed());
                debug!(parent: &inner.span, topic = %topic, "Published message");
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

    /// Register every topic concurrently with one shared handler.
    ///
    /// Topics that succeed stay subscribed even if others fail.
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

        let result = inner
            .subscriptions
            .subscribe_all(topics, |ctx| {
                let span = info_span!(parent: &inner.span, "subscription", topic = %ctx.topic);
                let limiter = (inner.config.max_in_flight > 0)
                    .then(|| Arc::new(Semaphore::new(inner.config.max_in_flight)));
                let task = BroadcastTask {
                    ctx,
                    transport: transport.clone(),
                    handler: handler.clone(),
                    limiter,
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

    /// Unsubscribe every topic, then flush and release the client.
    ///
    /// Unsubscribe failures do not stop the rest of the shutdown; they are
    /// all returned together. Calling close again is a no-op.
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
            info!(parent: &inner.span, "Broadcast driver closed");
        } else {
            warn!(parent: &inner.span, failures = ?failures, "Broadcast driver closed with errors");
        }
        CloseError::from_failures(failures)
    }

    /// Round trip to the server within `deadline`, plus a check that no
    /// subscription was ended by the server. Never publishes.
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

struct BroadcastTask {
    ctx: TaskContext,
    transport: Arc<dyn BusTransport>,
    handler: SharedHandler,
    limiter: Option<Arc<Semaphore>>,
    metrics: PubSubMetrics,
}

impl BroadcastTask {
    /// Returns the unsubscribe outcome so close can report it.
    async fn run(mut self) -> TaskResult {
        let topic = self.ctx.topic.clone();
        let subscribed = tokio::select! {
            _ = self.ctx.stopped() => {
                self.ctx.set_state(TaskState::Stopped);
                return Ok(());
            }
            subscribed = self.transport.subscribe(&topic) => subscribed,
        };
        let mut subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                self.ctx.set_state(TaskState::Stopped);
                self.ctx.ready(Err(e));
                return Ok(());
            }
        };

        self.ctx.set_state(TaskState::Delivering);
        self.ctx.ready(Ok(()));
        info!("Subscribed");

        let mut in_flight = JoinSet::new();
        let ended = self.receive(subscription.as_mut(), &mut in_flight).await;
        self.ctx.set_state(TaskState::Stopped);

        if ended {
            let error = TransportError::Fatal("subscription ended by the server".to_string());
            error!(error = %error, "Delivery stopped");
            self.ctx.fail(&error);
        }

        let unsubscribed = if ended {
            Ok(())
        } else {
            subscription.unsubscribe().await
        };
        // Handlers already started may finish; close bounds the wait.
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Handler task panicked");
            }
        }

        match &unsubscribed {
            Ok(()) => debug!("Unsubscribed"),
            Err(e) => warn!(error = %e, "Unsubscribe failed"),
        }
        unsubscribed
    }

    /// Pump messages until close (`false`) or the subscription ends (`true`).
    async fn receive(&mut self, subscription: &mut dyn BusSubscription, in_flight: &mut JoinSet<()>) -> bool {
        loop {
            if self.ctx.is_stopping() {
                return false;
            }

            let permit = match &self.limiter {
                Some(limiter) => {
                    let limiter = limiter.clone();
                    tokio::select! {
                        _ = self.ctx.stopped() => return false,
                        permit = limiter.acquire_owned() => permit.ok(),
                    }
                }
                None => None,
            };

            let message = tokio::select! {
                _ = self.ctx.stopped() => return false,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Handler task panicked");
                    }
                    continue;
                }
                message = subscription.next() => message,
            };

            let Some(message) = message else {
                return !self.ctx.is_stopping();
            };
            if self.ctx.is_stopping() {
                return false;
            }

            let ctx = DeliveryContext::new(message.topic(), None, false, self.ctx.shutdown.clone());
            let handler = self.handler.clone();
            let metrics = self.metrics.clone();
            in_flight.spawn(
                async move {
                    let _permit = permit;
                    let topic = message.topic().to_string();
                    let handler_name = handler.name();
                    let started = Instant::now();
                    match invoke(handler.as_ref(), ctx, message).await {
                        Ok(()) => metrics.delivered(&topic, handler_name, started.elapsed()),
                        Err(source) => {
                            metrics.handler_failed(&topic, handler_name);
                            let error = DeliveryError {
                                topic,
                                message_id: None,
                                handler: handler_name,
                                source,
                            };
                            warn!(error = %error, "Handler failed");
                        }
                    }
                }
                .in_current_span(),
            );
        }
    }
}
