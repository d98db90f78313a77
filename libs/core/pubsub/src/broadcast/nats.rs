//! NATS core implementation of the bus transport.

use super::transport::{BusSubscription, BusTransport};
use crate::config::BroadcastConfig;
use crate::error::{ConnectionError, TransportError};
use crate::message::{Headers, Message};
use async_nats::connection::State;
use async_nats::{Client, ConnectOptions, HeaderMap, Subscriber};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

/// NATS client shared by every subscription of one driver.
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Connect using the configured credentials.
    pub async fn connect(config: &BroadcastConfig) -> Result<Self, ConnectionError> {
        let options = match (&config.token, &config.user, &config.password) {
            (Some(token), _, _) => ConnectOptions::with_token(token.clone()),
            (None, Some(user), Some(password)) => {
                ConnectOptions::with_user_and_password(user.clone(), password.clone())
            }
            _ => ConnectOptions::new(),
        };

        let client = options
            .name(&config.connection_name)
            .connection_timeout(config.connect_timeout)
            .connect(config.url.as_str())
            .await?;

        info!(url = %config.url, name = %config.connection_name, "Connected to NATS");
        Ok(Self { client })
    }
}

#[async_trait]
impl BusTransport for NatsBus {
    fn backend(&self) -> &'static str {
        "nats"
    }

    async fn publish(&self, message: &Message) -> Result<(), TransportError> {
        let subject = message.topic().to_string();
        let payload = message.payload().to_vec().into();

        let sent = if message.headers().is_empty() {
            self.client.publish(subject, payload).await
        } else {
            let mut headers = HeaderMap::new();
            for (name, value) in message.headers() {
                headers.insert(name.as_str(), value.as_str());
            }
            self.client.publish_with_headers(subject, headers, payload).await
        };
        sent.map_err(|e| TransportError::Transient(e.to_string()))?;

        // publish only queues locally; flush waits for the server.
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn BusSubscription>, TransportError> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| TransportError::Transient(format!("subscribe to {topic}: {e}")))?;

        debug!(subject = %topic, "Subscribed");
        Ok(Box::new(NatsSubscription { subscriber }))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let state = self.client.connection_state();
        if !matches!(state, State::Connected) {
            return Err(TransportError::Transient(format!("connection is {state:?}")));
        }
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Transient(format!("final flush: {e}")))?;
        // Closes the connection for every clone of the client.
        self.client
            .drain()
            .await
            .map_err(|e| TransportError::Transient(format!("drain: {e}")))
    }
}

struct NatsSubscription {
    subscriber: Subscriber,
}

#[async_trait]
impl BusSubscription for NatsSubscription {
    async fn next(&mut self) -> Option<Message> {
        self.subscriber.next().await.map(|msg| {
            // Multi-valued headers keep their first value.
            let headers: Headers = msg
                .headers
                .as_ref()
                .map(|headers| {
                    headers
                        .iter()
                        .filter_map(|(name, values)| {
                            values.first().map(|v| (name.to_string(), v.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default();

            Message::from_parts(msg.subject.to_string(), msg.payload.to_vec(), headers)
        })
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))
    }
}
