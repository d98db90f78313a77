//! In-process bus transport for tests and local runs.
//!
//! One `tokio::sync::broadcast` channel per topic. Like NATS core, a message
//! published while nobody listens is dropped.

use super::transport::{BusSubscription, BusTransport};
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

#[derive(Debug, Default)]
struct BusState {
    channels: HashMap<String, broadcast::Sender<Message>>,
    unresponsive: bool,
    closed: bool,
    rejected_topics: HashSet<String>,
    failing_unsubscribes: HashSet<String>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ping` and `publish` hang, as a stalled server would.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    /// Refuse subscriptions to `topic`, as a permissions violation would.
    pub fn reject_topic(&self, topic: &str) {
        self.lock().rejected_topics.insert(topic.to_string());
    }

    /// Make unsubscribing from `topic` fail.
    pub fn fail_unsubscribe(&self, topic: &str) {
        self.lock().failing_unsubscribes.insert(topic.to_string());
    }

    /// End every subscription on `topic` from the server side.
    pub fn terminate_topic(&self, topic: &str) {
        self.lock().channels.remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .channels
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, message: &Message) -> Result<(), TransportError> {
        let sender = {
            let state = self.lock();
            if state.closed {
                return Err(TransportError::Fatal("bus is closed".to_string()));
            }
            if state.unresponsive {
                None
            } else {
                Some(state.channels.get(message.topic()).cloned())
            }
        };

        match sender {
            None => futures::future::pending().await,
            // No receivers is not an error for fire-and-forget.
            Some(Some(tx)) => {
                let _ = tx.send(message.clone());
                Ok(())
            }
            Some(None) => Ok(()),
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn BusSubscription>, TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Fatal("bus is closed".to_string()));
        }
        if state.rejected_topics.contains(topic) {
            return Err(TransportError::Fatal(format!(
                "permissions violation for subscription to {topic}"
            )));
        }
        let receiver = state
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        Ok(Box::new(MemorySubscription {
            bus: self.clone(),
            topic: topic.to_string(),
            receiver: Some(receiver),
        }))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let unresponsive = self.lock().unresponsive;
        if unresponsive {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.closed = true;
        state.channels.clear();
        Ok(())
    }
}

struct MemorySubscription {
    bus: MemoryBus,
    topic: String,
    receiver: Option<broadcast::Receiver<Message>>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn next(&mut self) -> Option<Message> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        self.receiver = None;
        if self.bus.lock().failing_unsubscribes.contains(&self.topic) {
            return Err(TransportError::Transient(format!(
                "unsubscribe from {} was not acknowledged",
                self.topic
            )));
        }
        Ok(())
    }
}
