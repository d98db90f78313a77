//! Error types for publishing, subscribing and shutting down.

use crate::handler::HandlerError;
use std::time::Duration;
use thiserror::Error;

/// Rejected topic names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,

    #[error("topic {0:?} must not contain whitespace")]
    Whitespace(String),
}

/// Failures reported by a transport implementation.
///
/// The delivery loops use the variant to decide between backing off,
/// recreating the consumer group, or giving up on the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("consumer group missing: {0}")]
    MissingGroup(String),

    #[error("unrecoverable transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal(_))
    }
}

impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        let text = err.to_string();
        if text.contains("NOGROUP") {
            TransportError::MissingGroup(text)
        } else if ["NOAUTH", "WRONGPASS", "NOPERM", "WRONGTYPE"]
            .iter()
            .any(|code| text.contains(code))
        {
            TransportError::Fatal(text)
        } else {
            TransportError::Transient(text)
        }
    }
}

/// The driver could not establish its connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid connection settings: {0}")]
    Config(String),

    #[error("Redis connection failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("NATS connection failed: {0}")]
    Nats(#[from] async_nats::ConnectError),

    #[error("Connection did not respond within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("messaging driver is closed")]
    Closed,

    #[error("publish to {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("publish to {topic} failed: {source}")]
    Transport {
        topic: String,
        #[source]
        source: TransportError,
    },
}

/// A single topic that could not be subscribed.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("invalid topic {topic:?}: {source}")]
    InvalidTopic {
        topic: String,
        #[source]
        source: TopicError,
    },

    #[error("topic {topic} already has an active subscription")]
    AlreadySubscribed { topic: String },

    #[error("cannot subscribe to {topic}: messaging driver is closed")]
    Closed { topic: String },

    #[error("subscribing to {topic} failed: {source}")]
    Transport {
        topic: String,
        #[source]
        source: TransportError,
    },
}

impl SubscribeError {
    pub fn topic(&self) -> &str {
        match self {
            SubscribeError::InvalidTopic { topic, .. }
            | SubscribeError::AlreadySubscribed { topic }
            | SubscribeError::Closed { topic }
            | SubscribeError::Transport { topic, .. } => topic,
        }
    }
}

/// Every per-topic failure from one `subscribe_multiple` call.
///
/// Topics that are not listed here were subscribed and stay active.
#[derive(Debug, Error)]
#[error("{} of {attempted} subscriptions failed: {}", .failures.len(), summarize(.failures))]
pub struct AggregateSubscribeError {
    attempted: usize,
    failures: Vec<SubscribeError>,
}

impl AggregateSubscribeError {
    pub(crate) fn new(attempted: usize, failures: Vec<SubscribeError>) -> Self {
        Self {
            attempted,
            failures,
        }
    }

    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn failures(&self) -> &[SubscribeError] {
        &self.failures
    }

    pub fn failed_topics(&self) -> Vec<&str> {
        self.failures.iter().map(SubscribeError::topic).collect()
    }

    pub fn into_failures(self) -> Vec<SubscribeError> {
        self.failures
    }
}

fn summarize(failures: &[SubscribeError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A handler rejected a message. Logged by the delivery loop, never returned
/// to callers.
#[derive(Debug, Error)]
#[error("handler {handler} failed on {topic} (id: {}): {source}", .message_id.as_deref().unwrap_or("-"))]
pub struct DeliveryError {
    pub topic: String,
    pub message_id: Option<String>,
    pub handler: &'static str,
    #[source]
    pub source: HandlerError,
}

/// Problems encountered while shutting a driver down.
///
/// Close always runs to completion; this lists what went wrong on the way.
#[derive(Debug, Error)]
#[error("close finished with {} error(s): {}", .failures.len(), .failures.join("; "))]
pub struct CloseError {
    failures: Vec<String>,
}

impl CloseError {
    pub(crate) fn from_failures(failures: Vec<String>) -> Result<(), Self> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self { failures })
        }
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}
