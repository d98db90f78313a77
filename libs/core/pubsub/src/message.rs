//! The transport-independent message envelope.

use crate::error::TopicError;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;

/// String headers carried alongside a payload.
pub type Headers = HashMap<String, String>;

/// A message as published and as delivered to handlers.
///
/// Fields are private so a message cannot change after it is built.
/// Handlers receive the message by value, so each delivery owns its copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Vec<u8>,
    headers: Headers,
}

impl Message {
    /// Build a message with an opaque payload and no headers.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<Self, TopicError> {
        let topic = topic.into();
        validate_topic(&topic)?;
        Ok(Self {
            topic,
            payload: payload.into(),
            headers: Headers::new(),
        })
    }

    /// Build a message whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self, MessageError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(topic, payload)?)
    }

    /// Used by drivers for topics that were validated at subscribe time.
    pub(crate) fn from_parts(topic: String, payload: Vec<u8>, headers: Headers) -> Self {
        Self {
            topic,
            payload,
            headers,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Decode the payload as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn into_parts(self) -> (String, Vec<u8>, Headers) {
        (self.topic, self.payload, self.headers)
    }
}

/// Errors building a [`Message`] from a typed value.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("Failed to encode payload: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Topics must be non-empty and contain no whitespace.
///
/// Whitespace is rejected because NATS subjects cannot carry it and a
/// topic has to mean the same thing on every backend.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.chars().any(char::is_whitespace) {
        return Err(TopicError::Whitespace(topic.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        sku: String,
    }

    #[test]
    fn test_new_rejects_empty_topic() {
        assert_eq!(Message::new("", b"x".to_vec()), Err(TopicError::Empty));
    }

    #[test]
    fn test_new_rejects_whitespace() {
        let err = Message::new("orders new", b"x".to_vec()).unwrap_err();
        assert!(matches!(err, TopicError::Whitespace(ref t) if t == "orders new"));
    }

    #[test]
    fn test_headers_builder() {
        let msg = Message::new("orders", "hello")
            .unwrap()
            .with_header("trace-id", "abc")
            .with_headers([("source", "checkout")]);

        assert_eq!(msg.topic(), "orders");
        assert_eq!(msg.payload(), b"hello");
        assert_eq!(msg.header("trace-id"), Some("abc"));
        assert_eq!(msg.header("source"), Some("checkout"));
        assert_eq!(msg.header("missing"), None);
    }

    #[test]
    fn test_json_payload() {
        let order = Order {
            id: 7,
            sku: "A-1".to_string(),
        };
        let msg = Message::json("orders", &order).unwrap();

        assert_eq!(msg.parse_json::<Order>().unwrap(), order);
    }

    #[test]
    fn test_json_payload_invalid_topic() {
        let err = Message::json("", &1u8).unwrap_err();
        assert!(matches!(err, MessageError::Topic(TopicError::Empty)));
    }

    #[test]
    fn test_empty_payload_is_allowed() {
        let msg = Message::new("pings", Vec::new()).unwrap();
        assert!(msg.payload().is_empty());
    }
}
