use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;

/// A fire-and-forget bus: every live subscriber of a topic gets every
/// message published after it subscribed. Nothing is stored.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    fn backend(&self) -> &'static str;

    /// Send and wait until the server has the message. Delivery to
    /// subscribers is not confirmed.
    async fn publish(&self, message: &Message) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn BusSubscription>, TransportError>;

    /// Cheap round trip with no side effects.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Flush and release the connection. Called once, after every
    /// subscription has been unsubscribed.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BusSubscription: Send {
    /// The next message, or `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Message>;

    async fn unsubscribe(&mut self) -> Result<(), TransportError>;
}
