use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use std::time::Duration;

/// One entry read from a topic log.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Transport id used for acknowledgement.
    pub id: String,
    /// `None` when the entry cannot be decoded or was trimmed away while
    /// pending. Such entries are acknowledged and skipped.
    pub message: Option<Message>,
    /// The entry was delivered before (own backlog or claimed).
    pub redelivered: bool,
}

/// Identity of a group member reading one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub topic: String,
    pub group: String,
    pub consumer: String,
}

/// A durable, partitioned log with consumer groups.
#[async_trait]
pub trait LogTransport: Send + Sync + 'static {
    /// Label for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Create the group (and topic) if missing. Existing groups are fine.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), TransportError>;

    /// Append a message, returning its id.
    async fn append(&self, message: &Message, max_length: usize) -> Result<String, TransportError>;

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), TransportError>;

    /// Open a reader for one member. `block` selects blocking reads.
    async fn open_reader(
        &self,
        member: GroupMember,
        block: Option<Duration>,
    ) -> Result<Box<dyn LogReader>, TransportError>;

    /// Cheap round trip with no side effects.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Release connections. Called once, after every reader is gone.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Reads on behalf of one group member.
#[async_trait]
pub trait LogReader: Send {
    /// This member's delivered-but-unacknowledged entries with ids after
    /// `after` (`"0"` for all).
    async fn read_pending(&mut self, after: &str, count: usize) -> Result<Vec<LogRecord>, TransportError>;

    /// Entries never delivered to any member of the group.
    async fn read_new(&mut self, count: usize) -> Result<Vec<LogRecord>, TransportError>;

    /// Take over entries other members left unacknowledged for `min_idle`.
    async fn claim_idle(&mut self, min_idle: Duration, count: usize) -> Result<Vec<LogRecord>, TransportError>;
}
