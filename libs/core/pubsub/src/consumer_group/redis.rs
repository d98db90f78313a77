//! Redis Streams implementation of the log transport.
//!
//! A topic is a stream. Entries carry two fields: `payload` (raw bytes) and
//! `headers` (a JSON object, omitted when empty).

use super::transport::{GroupMember, LogReader, LogRecord, LogTransport};
use crate::config::ConsumerGroupConfig;
use crate::error::{ConnectionError, TransportError};
use crate::message::{Headers, Message};
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::RedisResult;
use std::time::Duration;
use tracing::{debug, info};

const PAYLOAD_FIELD: &str = "payload";
const HEADERS_FIELD: &str = "headers";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Fields = Vec<(String, Vec<u8>)>;
type Entries = Vec<(String, Option<Fields>)>;
type StreamsReply = Vec<(String, Entries)>;

/// Redis Streams with consumer groups.
#[derive(Clone)]
pub struct RedisStreams {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStreams {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &ConsumerGroupConfig) -> Result<Self, ConnectionError> {
        let client = redis::Client::open(config.connection_url()?)?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| ConnectionError::Timeout(CONNECT_TIMEOUT))??;

        let mut probe = conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut probe).await?;

        info!(group = %config.group, "Connected to Redis");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl LogTransport for RedisStreams {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();

        // New groups start at the end of the stream, like a fresh Kafka
        // group reading from the newest offset.
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(topic = %topic, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(topic = %topic, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, message: &Message, max_length: usize) -> Result<String, TransportError> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(message.topic())
            .arg("MAXLEN")
            .arg("~")
            .arg(max_length)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(message.payload());

        if !message.headers().is_empty() {
            let headers = serde_json::to_string(message.headers())
                .map_err(|e| TransportError::Fatal(format!("headers not encodable: {e}")))?;
            cmd.arg(HEADERS_FIELD).arg(headers);
        }

        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(topic)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn open_reader(
        &self,
        member: GroupMember,
        block: Option<Duration>,
    ) -> Result<Box<dyn LogReader>, TransportError> {
        match block {
            // A blocked XREADGROUP would hold up every other command on the
            // shared connection, so blocking readers get their own.
            Some(block) => {
                let conn = self.client.get_multiplexed_async_connection().await?;
                Ok(Box::new(RedisReader {
                    conn,
                    member,
                    block: Some(block),
                }))
            }
            None => Ok(Box::new(RedisReader {
                conn: self.conn.clone(),
                member,
                block: None,
            })),
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

struct RedisReader<C> {
    conn: C,
    member: GroupMember,
    block: Option<Duration>,
}

#[async_trait]
impl<C> LogReader for RedisReader<C>
where
    C: ConnectionLike + Send + Sync + 'static,
{
    async fn read_pending(&mut self, after: &str, count: usize) -> Result<Vec<LogRecord>, TransportError> {
        let reply: Option<StreamsReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.member.group)
            .arg(&self.member.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.member.topic)
            .arg(after)
            .query_async(&mut self.conn)
            .await?;

        Ok(flatten(&self.member.topic, reply, true))
    }

    async fn read_new(&mut self, count: usize) -> Result<Vec<LogRecord>, TransportError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.member.group)
            .arg(&self.member.consumer);

        if let Some(block) = self.block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }

        cmd.arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.member.topic)
            .arg(">");

        let result: RedisResult<Option<StreamsReply>> = cmd.query_async(&mut self.conn).await;
        match result {
            Ok(reply) => Ok(flatten(&self.member.topic, reply, false)),
            // A client-side response timeout during BLOCK is an empty read.
            Err(e) if self.block.is_some() && e.is_timeout() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_idle(&mut self, min_idle: Duration, count: usize) -> Result<Vec<LogRecord>, TransportError> {
        let min_idle_ms = min_idle.as_millis() as u64;

        // Own idle entries can fill a whole XPENDING page, so page on with an
        // exclusive start until `count` foreign ids are found or the list ends.
        let mut ids = Vec::new();
        let mut start = "-".to_string();
        while ids.len() < count {
            // (id, consumer, idle_ms, delivery_count)
            let page: Vec<(String, String, i64, i64)> = redis::cmd("XPENDING")
                .arg(&self.member.topic)
                .arg(&self.member.group)
                .arg("IDLE")
                .arg(min_idle_ms)
                .arg(&start)
                .arg("+")
                .arg(count)
                .query_async(&mut self.conn)
                .await?;

            let exhausted = page.len() < count;
            if let Some((last, _, _, _)) = page.last() {
                start = format!("({last}");
            }
            let wanted = count - ids.len();
            ids.extend(
                page.into_iter()
                    .filter(|(_, owner, _, _)| *owner != self.member.consumer)
                    .map(|(id, _, _, _)| id)
                    .take(wanted),
            );
            if exhausted {
                break;
            }
        }

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.member.topic)
            .arg(&self.member.group)
            .arg(&self.member.consumer)
            .arg(min_idle_ms);
        for id in &ids {
            cmd.arg(id);
        }

        let claimed: Entries = cmd.query_async(&mut self.conn).await?;
        Ok(claimed
            .into_iter()
            .map(|(id, fields)| decode(&self.member.topic, id, fields, true))
            .collect())
    }
}

fn flatten(topic: &str, reply: Option<StreamsReply>, redelivered: bool) -> Vec<LogRecord> {
    reply
        .unwrap_or_default()
        .into_iter()
        .flat_map(|(_, entries)| entries)
        .map(|(id, fields)| decode(topic, id, fields, redelivered))
        .collect()
}

/// Entries trimmed while pending come back without fields; entries written
/// by something else lack the payload field. Both decode to no message.
fn decode(topic: &str, id: String, fields: Option<Fields>, redelivered: bool) -> LogRecord {
    let message = fields.and_then(|fields| {
        let mut payload = None;
        let mut headers = Headers::new();
        for (name, value) in fields {
            match name.as_str() {
                PAYLOAD_FIELD => payload = Some(value),
                HEADERS_FIELD => headers = serde_json::from_slice(&value).ok()?,
                _ => {}
            }
        }
        payload.map(|payload| Message::from_parts(topic.to_string(), payload, headers))
    });

    LogRecord {
        id,
        message,
        redelivered,
    }
}
