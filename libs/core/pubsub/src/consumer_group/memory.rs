//! In-process log transport for tests and local runs.
//!
//! Mirrors the consumer-group rules the Redis transport relies on: groups
//! start at the end of the topic, every read of new entries assigns them to
//! the reading member as pending, pending entries survive the reader and are
//! only removed by an acknowledgement. Clones share state, so a "restarted"
//! driver built from a clone sees the same pending entries.

use super::transport::{GroupMember, LogReader, LogRecord, LogTransport};
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
}

#[derive(Debug, Default)]
struct LogState {
    topics: HashMap<String, TopicLog>,
    unresponsive: bool,
    rejected_topics: HashSet<String>,
    read_faults: HashMap<String, VecDeque<TransportError>>,
}

#[derive(Debug, Default)]
struct TopicLog {
    entries: BTreeMap<u64, Option<Message>>,
    last_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ping` hang, as a server that stopped answering would.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    /// Refuse to create groups on `topic`, as an ACL denial would.
    pub fn reject_topic(&self, topic: &str) {
        self.lock().rejected_topics.insert(topic.to_string());
    }

    /// Queue errors returned by the next reads on `topic`.
    pub fn inject_read_errors(&self, topic: &str, errors: impl IntoIterator<Item = TransportError>) {
        self.lock()
            .read_faults
            .entry(topic.to_string())
            .or_default()
            .extend(errors);
    }

    /// Drop every consumer group on `topic`.
    pub fn destroy_groups(&self, topic: &str) {
        if let Some(log) = self.lock().topics.get_mut(topic) {
            log.groups.clear();
        }
    }

    /// Write an entry with no decodable payload.
    pub fn append_undecodable(&self, topic: &str) -> String {
        self.lock().append(topic, None)
    }

    pub fn len(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, |log| log.entries.len())
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Delivered but unacknowledged entries of `group` on `topic`.
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Pending entries owned by one consumer.
    pub fn pending_for(&self, topic: &str, group: &str, consumer: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.pending.values().filter(|p| p.consumer == consumer).count())
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LogState {
    fn append(&mut self, topic: &str, message: Option<Message>) -> String {
        let log = self.topics.entry(topic.to_string()).or_default();
        log.last_seq += 1;
        log.entries.insert(log.last_seq, message);
        format_id(log.last_seq)
    }

    fn take_fault(&mut self, topic: &str) -> Option<TransportError> {
        self.read_faults.get_mut(topic).and_then(VecDeque::pop_front)
    }

    /// The topic's entries plus the member's group, or `MissingGroup`.
    fn member_view(
        &mut self,
        member: &GroupMember,
    ) -> Result<(&BTreeMap<u64, Option<Message>>, &mut GroupState), TransportError> {
        let log = self
            .topics
            .get_mut(&member.topic)
            .ok_or_else(|| missing_group(member))?;
        let TopicLog { entries, groups, .. } = log;
        let group = groups
            .get_mut(&member.group)
            .ok_or_else(|| missing_group(member))?;
        Ok((entries, group))
    }
}

fn missing_group(member: &GroupMember) -> TransportError {
    TransportError::MissingGroup(format!(
        "no consumer group {} on {}",
        member.group, member.topic
    ))
}

fn format_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Result<u64, TransportError> {
    let seq = id.split_once('-').map_or(id, |(seq, _)| seq);
    seq.parse()
        .map_err(|_| TransportError::Fatal(format!("invalid entry id {id:?}")))
}

#[async_trait]
impl LogTransport for MemoryLog {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.rejected_topics.contains(topic) {
            return Err(TransportError::Fatal(format!(
                "NOPERM not allowed to create groups on {topic}"
            )));
        }
        let log = state.topics.entry(topic.to_string()).or_default();
        let last_seq = log.last_seq;
        log.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            last_delivered: last_seq,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn append(&self, message: &Message, _max_length: usize) -> Result<String, TransportError> {
        Ok(self.lock().append(message.topic(), Some(message.clone())))
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), TransportError> {
        let seq = parse_id(id)?;
        if let Some(group) = self
            .lock()
            .topics
            .get_mut(topic)
            .and_then(|log| log.groups.get_mut(group))
        {
            group.pending.remove(&seq);
        }
        Ok(())
    }

    async fn open_reader(
        &self,
        member: GroupMember,
        _block: Option<Duration>,
    ) -> Result<Box<dyn LogReader>, TransportError> {
        Ok(Box::new(MemoryReader {
            log: self.clone(),
            member,
        }))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let unresponsive = self.lock().unresponsive;
        if unresponsive {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

struct MemoryReader {
    log: MemoryLog,
    member: GroupMember,
}

#[async_trait]
impl LogReader for MemoryReader {
    async fn read_pending(&mut self, after: &str, count: usize) -> Result<Vec<LogRecord>, TransportError> {
        let after = parse_id(after)?;
        let mut state = self.log.lock();
        if let Some(fault) = state.take_fault(&self.member.topic) {
            return Err(fault);
        }
        let (entries, group) = state.member_view(&self.member)?;

        let now = Instant::now();
        let records = group
            .pending
            .range_mut(after + 1..)
            .filter(|(_, p)| p.consumer == self.member.consumer)
            .take(count)
            .map(|(seq, p)| {
                p.delivered_at = now;
                LogRecord {
                    id: format_id(*seq),
                    message: entries.get(seq).cloned().flatten(),
                    redelivered: true,
                }
            })
            .collect();
        Ok(records)
    }

    async fn read_new(&mut self, count: usize) -> Result<Vec<LogRecord>, TransportError> {
        let mut state = self.log.lock();
        if let Some(fault) = state.take_fault(&self.member.topic) {
            return Err(fault);
        }
        let (entries, group) = state.member_view(&self.member)?;

        let now = Instant::now();
        let mut records = Vec::new();
        for (seq, message) in entries.range(group.last_delivered + 1..).take(count) {
            group.last_delivered = *seq;
            group.pending.insert(
                *seq,
                PendingEntry {
                    consumer: self.member.consumer.clone(),
                    delivered_at: now,
                },
            );
            records.push(LogRecord {
                id: format_id(*seq),
                message: message.clone(),
                redelivered: false,
            });
        }
        Ok(records)
    }

    async fn claim_idle(&mut self, min_idle: Duration, count: usize) -> Result<Vec<LogRecord>, TransportError> {
        let mut state = self.log.lock();
        let (entries, group) = state.member_view(&self.member)?;

        // The whole pending list is scanned, as the Redis reader pages it.
        let now = Instant::now();
        let records = group
            .pending
            .iter_mut()
            .filter(|(_, p)| {
                p.consumer != self.member.consumer && now.duration_since(p.delivered_at) >= min_idle
            })
            .take(count)
            .map(|(seq, p)| {
                p.consumer = self.member.consumer.clone();
                p.delivered_at = now;
                LogRecord {
                    id: format_id(*seq),
                    message: entries.get(seq).cloned().flatten(),
                    redelivered: true,
                }
            })
            .collect();
        Ok(records)
    }
}
