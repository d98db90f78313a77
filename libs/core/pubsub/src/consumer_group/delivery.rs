//! The per-topic delivery loop for the consumer-group driver.
//!
//! ```text
//! Joining ──▶ Claiming ──▶ Delivering ◀──▶ Rebalancing
//!    │            │             │                │
//!    └────────────┴─────────────┴── close/fatal ─┴──▶ Stopped
//! ```
//!
//! Messages are handled one at a time. A message is acknowledged only after
//! its handler returned `Ok`; a failed message stays pending and comes back
//! on restart or when another member claims it.

use super::transport::{GroupMember, LogReader, LogRecord, LogTransport};
use crate::config::BackoffStrategy;
use crate::error::{DeliveryError, TransportError};
use crate::handler::{invoke, DeliveryContext, SharedHandler};
use crate::metrics::PubSubMetrics;
use crate::subscription::{TaskContext, TaskResult, TaskState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Loop tuning taken from the driver config.
#[derive(Debug, Clone)]
pub(crate) struct DeliverySettings {
    pub(crate) batch_size: usize,
    pub(crate) block: Option<Duration>,
    pub(crate) poll_interval: Duration,
    pub(crate) claim_idle: Duration,
    pub(crate) claim_interval: Duration,
    pub(crate) backoff: BackoffStrategy,
}

pub(crate) struct DeliveryTask {
    pub(crate) ctx: TaskContext,
    pub(crate) member: GroupMember,
    pub(crate) transport: Arc<dyn LogTransport>,
    pub(crate) handler: SharedHandler,
    pub(crate) settings: DeliverySettings,
    pub(crate) metrics: PubSubMetrics,
}

impl DeliveryTask {
    pub(crate) async fn run(mut self) -> TaskResult {
        let setup = join_group(self.transport.as_ref(), &self.member, self.settings.block);
        let joined = tokio::select! {
            _ = self.ctx.stopped() => {
                self.ctx.set_state(TaskState::Stopped);
                return Ok(());
            }
            joined = setup => joined,
        };

        let mut reader = match joined {
            Ok(reader) => reader,
            Err(e) => {
                self.ctx.set_state(TaskState::Stopped);
                self.ctx.ready(Err(e));
                return Ok(());
            }
        };
        self.ctx.ready(Ok(()));
        info!(
            group = %self.member.group,
            consumer = %self.member.consumer,
            "Joined consumer group"
        );

        let outcome = self.deliver(reader.as_mut()).await;
        self.ctx.set_state(TaskState::Stopped);

        match outcome {
            Ok(()) => info!("Delivery stopped"),
            Err(e) => {
                error!(error = %e, "Delivery stopped on unrecoverable error");
                self.ctx.fail(&e);
            }
        }
        Ok(())
    }

    async fn deliver(&mut self, reader: &mut dyn LogReader) -> Result<(), TransportError> {
        let batch_size = self.settings.batch_size;
        let mut errors = 0u32;

        // Own backlog first: entries delivered to this consumer id before a
        // restart and never acknowledged.
        self.ctx.set_state(TaskState::Claiming);
        let mut cursor = "0".to_string();
        loop {
            let batch = tokio::select! {
                _ = self.ctx.stopped() => return Ok(()),
                batch = reader.read_pending(&cursor, batch_size) => batch,
            };
            match batch {
                Ok(records) if records.is_empty() => break,
                Ok(records) => {
                    errors = 0;
                    // Advance past everything read, including failures, so a
                    // failing entry is not retried in this process.
                    if let Some(last) = records.last() {
                        cursor = last.id.clone();
                    }
                    debug!(count = records.len(), "Re-delivering pending messages");
                    if !self.handle_batch(records).await? {
                        return Ok(());
                    }
                }
                Err(e) => {
                    if !self.recover(e, &mut errors).await? {
                        return Ok(());
                    }
                }
            }
        }

        self.ctx.set_state(TaskState::Delivering);
        let mut last_claim = Instant::now();
        loop {
            if self.ctx.is_stopping() {
                return Ok(());
            }

            if last_claim.elapsed() >= self.settings.claim_interval {
                last_claim = Instant::now();
                if !self.rebalance(reader, &mut errors).await? {
                    return Ok(());
                }
            }

            let batch = tokio::select! {
                _ = self.ctx.stopped() => return Ok(()),
                batch = reader.read_new(batch_size) => batch,
            };
            let keep_going = match batch {
                Ok(records) if records.is_empty() => {
                    errors = 0;
                    // Blocking reads already waited on the server.
                    self.settings.block.is_some() || self.ctx.sleep(self.settings.poll_interval).await
                }
                Ok(records) => {
                    errors = 0;
                    self.handle_batch(records).await?
                }
                Err(e) => self.recover(e, &mut errors).await?,
            };
            if !keep_going {
                return Ok(());
            }
        }
    }

    async fn rebalance(&mut self, reader: &mut dyn LogReader, errors: &mut u32) -> Result<bool, TransportError> {
        self.ctx.set_state(TaskState::Rebalancing);
        let claim_idle = self.settings.claim_idle;
        let batch_size = self.settings.batch_size;

        let claimed = tokio::select! {
            _ = self.ctx.stopped() => return Ok(false),
            claimed = reader.claim_idle(claim_idle, batch_size) => claimed,
        };
        let keep_going = match claimed {
            Ok(records) => {
                if !records.is_empty() {
                    info!(count = records.len(), "Claimed idle messages from other consumers");
                    self.metrics.claimed(&self.member.topic, records.len());
                }
                self.handle_batch(records).await?
            }
            Err(e) => self.recover(e, errors).await?,
        };

        self.ctx.set_state(TaskState::Delivering);
        Ok(keep_going)
    }

    /// Returns `false` once close has begun; the remaining records stay
    /// pending for the next owner.
    async fn handle_batch(&self, records: Vec<LogRecord>) -> Result<bool, TransportError> {
        for record in records {
            if self.ctx.is_stopping() {
                return Ok(false);
            }
            self.handle_record(record).await?;
        }
        Ok(true)
    }

    async fn handle_record(&self, record: LogRecord) -> Result<(), TransportError> {
        let topic = &self.member.topic;
        let Some(message) = record.message else {
            warn!(id = %record.id, "Skipping entry without a decodable payload");
            self.metrics.poison(topic);
            return self.acknowledge(&record.id).await;
        };

        let handler_name = self.handler.name();
        let ctx = DeliveryContext::new(
            topic.clone(),
            Some(record.id.clone()),
            record.redelivered,
            self.ctx.shutdown.clone(),
        );
        let started = Instant::now();

        match invoke(self.handler.as_ref(), ctx, message).await {
            Ok(()) => {
                self.metrics.delivered(topic, handler_name, started.elapsed());
                self.acknowledge(&record.id).await
            }
            Err(source) => {
                let error = DeliveryError {
                    topic: topic.clone(),
                    message_id: Some(record.id),
                    handler: handler_name,
                    source,
                };
                self.metrics.handler_failed(topic, handler_name);
                warn!(error = %error, "Handler failed, message left unacknowledged");
                Ok(())
            }
        }
    }

    async fn acknowledge(&self, id: &str) -> Result<(), TransportError> {
        let member = &self.member;
        match self.transport.ack(&member.topic, &member.group, id).await {
            Ok(()) => {
                self.metrics.acknowledged(&member.topic);
                debug!(id = %id, "Acknowledged");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(id = %id, error = %e, "Acknowledge failed, message will be redelivered");
                Ok(())
            }
        }
    }

    /// Decide what a read error means. Returns `Ok(false)` if close began
    /// while backing off.
    async fn recover(&mut self, error: TransportError, errors: &mut u32) -> Result<bool, TransportError> {
        self.metrics.read_error(&self.member.topic);

        let error = match error {
            TransportError::Fatal(_) => return Err(error),
            TransportError::MissingGroup(_) => {
                warn!(error = %error, "Consumer group missing, recreating");
                match self
                    .transport
                    .ensure_group(&self.member.topic, &self.member.group)
                    .await
                {
                    Ok(()) => return Ok(true),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => e,
                }
            }
            TransportError::Transient(_) => error,
        };

        let delay = self.settings.backoff.delay(*errors);
        *errors = errors.saturating_add(1);
        warn!(
            error = %error,
            consecutive_errors = *errors,
            delay_ms = delay.as_millis() as u64,
            "Read failed, backing off"
        );
        Ok(self.ctx.sleep(delay).await)
    }
}

async fn join_group(
    transport: &dyn LogTransport,
    member: &GroupMember,
    block: Option<Duration>,
) -> Result<Box<dyn LogReader>, TransportError> {
    transport.ensure_group(&member.topic, &member.group).await?;
    transport.open_reader(member.clone(), block).await
}
