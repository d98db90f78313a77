//! Topic to delivery-task bookkeeping shared by both drivers.
//!
//! The manager's lock is only held to reserve, install, remove or drain
//! entries. Transport setup and delivery never run under it, so a slow
//! topic cannot stall `subscribe_multiple` for the others or block close.

use crate::error::{AggregateSubscribeError, SubscribeError, TransportError};
use crate::health::TaskFailures;
use crate::message::validate_topic;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of a delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    /// Creating the group / registering the subscription.
    Joining,
    /// Re-delivering this consumer's own unacknowledged entries.
    Claiming,
    Delivering,
    /// Taking over entries abandoned by other consumers.
    Rebalancing,
    Stopped,
}

/// Snapshot of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub state: TaskState,
}

pub(crate) type TaskResult = Result<(), TransportError>;

/// Everything a delivery task needs from the manager.
pub(crate) struct TaskContext {
    pub(crate) topic: String,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) failures: Arc<TaskFailures>,
    state: watch::Sender<TaskState>,
    ready: Option<oneshot::Sender<TaskResult>>,
}

impl TaskContext {
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.send_replace(state);
    }

    /// Report the outcome of setup to the waiting subscribe call. Only the
    /// first report counts.
    pub(crate) fn ready(&mut self, result: TaskResult) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(result);
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when close begins. Also resolves if the manager is gone.
    pub(crate) async fn stopped(&mut self) {
        while !*self.shutdown.borrow_and_update() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep unless close begins first; returns `false` when stopping.
    pub(crate) async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopped() => false,
            _ = tokio::time::sleep(duration) => !self.is_stopping(),
        }
    }

    /// Mark the task dead so health checks report it.
    pub(crate) fn fail(&self, error: &TransportError) {
        self.failures.record(&self.topic, error.to_string());
    }
}

struct Entry {
    id: u64,
    state: watch::Receiver<TaskState>,
    task: JoinHandle<TaskResult>,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.task.is_finished() && *self.state.borrow() != TaskState::Stopped
    }
}

#[derive(Default)]
struct ManagerState {
    closed: bool,
    entries: HashMap<String, Entry>,
}

pub(crate) struct SubscriptionManager {
    state: Mutex<ManagerState>,
    shutdown: watch::Sender<bool>,
    failures: Arc<TaskFailures>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Mutex::new(ManagerState::default()),
            shutdown,
            failures: Arc::new(TaskFailures::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn failures(&self) -> &TaskFailures {
        &self.failures
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<_> = self
            .lock()
            .entries
            .iter()
            .map(|(topic, entry)| SubscriptionInfo {
                topic: topic.clone(),
                state: if entry.task.is_finished() {
                    TaskState::Stopped
                } else {
                    *entry.state.borrow()
                },
            })
            .collect();
        infos.sort_by(|a, b| a.topic.cmp(&b.topic));
        infos
    }

    pub(crate) fn active_count(&self) -> usize {
        self.lock().entries.values().filter(|e| e.is_live()).count()
    }

    /// Start one delivery task per topic and wait for every setup to finish.
    ///
    /// `spawn` is called under the lock and must only spawn; the task reports
    /// its setup result through [`TaskContext::ready`]. Successful topics stay
    /// subscribed even when others fail.
    pub(crate) async fn subscribe_all<F>(
        &self,
        topics: &[&str],
        spawn: F,
    ) -> Result<(), AggregateSubscribeError>
    where
        F: Fn(TaskContext) -> JoinHandle<TaskResult>,
    {
        let mut failures = Vec::new();
        let mut pending = Vec::new();

        {
            let mut state = self.lock();
            let mut seen = HashSet::new();

            for &topic in topics {
                if let Err(source) = validate_topic(topic) {
                    failures.push(SubscribeError::InvalidTopic {
                        topic: topic.to_string(),
                        source,
                    });
                    continue;
                }
                if state.closed {
                    failures.push(SubscribeError::Closed {
                        topic: topic.to_string(),
                    });
                    continue;
                }
                let live = state.entries.get(topic).is_some_and(Entry::is_live);
                if !seen.insert(topic) || live {
                    failures.push(SubscribeError::AlreadySubscribed {
                        topic: topic.to_string(),
                    });
                    continue;
                }

                // A failure recorded from here on belongs to the new task.
                self.failures.clear(topic);
                let (state_tx, state_rx) = watch::channel(TaskState::Joining);
                let (ready_tx, ready_rx) = oneshot::channel();
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let task = spawn(TaskContext {
                    topic: topic.to_string(),
                    shutdown: self.shutdown.subscribe(),
                    failures: self.failures.clone(),
                    state: state_tx,
                    ready: Some(ready_tx),
                });

                // A stopped task for the same topic is replaced.
                state.entries.insert(
                    topic.to_string(),
                    Entry {
                        id,
                        state: state_rx,
                        task,
                    },
                );
                pending.push((topic.to_string(), id, ready_rx));
            }
        }

        let outcomes = join_all(
            pending
                .into_iter()
                .map(|(topic, id, ready)| async move { (topic, id, ready.await) }),
        )
        .await;

        for (topic, id, outcome) in outcomes {
            let error = match outcome {
                Ok(Ok(())) => {
                    debug!(topic = %topic, "Subscription ready");
                    continue;
                }
                Ok(Err(source)) => SubscribeError::Transport {
                    topic: topic.clone(),
                    source,
                },
                // The task ended without reporting: aborted by close, or panicked.
                Err(_) => SubscribeError::Closed {
                    topic: topic.clone(),
                },
            };
            warn!(topic = %topic, error = %error, "Subscription failed");
            self.remove(&topic, id);
            failures.push(error);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateSubscribeError::new(topics.len(), failures))
        }
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut state = self.lock();
        if state.entries.get(topic).is_some_and(|e| e.id == id) {
            state.entries.remove(topic);
        }
    }

    /// Mark closed, signal every task, and wait up to `grace` for each one.
    ///
    /// Returns `None` when already closed. Otherwise returns the problems
    /// seen while stopping, one line per topic.
    pub(crate) async fn shutdown(&self, grace: Duration) -> Option<Vec<String>> {
        let entries = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        self.shutdown.send_replace(true);

        let results = join_all(entries.into_iter().map(|(topic, mut entry)| async move {
            match tokio::time::timeout(grace, &mut entry.task).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(format!("{topic}: {e}")),
                Ok(Err(join)) if join.is_cancelled() => None,
                Ok(Err(join)) => Some(format!("{topic}: delivery task panicked: {join}")),
                Err(_) => {
                    entry.task.abort();
                    Some(format!("{topic}: delivery task did not stop within {grace:?}"))
                }
            }
        }))
        .await;

        Some(results.into_iter().flatten().collect())
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
