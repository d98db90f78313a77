#![allow(dead_code)]

use async_trait::async_trait;
use pubsub::{DeliveryContext, HandlerError, Headers, Message, MessageHandler};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

/// One delivery as the handler saw it.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub topic: String,
    pub payload: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub headers: Headers,
}

/// Handler that records every delivery and fails on payloads it was told to
/// reject.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Delivered>>,
    reject: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn rejecting(payload: &str) -> Arc<Self> {
        let recorder = Self::default();
        recorder.reject.lock().unwrap().insert(payload.to_string());
        Arc::new(recorder)
    }

    pub fn seen(&self) -> Vec<Delivered> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter(|d| d.topic == topic)
            .map(|d| d.payload)
            .collect()
    }

    /// Most handler calls observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, ctx: DeliveryContext, message: Message) -> Result<(), HandlerError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let payload = String::from_utf8_lossy(message.payload()).into_owned();
        self.seen.lock().unwrap().push(Delivered {
            topic: ctx.topic().to_string(),
            payload: payload.clone(),
            redelivered: ctx.is_redelivery(),
            message_id: ctx.message_id().map(str::to_string),
            headers: message.headers().clone(),
        });

        if self.reject.lock().unwrap().contains(&payload) {
            return Err(HandlerError::new(format!("rejected {payload}")));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recorder"
    }
}
