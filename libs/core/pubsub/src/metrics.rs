//! Prometheus metrics for the messaging drivers.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global Prometheus recorder once and return its handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| PrometheusBuilder::new().install_recorder())
}

/// Render metrics in Prometheus text format; empty before [`init_metrics`].
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Metric helpers labelled with the driver's backend.
#[derive(Debug, Clone)]
pub(crate) struct PubSubMetrics {
    backend: &'static str,
}

impl PubSubMetrics {
    pub(crate) fn new(backend: &'static str) -> Self {
        Self { backend }
    }

    pub(crate) fn published(&self, topic: &str, duration: Duration) {
        counter!(
            "pubsub_messages_published_total",
            "backend" => self.backend,
            "topic" => topic.to_string()
        )
        .increment(1);

        histogram!(
            "pubsub_publish_duration_seconds",
            "backend" => self.backend
        )
        .record(duration.as_secs_f64());
    }

    pub(crate) fn publish_failed(&self, topic: &str, reason: &'static str) {
        counter!(
            "pubsub_publish_failures_total",
            "backend" => self.backend,
            "topic" => topic.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    pub(crate) fn delivered(&self, topic: &str, handler: &'static str, duration: Duration) {
        counter!(
            "pubsub_messages_delivered_total",
            "backend" => self.backend,
            "topic" => topic.to_string(),
            "handler" => handler
        )
        .increment(1);

        histogram!(
            "pubsub_handler_duration_seconds",
            "backend" => self.backend,
            "handler" => handler
        )
        .record(duration.as_secs_f64());
    }

    pub(crate) fn handler_failed(&self, topic: &str, handler: &'static str) {
        counter!(
            "pubsub_handler_failures_total",
            "backend" => self.backend,
            "topic" => topic.to_string(),
            "handler" => handler
        )
        .increment(1);
    }

    pub(crate) fn acknowledged(&self, topic: &str) {
        counter!(
            "pubsub_messages_acked_total",
            "backend" => self.backend,
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub(crate) fn claimed(&self, topic: &str, count: usize) {
        counter!(
            "pubsub_messages_claimed_total",
            "backend" => self.backend,
            "topic" => topic.to_string()
        )
        .increment(count as u64);
    }

    pub(crate) fn poison(&self, topic: &str) {
        counter!(
            "pubsub_poison_messages_total",
            "backend" => self.backend,
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub(crate) fn read_error(&self, topic: &str) {
        counter!(
            "pubsub_read_errors_total",
            "backend" => self.backend,
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub(crate) fn active_subscriptions(&self, count: usize) {
        gauge!(
            "pubsub_active_subscriptions",
            "backend" => self.backend
        )
        .set(count as f64);
    }
}
