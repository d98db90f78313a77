//! Read-only health probing.

use crate::error::TransportError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        HealthStatus::Unhealthy {
            reason: reason.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Topics whose delivery task stopped on an unrecoverable error.
///
/// Cleared per topic when that topic is subscribed again.
#[derive(Debug, Default)]
pub(crate) struct TaskFailures {
    inner: Mutex<BTreeMap<String, String>>,
}

impl TaskFailures {
    pub(crate) fn record(&self, topic: &str, reason: impl Into<String>) {
        self.lock().insert(topic.to_string(), reason.into());
    }

    pub(crate) fn clear(&self, topic: &str) {
        self.lock().remove(topic);
    }

    pub(crate) fn summary(&self) -> Option<String> {
        let failures = self.lock();
        if failures.is_empty() {
            return None;
        }
        Some(
            failures
                .iter()
                .map(|(topic, reason)| format!("{topic}: {reason}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs a liveness round trip bounded by `deadline`, then folds in any dead
/// delivery tasks. Nothing is published or consumed.
pub(crate) async fn probe<F>(
    backend: &str,
    deadline: Duration,
    ping: F,
    failures: &TaskFailures,
) -> HealthStatus
where
    F: Future<Output = Result<(), TransportError>>,
{
    match tokio::time::timeout(deadline, ping).await {
        Err(_) => {
            return HealthStatus::unhealthy(format!(
                "{backend} did not respond within {deadline:?}"
            ))
        }
        Ok(Err(e)) => return HealthStatus::unhealthy(format!("{backend} unreachable: {e}")),
        Ok(Ok(())) => {}
    }

    match failures.summary() {
        Some(summary) => HealthStatus::unhealthy(format!("delivery stopped for {summary}")),
        None => HealthStatus::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_healthy() {
        let failures = TaskFailures::default();
        let status = probe("redis", Duration::from_secs(1), async { Ok(()) }, &failures).await;
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_times_out() {
        let failures = TaskFailures::default();
        let status = probe(
            "nats",
            Duration::from_millis(50),
            futures::future::pending::<Result<(), TransportError>>(),
            &failures,
        )
        .await;
        assert!(matches!(status, HealthStatus::Unhealthy { ref reason } if reason.contains("did not respond")));
    }

    #[tokio::test]
    async fn test_probe_reports_transport_error() {
        let failures = TaskFailures::default();
        let status = probe(
            "redis",
            Duration::from_secs(1),
            async { Err(TransportError::Transient("connection refused".to_string())) },
            &failures,
        )
        .await;
        assert!(!status.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_reports_dead_tasks_until_cleared() {
        let failures = TaskFailures::default();
        failures.record("orders", "NOPERM");

        let status = probe("redis", Duration::from_secs(1), async { Ok(()) }, &failures).await;
        assert_eq!(
            status,
            HealthStatus::unhealthy("delivery stopped for orders: NOPERM")
        );

        failures.clear("orders");
        let status = probe("redis", Duration::from_secs(1), async { Ok(()) }, &failures).await;
        assert!(status.is_healthy());
    }

    #[test]
    fn test_status_serializes_with_tag() {
        let json = serde_json::to_value(HealthStatus::unhealthy("down")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "unhealthy", "reason": "down"}));
        let json = serde_json::to_value(HealthStatus::Healthy).unwrap();
        assert_eq!(json, serde_json::json!({"status": "healthy"}));
    }
}
