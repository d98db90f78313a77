//! Shared test utilities for the messaging crates
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestNats`: NATS container with automatic cleanup (feature: "nats")
//! - `TestNames`: deterministic topic and group names (always available)
//! - `eventually`: polling assertion helper (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//! - `nats`: Enables NATS test infrastructure
//! - `all`: Enables both
//!
//! # Usage
//!
//! Add the feature to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Container tests need Docker, so mark them `#[ignore]` and run them with
//! `cargo test -- --ignored`:
//!
//! ```rust,ignore
//! use test_utils::{TestNames, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let names = TestNames::from_test_name("my_redis_test");
//!     let topic = names.topic("orders");
//!     // connect a driver to redis.connection_string()
//! }
//! ```

use std::time::Duration;
use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Topic and group names scoped to one test
///
/// Tests sharing a container must not see each other's streams, so every
/// name carries a seed derived from the test name.
pub struct TestNames {
    seed: u64,
}

impl TestNames {
    /// Create with an explicit seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestNames;
    ///
    /// let names = TestNames::from_test_name("test_redelivery");
    /// assert_eq!(names.topic("orders"), names.topic("orders"));
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// A topic name, e.g. `test-12345-orders`
    pub fn topic(&self, name: &str) -> String {
        format!("test-{}-{}", self.seed, name)
    }

    /// A consumer group name, e.g. `group-12345-billing`
    pub fn group(&self, name: &str) -> String {
        format!("group-{}-{}", self.seed, name)
    }

    /// A consumer id that differs on every call
    pub fn consumer(&self) -> String {
        format!("consumer-{}-{}", self.seed, Uuid::new_v4().simple())
    }
}

/// Poll `check` every 10ms until it returns true or `timeout` elapses.
///
/// Returns whether the condition was met. Delivery is asynchronous, so
/// tests wait for the effect instead of sleeping a fixed time.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_names_deterministic() {
        let a = TestNames::new(42);
        let b = TestNames::new(42);

        assert_eq!(a.topic("orders"), b.topic("orders"));
        assert_eq!(a.group("billing"), b.group("billing"));
        assert_eq!(a.topic("orders"), "test-42-orders");
    }

    #[test]
    fn test_names_differ_between_tests() {
        let a = TestNames::from_test_name("test1");
        let b = TestNames::from_test_name("test2");

        assert_ne!(a.topic("orders"), b.topic("orders"));
    }

    #[test]
    fn test_consumer_ids_are_unique() {
        let names = TestNames::new(7);
        assert_ne!(names.consumer(), names.consumer());
    }

    #[tokio::test]
    async fn test_eventually_sees_condition() {
        let calls = AtomicUsize::new(0);
        let met = eventually(Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert!(met);
    }

    #[tokio::test]
    async fn test_eventually_times_out() {
        assert!(!eventually(Duration::from_millis(30), || false).await);
    }
}
