//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that starts a Redis container with Streams
//! support for consumer-group tests.

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let url = redis.connection_string();
/// // Build a ConsumerGroupConfig from `url`
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Create a new test Redis instance
    ///
    /// Uses Redis 8 Alpine image by default.
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client = Client::open(connection_string.clone()).expect("Failed to create Redis client");
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Raw connection for inspecting streams behind the driver's back
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Get the connection string for driver configuration
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Number of entries in the stream for `topic`
    pub async fn stream_len(&self, topic: &str) -> usize {
        redis::cmd("XLEN")
            .arg(topic)
            .query_async(&mut self.connection())
            .await
            .expect("XLEN failed")
    }

    /// Number of entries delivered to `group` on `topic` but not acknowledged
    pub async fn pending_count(&self, topic: &str, group: &str) -> usize {
        let (count, _, _, _): (usize, Option<String>, Option<String>, redis::Value) =
            redis::cmd("XPENDING")
                .arg(topic)
                .arg(group)
                .query_async(&mut self.connection())
                .await
                .expect("XPENDING failed");
        count
    }
}

// Container is automatically cleaned up when TestRedis is dropped
impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_stream_append_and_length() {
        let redis = TestRedis::new().await;

        let _: String = redis::cmd("XADD")
            .arg("orders")
            .arg("*")
            .arg("payload")
            .arg("hello")
            .query_async(&mut redis.connection())
            .await
            .unwrap();

        assert_eq!(redis.stream_len("orders").await, 1);
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_pending_count_for_fresh_group() {
        let redis = TestRedis::new().await;

        let _: () = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg("orders")
            .arg("billing")
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut redis.connection())
            .await
            .unwrap();

        assert_eq!(redis.pending_count("orders", "billing").await, 0);
    }
}
