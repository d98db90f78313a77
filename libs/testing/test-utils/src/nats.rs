//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that starts a NATS container for broadcast tests.

use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
/// let url = nats.connection_string();
/// // Build a BroadcastConfig from `url`
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Create a new test NATS instance
    pub async fn new() -> Self {
        let container = Nats::default()
            .with_tag("latest")
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Raw client for publishing or observing behind the driver's back
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get the connection string for driver configuration
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

// Container is automatically cleaned up when TestNats is dropped
impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_nats_connection() {
        let nats = TestNats::new().await;
        let client = nats.client();

        let mut subscriber = client.subscribe("test.subject").await.unwrap();

        client
            .publish("test.subject", "hello".into())
            .await
            .unwrap();
        client.flush().await.unwrap();

        let message = tokio::time::timeout(tokio::time::Duration::from_secs(5), subscriber.next())
            .await
            .expect("Timeout waiting for message")
            .expect("No message received");

        assert_eq!(message.payload.as_ref(), b"hello");
    }
}
