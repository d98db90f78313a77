//! Pub/Sub Worker Service - Entry Point
//!
//! Subscribes to the configured topics and logs every message it receives.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    pubsub_worker::run().await
}
