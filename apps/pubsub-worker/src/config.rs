//! Worker configuration loaded from the environment.

use core_config::server::ServerConfig;
use core_config::{env_list, env_millis_or, ConfigError, FromEnv};
use pubsub::MessagingConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Topics to subscribe to (`MESSAGING_TOPICS`, comma separated).
    pub topics: Vec<String>,
    /// Health and metrics listener.
    pub server: ServerConfig,
    pub messaging: MessagingConfig,
    /// Deadline for one health probe (`HEALTH_TIMEOUT_MS`).
    pub health_timeout: Duration,
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let topics = env_list("MESSAGING_TOPICS");
        if topics.is_empty() {
            return Err(ConfigError::MissingEnvVar("MESSAGING_TOPICS".to_string()));
        }

        Ok(Self {
            topics,
            server: ServerConfig::from_env()?,
            messaging: MessagingConfig::from_env()?,
            health_timeout: env_millis_or("HEALTH_TIMEOUT_MS", Duration::from_secs(5))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubsub::Backend;

    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("MESSAGING_TOPICS", Some("orders, invoices")),
                ("MESSAGING_BACKEND", Some("broadcast")),
                ("NATS_URL", Some("nats://nats:4222")),
                ("PORT", Some("9090")),
                ("HEALTH_TIMEOUT_MS", None),
            ],
            || {
                let config = WorkerConfig::from_env().unwrap();
                assert_eq!(config.topics, vec!["orders", "invoices"]);
                assert_eq!(config.messaging.backend(), Backend::Broadcast);
                assert_eq!(config.server.port, 9090);
                assert_eq!(config.health_timeout, Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn test_topics_required() {
        temp_env::with_var("MESSAGING_TOPICS", None::<&str>, || {
            let err = WorkerConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "MESSAGING_TOPICS"));
        });
    }
}
