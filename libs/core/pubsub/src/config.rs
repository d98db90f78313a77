//! Driver configuration.
//!
//! Each driver has a plain config struct with `with_*` builders; the
//! [`MessagingConfig`] enum picks the backend and can be loaded from the
//! environment:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `MESSAGING_BACKEND` | `redis` (`consumer_group`, `nats`, `broadcast`) |
//! | `REDIS_URL` | `redis://127.0.0.1:6379` |
//! | `REDIS_USERNAME` / `REDIS_PASSWORD` | unset |
//! | `MESSAGING_CONSUMER_GROUP` | `pubsub` |
//! | `MESSAGING_CONSUMER_ID` | `<group>-<uuid>` |
//! | `MESSAGING_BATCH_SIZE` | `10` |
//! | `MESSAGING_BLOCK_MS` | unset (poll); `0` is rejected |
//! | `MESSAGING_POLL_MS` | `100` |
//! | `MESSAGING_CLAIM_IDLE_MS` | `60000` |
//! | `MESSAGING_MAX_LENGTH` | `100000` |
//! | `NATS_URL` | `nats://127.0.0.1:4222` |
//! | `NATS_USER` / `NATS_PASSWORD` / `NATS_TOKEN` | unset |
//! | `MESSAGING_MAX_IN_FLIGHT` | `0` (unbounded) |

use crate::error::ConnectionError;
use core_config::{env_millis_or, env_optional, env_or_default, env_parse_or, ConfigError, FromEnv};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tracing::Span;

/// Which driver backs a [`crate::Messaging`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(ascii_case_insensitive)]
pub enum Backend {
    /// At-least-once delivery through Redis Streams consumer groups.
    #[strum(to_string = "consumer_group", serialize = "redis")]
    ConsumerGroup,

    /// Fire-and-forget delivery through NATS core subjects.
    #[strum(to_string = "broadcast", serialize = "nats")]
    Broadcast,
}

/// Backoff strategy for read retries.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),

    /// Exponential backoff (base * 2^retry_count, capped at max)
    Exponential { base: Duration, max: Duration },

    /// Linear backoff (base * (retry_count + 1), capped at max)
    Linear { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry count.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => {
                let delay = base.saturating_mul(2u32.saturating_pow(retry_count));
                delay.min(*max)
            }
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(retry_count.saturating_add(1));
                delay.min(*max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

/// Settings for the consumer-group driver.
#[derive(Debug, Clone)]
pub struct ConsumerGroupConfig {
    /// Redis URL (`redis://host:port/db`).
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Consumer group shared by every instance of the service.
    pub group: String,
    /// Identity of this instance inside the group. Reusing it after a
    /// restart lets the instance pick up its own unacknowledged entries.
    pub consumer_id: String,

    /// Entries fetched per read.
    pub batch_size: usize,
    /// `XREADGROUP BLOCK` duration, capped at `claim_interval`. `None` polls
    /// instead of blocking.
    pub block_timeout: Option<Duration>,
    /// Sleep between empty polls when not blocking.
    pub poll_interval: Duration,

    /// Entries idle this long on another consumer are claimed.
    pub claim_idle: Duration,
    /// How often the idle-entry sweep runs.
    pub claim_interval: Duration,

    /// Approximate stream cap applied on publish.
    pub max_length: usize,
    pub publish_timeout: Duration,
    pub read_backoff: BackoffStrategy,
    /// Upper bound for waiting on delivery tasks during close.
    pub drain_timeout: Duration,

    pub span: Option<Span>,
}

impl ConsumerGroupConfig {
    pub fn new(url: impl Into<String>, group: impl Into<String>) -> Self {
        let group = group.into();
        Self {
            url: url.into(),
            username: None,
            password: None,
            consumer_id: default_consumer_id(&group),
            group,
            batch_size: 10,
            block_timeout: None,
            poll_interval: Duration::from_millis(100),
            claim_idle: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            max_length: 100_000,
            publish_timeout: Duration::from_secs(5),
            read_backoff: BackoffStrategy::default(),
            drain_timeout: Duration::from_secs(10),
            span: None,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: impl Into<String>) -> Self {
        self.username = username;
        self.password = Some(password.into());
        self
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Block on reads for up to `block`. Zero keeps polling, since
    /// `BLOCK 0` would wait forever.
    pub fn with_block_timeout(mut self, block: Duration) -> Self {
        self.block_timeout = (!block.is_zero()).then_some(block);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_read_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.read_backoff = backoff;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Parent span for every log line the driver emits.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// The URL with credentials spliced in, percent-encoded.
    pub fn connection_url(&self) -> Result<String, ConnectionError> {
        let Some(password) = &self.password else {
            return Ok(self.url.clone());
        };
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return Err(ConnectionError::Config(format!(
                "redis url {:?} has no scheme",
                self.url
            )));
        };
        // Any credentials already in the URL are replaced.
        let host = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
        let user = self
            .username
            .as_deref()
            .map(|u| urlencoding::encode(u).into_owned())
            .unwrap_or_default();
        Ok(format!(
            "{scheme}://{user}:{}@{host}",
            urlencoding::encode(password)
        ))
    }
}

impl FromEnv for ConsumerGroupConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_or_default("REDIS_URL", "redis://127.0.0.1:6379");
        let group = env_or_default("MESSAGING_CONSUMER_GROUP", "pubsub");
        let mut config = Self::new(url, group);

        config.username = env_optional("REDIS_USERNAME");
        config.password = env_optional("REDIS_PASSWORD");
        if let Some(consumer_id) = env_optional("MESSAGING_CONSUMER_ID") {
            config.consumer_id = consumer_id;
        }
        config.batch_size = env_parse_or("MESSAGING_BATCH_SIZE", config.batch_size)?.max(1);
        config.block_timeout = match env_optional("MESSAGING_BLOCK_MS") {
            Some(_) => match env_millis_or("MESSAGING_BLOCK_MS", Duration::ZERO)? {
                block if block.is_zero() => {
                    return Err(ConfigError::Invalid(
                        "MESSAGING_BLOCK_MS must be greater than 0; unset it to poll".to_string(),
                    ))
                }
                block => Some(block),
            },
            None => None,
        };
        config.poll_interval = env_millis_or("MESSAGING_POLL_MS", config.poll_interval)?;
        config.claim_idle = env_millis_or("MESSAGING_CLAIM_IDLE_MS", config.claim_idle)?;
        config.max_length = env_parse_or("MESSAGING_MAX_LENGTH", config.max_length)?;

        Ok(config)
    }
}

/// Settings for the broadcast driver.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// NATS server URL(s), comma separated.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    /// Client name shown by the server's monitoring endpoints.
    pub connection_name: String,
    /// Handler invocations allowed at once per topic. `0` is unbounded.
    pub max_in_flight: usize,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub drain_timeout: Duration,
    pub span: Option<Span>,
}

impl BroadcastConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
            token: None,
            connection_name: "pubsub".to_string(),
            max_in_flight: 0,
            connect_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            span: None,
        }
    }

    pub fn with_user_password(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

impl FromEnv for BroadcastConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(env_or_default("NATS_URL", "nats://127.0.0.1:4222"));
        config.user = env_optional("NATS_USER");
        config.password = env_optional("NATS_PASSWORD");
        config.token = env_optional("NATS_TOKEN");
        if config.user.is_some() != config.password.is_some() {
            return Err(ConfigError::Invalid(
                "NATS_USER and NATS_PASSWORD must be set together".to_string(),
            ));
        }
        config.max_in_flight = env_parse_or("MESSAGING_MAX_IN_FLIGHT", 0usize)?;
        if let Some(name) = env_optional("MESSAGING_CONNECTION_NAME") {
            config.connection_name = name;
        }
        Ok(config)
    }
}

/// Backend selection plus that backend's settings.
#[derive(Debug, Clone)]
pub enum MessagingConfig {
    ConsumerGroup(ConsumerGroupConfig),
    Broadcast(BroadcastConfig),
}

impl MessagingConfig {
    pub fn backend(&self) -> Backend {
        match self {
            MessagingConfig::ConsumerGroup(_) => Backend::ConsumerGroup,
            MessagingConfig::Broadcast(_) => Backend::Broadcast,
        }
    }
}

impl From<ConsumerGroupConfig> for MessagingConfig {
    fn from(config: ConsumerGroupConfig) -> Self {
        MessagingConfig::ConsumerGroup(config)
    }
}

impl From<BroadcastConfig> for MessagingConfig {
    fn from(config: BroadcastConfig) -> Self {
        MessagingConfig::Broadcast(config)
    }
}

impl FromEnv for MessagingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let backend: Backend = env_parse_or("MESSAGING_BACKEND", Backend::ConsumerGroup)?;
        Ok(match backend {
            Backend::ConsumerGroup => ConsumerGroupConfig::from_env()?.into(),
            Backend::Broadcast => BroadcastConfig::from_env()?.into(),
        })
    }
}

fn default_consumer_id(group: &str) -> String {
    format!("{}-{}", group, uuid::Uuid::new_v4().simple())
}
