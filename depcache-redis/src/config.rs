//! Redis configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::pool::PoolConfig;

/// Options applied while dialing a new connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialOptions {
    /// TCP connect timeout.
    #[serde(with = "seconds_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Connection name (for CLIENT SETNAME).
    #[serde(default)]
    pub client_name: Option<String>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            client_name: None,
        }
    }
}

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Destination URL (`redis://[user[:password]@]host:port[/db]`).
    pub url: String,
    /// Maximum borrowed connections at once; 0 means unbounded.
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Maximum idle connections kept for reuse.
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Connections older than this are closed instead of reused.
    #[serde(with = "option_seconds_serde", default)]
    pub max_conn_lifetime: Option<Duration>,
    /// Idle connections older than this are closed on the next borrow.
    #[serde(with = "option_seconds_serde", default)]
    pub idle_timeout: Option<Duration>,
    /// Block a borrow when the pool is exhausted instead of failing fast.
    #[serde(default = "default_wait")]
    pub wait: bool,
    /// Upper bound on a blocked borrow.
    #[serde(with = "option_seconds_serde", default)]
    pub wait_timeout: Option<Duration>,
    /// Idle time after which a borrowed connection is probed with PING.
    #[serde(with = "seconds_serde", default = "default_health_check_after")]
    pub health_check_after: Duration,
    /// Upper bound on each operation, borrow included.
    #[serde(with = "option_seconds_serde", default)]
    pub command_timeout: Option<Duration>,
    /// Load the dependency and lock scripts when the client is built.
    #[serde(default)]
    pub dependency_mode: bool,
    /// Run the store phase of get-or-set in a background task.
    #[serde(default)]
    pub background_set: bool,
    /// Dial options.
    #[serde(default)]
    pub dial: DialOptions,
}

fn default_max_active() -> usize {
    10
}

fn default_max_idle() -> usize {
    3
}

fn default_wait() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_check_after() -> Duration {
    Duration::from_secs(60)
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_active: default_max_active(),
            max_idle: default_max_idle(),
            max_conn_lifetime: None,
            idle_timeout: Some(Duration::from_secs(240)),
            wait: default_wait(),
            wait_timeout: None,
            health_check_after: default_health_check_after(),
            command_timeout: None,
            dependency_mode: false,
            background_set: false,
            dial: DialOptions::default(),
        }
    }
}

impl RedisConfig {
    /// Create a new configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }

    /// Pool limits described by this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_active: self.max_active,
            max_idle: self.max_idle,
            max_conn_lifetime: self.max_conn_lifetime,
            idle_timeout: self.idle_timeout,
            wait: self.wait,
            wait_timeout: self.wait_timeout,
            health_check_after: self.health_check_after,
        }
    }
}

/// Builder for Redis configuration.
#[derive(Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RedisConfig::default(),
        }
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the maximum number of borrowed connections.
    pub fn max_active(mut self, max_active: usize) -> Self {
        self.config.max_active = max_active;
        self
    }

    /// Set the maximum number of idle connections.
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.config.max_idle = max_idle;
        self
    }

    /// Set the maximum connection lifetime.
    pub fn max_conn_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_conn_lifetime = Some(lifetime);
        self
    }

    /// Set the idle eviction timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Choose between blocking and failing fast when the pool is exhausted.
    pub fn wait(mut self, wait: bool) -> Self {
        self.config.wait = wait;
        self
    }

    /// Bound blocked borrows.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = Some(timeout);
        self
    }

    /// Set the idle time after which borrowed connections are probed.
    pub fn health_check_after(mut self, after: Duration) -> Self {
        self.config.health_check_after = after;
        self
    }

    /// Bound every operation.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = Some(timeout);
        self
    }

    /// Enable dependency mode.
    pub fn dependency_mode(mut self, enabled: bool) -> Self {
        self.config.dependency_mode = enabled;
        self
    }

    /// Run the store phase of get-or-set in the background.
    pub fn background_set(mut self, enabled: bool) -> Self {
        self.config.background_set = enabled;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial.connect_timeout = timeout;
        self
    }

    /// Set the connection name.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.dial.client_name = Some(name.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}

mod seconds_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod option_seconds_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
