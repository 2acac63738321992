//! Construction parameters for the store client and limiter.

use std::fmt;
use std::time::Duration;

/// Default store address when none is configured.
pub const DEFAULT_ADDRESS: &str = "redis:6379";
/// Default number of warm connections kept by the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 5;
/// Default deadline for one command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
/// Default consecutive failures before the script breaker opens.
pub const DEFAULT_BREAKER_THRESHOLD: usize = 3;
/// Default time the breaker stays open before probing.
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(15);
/// Default namespace prepended to every rate-limit key.
pub const DEFAULT_KEY_PREFIX: &str = "rate_";

/// Errors produced when validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The store address is empty.
    #[error("store address must not be empty")]
    EmptyAddress,
    /// Pool capacity must be > 0.
    #[error("pool capacity must be > 0 (got {provided})")]
    InvalidPoolCapacity { provided: usize },
    /// Command timeout must be > 0.
    #[error("command timeout must be > 0 (got {0:?})")]
    InvalidCommandTimeout(Duration),
    /// Breaker threshold must be > 0.
    #[error("breaker threshold must be > 0 (got {provided})")]
    InvalidBreakerThreshold { provided: usize },
    /// Breaker cooldown must be > 0.
    #[error("breaker cooldown must be > 0 (got {0:?})")]
    InvalidBreakerCooldown(Duration),
}

/// Everything needed to reach the shared store and guard calls to it.
///
/// ```
/// use clusterlimit::StoreConfig;
/// use std::time::Duration;
///
/// let config = StoreConfig::new("127.0.0.1:6379")
///     .with_db(2)
///     .with_password("s3cret")
///     .with_command_timeout(Duration::from_millis(500));
/// assert!(config.validate().is_ok());
/// assert_eq!(config.pool_capacity(), 5);
/// ```
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StoreConfig {
    address: String,
    db: u32,
    password: Option<String>,
    #[cfg_attr(feature = "serde", serde(with = "duration_millis", rename = "command_timeout_ms"))]
    command_timeout: Duration,
    pool_capacity: usize,
    breaker_threshold: usize,
    #[cfg_attr(feature = "serde", serde(with = "duration_millis", rename = "breaker_cooldown_ms"))]
    breaker_cooldown: Duration,
    key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            db: 0,
            password: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            breaker_cooldown: DEFAULT_BREAKER_COOLDOWN,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

// Hand-written so the password never ends up in logs.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("address", &self.address)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("command_timeout", &self.command_timeout)
            .field("pool_capacity", &self.pool_capacity)
            .field("breaker_threshold", &self.breaker_threshold)
            .field("breaker_cooldown", &self.breaker_cooldown)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl StoreConfig {
    /// Defaults pointed at `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), ..Self::default() }
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Set the AUTH credential. An empty string means no AUTH.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = if password.is_empty() { None } else { Some(password) };
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_breaker(mut self, threshold: usize, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_cooldown = cooldown;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Check every parameter, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::InvalidPoolCapacity { provided: 0 });
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::InvalidCommandTimeout(self.command_timeout));
        }
        if self.breaker_threshold == 0 {
            return Err(ConfigError::InvalidBreakerThreshold { provided: 0 });
        }
        if self.breaker_cooldown.is_zero() {
            return Err(ConfigError::InvalidBreakerCooldown(self.breaker_cooldown));
        }
        Ok(())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    /// Deadline for one command round trip.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Deadline for opening a TCP connection: twice the command timeout.
    pub fn dial_timeout(&self) -> Duration {
        self.command_timeout.saturating_mul(2)
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    pub fn breaker_threshold(&self) -> usize {
        self.breaker_threshold
    }

    pub fn breaker_cooldown(&self) -> Duration {
        self.breaker_cooldown
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}

#[cfg(feature = "serde")]
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = StoreConfig::default();
        assert_eq!(config.address(), "redis:6379");
        assert_eq!(config.db(), 0);
        assert_eq!(config.password(), None);
        assert_eq!(config.command_timeout(), Duration::from_secs(3));
        assert_eq!(config.dial_timeout(), Duration::from_secs(6));
        assert_eq!(config.pool_capacity(), 5);
        assert_eq!(config.breaker_threshold(), 3);
        assert_eq!(config.breaker_cooldown(), Duration::from_secs(15));
        assert_eq!(config.key_prefix(), "rate_");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_password_disables_auth() {
        let config = StoreConfig::default().with_password("");
        assert_eq!(config.password(), None);
        let config = config.with_password("pw");
        assert_eq!(config.password(), Some("pw"));
    }

    #[test]
    fn rejects_invalid_values() {
        assert_eq!(StoreConfig::new("  ").validate(), Err(ConfigError::EmptyAddress));
        assert_eq!(
            StoreConfig::default().with_pool_capacity(0).validate(),
            Err(ConfigError::InvalidPoolCapacity { provided: 0 })
        );
        assert_eq!(
            StoreConfig::default().with_command_timeout(Duration::ZERO).validate(),
            Err(ConfigError::InvalidCommandTimeout(Duration::ZERO))
        );
        assert_eq!(
            StoreConfig::default().with_breaker(0, Duration::from_secs(1)).validate(),
            Err(ConfigError::InvalidBreakerThreshold { provided: 0 })
        );
        assert_eq!(
            StoreConfig::default().with_breaker(3, Duration::ZERO).validate(),
            Err(ConfigError::InvalidBreakerCooldown(Duration::ZERO))
        );
    }

    #[test]
    fn debug_output_redacts_password() {
        let config = StoreConfig::default().with_password("hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_with_millisecond_durations() {
        let config: StoreConfig = serde_json::from_str(
            r#"{"address":"10.0.0.1:6379","db":1,"command_timeout_ms":250,"breaker_cooldown_ms":1000}"#,
        )
        .unwrap();
        assert_eq!(config.address(), "10.0.0.1:6379");
        assert_eq!(config.db(), 1);
        assert_eq!(config.command_timeout(), Duration::from_millis(250));
        assert_eq!(config.breaker_cooldown(), Duration::from_secs(1));
        assert_eq!(config.pool_capacity(), DEFAULT_POOL_CAPACITY);
    }
}
