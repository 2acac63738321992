//! GCRA admission control evaluated atomically inside the store.
//!
//! Every decision runs one of two Lua scripts against the namespaced key, so
//! concurrent limiters sharing a store serialize through the store itself and
//! never need client-side locking.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{BreakerConfig, ScriptBreaker};
use crate::client::{Client, Script, StoreClient};
use crate::clock::Clock;
use crate::codec::Reply;
use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// Admits exactly `n` permits or none.
pub const ALLOW_N_SCRIPT: &str = include_str!("../scripts/allow_n.lua");

/// Admits as many of `n` permits as currently fit.
pub const ALLOW_AT_MOST_SCRIPT: &str = include_str!("../scripts/allow_at_most.lua");

// Marks retry/reset values that do not apply to a decision.
const NOT_APPLICABLE: f64 = -1.0;

/// `rate` permits per `period`, with up to `burst` admitted at once.
///
/// Rates below one event per second are expressed with a longer period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limit {
    pub rate: u64,
    pub burst: u64,
    pub period: Duration,
}

impl Limit {
    pub const fn new(rate: u64, burst: u64, period: Duration) -> Self {
        Self { rate, burst, period }
    }

    pub const fn per_second(rate: u64) -> Self {
        Self::new(rate, rate, Duration::from_secs(1))
    }

    pub const fn per_minute(rate: u64) -> Self {
        Self::new(rate, rate, Duration::from_secs(60))
    }

    pub const fn per_hour(rate: u64) -> Self {
        Self::new(rate, rate, Duration::from_secs(3600))
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(Error::InvalidLimit(format!("{self}: rate must be positive")));
        }
        if self.period.is_zero() {
            return Err(Error::InvalidLimit(format!("{self}: period must be positive")));
        }
        Ok(())
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} req/", self.rate)?;
        match self.period.as_secs() {
            _ if self.period.subsec_nanos() != 0 => write!(f, "{:?}", self.period)?,
            1 => f.write_str("s")?,
            60 => f.write_str("m")?,
            3600 => f.write_str("h")?,
            _ => write!(f, "{:?}", self.period)?,
        }
        write!(f, " (burst {})", self.burst)
    }
}

/// Outcome of one admission decision.
///
/// A denial is a valid result with `allowed() == 0`, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitResult {
    limit: Limit,
    allowed: i64,
    remaining: i64,
    retry_after: Option<Duration>,
    reset_after: Option<Duration>,
}

impl LimitResult {
    /// The limit this decision was evaluated against.
    pub fn limit(&self) -> Limit {
        self.limit
    }

    /// Permits admitted by this call.
    pub fn allowed(&self) -> i64 {
        self.allowed
    }

    /// Permits still available right after this call.
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// How long until the request could be admitted. `None` when it was.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// How long until the key is back at full allowance.
    pub fn reset_after(&self) -> Option<Duration> {
        self.reset_after
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed > 0
    }

    pub fn is_denied(&self) -> bool {
        !self.is_allowed()
    }

    fn from_reply(limit: Limit, reply: Reply) -> Result<Self> {
        let values = match reply {
            Reply::Array(values) if values.len() == 4 => values,
            Reply::Array(values) => {
                return Err(Error::protocol(format!(
                    "admission reply has {} elements, expected 4",
                    values.len()
                )))
            }
            other => {
                return Err(Error::protocol(format!(
                    "admission reply is {}, expected array",
                    other.kind_name()
                )))
            }
        };

        let count = |index: usize, field: &str| {
            values[index]
                .as_i64()
                .ok_or_else(|| Error::protocol(format!("admission {field} is not an integer")))
        };
        let seconds = |index: usize, field: &str| -> Result<Option<Duration>> {
            let secs = values[index]
                .as_f64()
                .ok_or_else(|| Error::protocol(format!("admission {field} is not a number")))?;
            if secs == NOT_APPLICABLE {
                return Ok(None);
            }
            Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|_| Error::protocol(format!("admission {field} out of range: {secs}")))
        };

        Ok(Self {
            limit,
            allowed: count(0, "allowed")?,
            remaining: count(1, "remaining")?,
            retry_after: seconds(2, "retry_after")?,
            reset_after: seconds(3, "reset_after")?,
        })
    }
}

/// Shared-store rate limiter.
///
/// Holds only its key prefix and two breaker-guarded script handles; every
/// counter lives in the store.
#[derive(Clone)]
pub struct Limiter {
    client: Arc<dyn Client>,
    allow_n: ScriptBreaker,
    allow_at_most: ScriptBreaker,
    prefix: String,
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("prefix", &self.prefix)
            .field("allow_n", &self.allow_n)
            .field("allow_at_most", &self.allow_at_most)
            .finish_non_exhaustive()
    }
}

impl Limiter {
    /// Build a limiter over an existing client; keys are stored as `prefix + key`.
    pub fn new(client: Arc<dyn Client>, prefix: impl Into<String>, breaker: BreakerConfig) -> Self {
        let allow_n = ScriptBreaker::new(client.new_script(ALLOW_N_SCRIPT), breaker);
        let allow_at_most = ScriptBreaker::new(client.new_script(ALLOW_AT_MOST_SCRIPT), breaker);
        Self { client, allow_n, allow_at_most, prefix: prefix.into() }
    }

    /// Validate `config`, open the pooled client and namespace keys under
    /// the configured prefix followed by `name`.
    pub async fn connect(config: StoreConfig, name: &str) -> Result<Self> {
        config.validate()?;
        let breaker = BreakerConfig::from_store_config(&config)?;
        let prefix = format!("{}{}", config.key_prefix(), name);
        let client = StoreClient::connect(config).await?;
        Ok(Self::new(Arc::new(client), prefix, breaker))
    }

    /// Replace the breakers' clock on both scripts.
    pub fn with_clock<C: Clock + Clone + 'static>(mut self, clock: C) -> Self {
        self.allow_n = self.allow_n.with_clock(clock.clone());
        self.allow_at_most = self.allow_at_most.with_clock(clock);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Shorthand for `allow_n(key, limit, 1)`.
    pub async fn allow(&self, key: &str, limit: Limit) -> Result<LimitResult> {
        self.allow_n(key, limit, 1).await
    }

    /// Admit `n` events for `key`, all or nothing.
    ///
    /// With `n == 0` nothing is consumed and the result reports the current
    /// allowance.
    pub async fn allow_n(&self, key: &str, limit: Limit, n: u64) -> Result<LimitResult> {
        self.decide(&self.allow_n, key, limit, n).await
    }

    /// Admit as many of `n` events as currently fit, between 0 and `n`.
    pub async fn allow_at_most(&self, key: &str, limit: Limit, n: u64) -> Result<LimitResult> {
        self.decide(&self.allow_at_most, key, limit, n).await
    }

    /// Forget all state for `key`, restoring its full allowance.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.client.del(&self.namespaced(key)).await
    }

    /// Close the underlying client. Only call once in-flight calls have drained.
    pub fn close(&self) {
        self.client.close();
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn decide(&self, script: &ScriptBreaker, key: &str, limit: Limit, n: u64) -> Result<LimitResult> {
        limit.validate()?;
        let keys = [self.namespaced(key)];
        let args = [
            limit.burst.to_string(),
            limit.rate.to_string(),
            limit.period.as_secs_f64().to_string(),
            n.to_string(),
        ];
        let reply = script.run(&keys, &args).await?;
        let result = LimitResult::from_reply(limit, reply)?;
        tracing::debug!(
            key = keys[0].as_str(),
            requested = n,
            allowed = result.allowed,
            remaining = result.remaining,
            "rate limit decision"
        );
        Ok(result)
    }
}
