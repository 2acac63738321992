//! Circuit breaker wrapping a [`Script`].
//!
//! Tuned to a single failure model: a script run that returns an error. After
//! `threshold` consecutive failures every run is rejected with
//! [`Error::BreakerOpen`] until `cooldown` has elapsed; then exactly one probe
//! run goes through. A successful probe closes the breaker, a failed one
//! re-arms the cooldown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::Script;
use crate::clock::{Clock, MonotonicClock};
use crate::codec::Reply;
use crate::config::{ConfigError, StoreConfig};
use crate::error::{Error, Result};

/// Current state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Failures below threshold; every run is attempted.
    Closed,
    /// Threshold reached and cooldown not elapsed; runs are rejected.
    Open,
    /// Cooldown elapsed; the next run is the probe.
    Probe,
}

/// Validated breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    threshold: usize,
    cooldown: Duration,
}

impl BreakerConfig {
    pub fn new(threshold: usize, cooldown: Duration) -> std::result::Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::InvalidBreakerThreshold { provided: threshold });
        }
        if cooldown.is_zero() {
            return Err(ConfigError::InvalidBreakerCooldown(cooldown));
        }
        Ok(Self { threshold, cooldown })
    }

    /// Breaker settings taken from a store config.
    pub fn from_store_config(config: &StoreConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(config.breaker_threshold(), config.breaker_cooldown())
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: crate::config::DEFAULT_BREAKER_THRESHOLD,
            cooldown: crate::config::DEFAULT_BREAKER_COOLDOWN,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: usize,
    retry_at_millis: u64,
    probing: bool,
}

/// A [`Script`] guarded by a consecutive-failure breaker.
///
/// Clones share state, so every handle observes the same failure count.
#[derive(Clone)]
pub struct ScriptBreaker {
    script: Arc<dyn Script>,
    state: Arc<Mutex<BreakerState>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ScriptBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptBreaker")
            .field("state", &*self.lock())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Gate {
    Pass,
    Probe,
    Reject { failures: usize, retry_in: Duration },
}

// Clears the probe flag even if the probing future is dropped or panics.
struct ProbeGuard<'a>(&'a ScriptBreaker);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().probing = false;
    }
}

impl ScriptBreaker {
    pub fn new(script: Arc<dyn Script>, config: BreakerConfig) -> Self {
        Self {
            script,
            state: Arc::new(Mutex::new(BreakerState::default())),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Consecutive failures recorded so far.
    pub fn failure_count(&self) -> usize {
        self.lock().failures
    }

    pub fn state(&self) -> CircuitState {
        let state = self.lock();
        if state.failures < self.config.threshold {
            CircuitState::Closed
        } else if self.clock.until(state.retry_at_millis).is_some() {
            CircuitState::Open
        } else {
            CircuitState::Probe
        }
    }

    fn gate(&self) -> Gate {
        let mut state = self.lock();
        if state.failures < self.config.threshold {
            return Gate::Pass;
        }
        if let Some(retry_in) = self.clock.until(state.retry_at_millis) {
            return Gate::Reject { failures: state.failures, retry_in };
        }
        // Another caller's probe is in flight; if it fails the breaker stays
        // open for a full cooldown, so that is the longest wait to report.
        if state.probing {
            return Gate::Reject { failures: state.failures, retry_in: self.config.cooldown };
        }
        state.probing = true;
        Gate::Probe
    }

    fn on_success(&self) {
        let mut state = self.lock();
        if state.failures >= self.config.threshold {
            tracing::info!("script breaker → closed");
        }
        state.failures = 0;
    }

    fn on_failure(&self, probe: bool) {
        let mut state = self.lock();
        state.failures = state.failures.saturating_add(1);
        let opens = state.failures == self.config.threshold;
        if opens || probe {
            state.retry_at_millis = self.cooldown_deadline();
        }
        if opens {
            tracing::error!(
                failures = state.failures,
                threshold = self.config.threshold,
                cooldown = ?self.config.cooldown,
                "script breaker → open"
            );
        } else if probe {
            tracing::warn!(failures = state.failures, "script breaker probe failed → open");
        }
    }

    fn cooldown_deadline(&self) -> u64 {
        let cooldown = u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(cooldown)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Script for ScriptBreaker {
    async fn run(&self, keys: &[String], args: &[String]) -> Result<Reply> {
        let probe = match self.gate() {
            Gate::Pass => None,
            Gate::Probe => {
                tracing::info!("script breaker → probe");
                Some(ProbeGuard(self))
            }
            Gate::Reject { failures, retry_in } => {
                return Err(Error::BreakerOpen { failures, retry_in });
            }
        };

        let result = self.script.run(keys, args).await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(probe.is_some()),
        }
        drop(probe);
        result
    }
}
