//! Error types for the store client, script executor, breaker and limiter.
use std::io;
use std::time::Duration;

use crate::config::ConfigError;

/// Unified error type for every operation that talks to the backing store.
///
/// A rate-limit *denial* is never an error: it is a successful
/// [`LimitResult`](crate::LimitResult) whose `allowed` count is zero.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dialing, reading from or writing to the store failed.
    #[error("store i/o error: {0}")]
    Io(#[from] io::Error),
    /// A round trip did not complete within the configured deadline.
    #[error("store did not answer within {timeout:?}")]
    Timeout { timeout: Duration },
    /// The peer sent something that is not a well-formed reply.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// AUTH was rejected while initialising a connection.
    #[error("not able to authenticate ({0})")]
    Auth(String),
    /// SELECT was rejected while initialising a connection.
    #[error("not able to select db {db} ({reason})")]
    Select { db: u32, reason: String },
    /// SCRIPT LOAD did not return a well-formed digest.
    #[error("not able to load script: {0}")]
    ScriptLoad(String),
    /// The store answered a script execution with an error reply.
    #[error("not able to run the script: {0}")]
    Script(String),
    /// A plain command (PING, DEL) came back with an error reply.
    #[error("{command} result error: {reason}")]
    CommandFailed { command: &'static str, reason: String },
    /// The script breaker is open; no network attempt was made.
    #[error("breaker opened ({failures} consecutive failures, retry in {retry_in:?})")]
    BreakerOpen { failures: usize, retry_in: Duration },
    /// The limit cannot be evaluated (zero rate or zero period).
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// The pool was closed and no longer hands out connections.
    #[error("connection pool is closed")]
    PoolClosed,
    /// Construction parameters failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a breaker short-circuit.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    /// Check if this error is due to a missed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Connection faults leave the stream in an unknown state; the connection
    /// that produced one must be destroyed, never pooled.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout { .. } | Self::Protocol(_))
    }

    /// Remaining cooldown if this is a breaker short-circuit.
    pub fn breaker_retry_in(&self) -> Option<Duration> {
        match self {
            Self::BreakerOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
