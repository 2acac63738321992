//! Convenient re-exports for common clusterlimit types.
pub use crate::{
    breaker::{BreakerConfig, CircuitState, ScriptBreaker},
    client::{Client, Script, StoreClient},
    config::{ConfigError, StoreConfig},
    error::{Error, Result},
    limiter::{Limit, LimitResult, Limiter},
    middleware::{LayerError, RateLimitLayer, SourceExtractor},
};
