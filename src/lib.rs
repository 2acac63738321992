#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # clusterlimit
//!
//! One rate limit shared by many proxy instances, decided atomically inside a
//! single Redis-compatible store.
//!
//! ## Features
//!
//! - **RESP2 codec** with bounded aggregate decoding and no client library
//! - **Connection pool** of authenticated, database-selected streams
//! - **Script executor** running cached Lua by digest, reloading on `NOSCRIPT`
//! - **Circuit breaker** that fails fast while the store is degraded
//! - **GCRA limiter** with all-or-nothing and at-most-N admission
//! - **Tower layer** applying the limiter with a fail-open policy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clusterlimit::{Limit, Limiter, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), clusterlimit::Error> {
//!     let config = StoreConfig::new("127.0.0.1:6379").with_pool_capacity(8);
//!     let limiter = Limiter::connect(config, "api").await?;
//!
//!     let decision = limiter.allow("203.0.113.7", Limit::per_second(10)).await?;
//!     if decision.is_denied() {
//!         println!("slow down, retry in {:?}", decision.retry_after());
//!     }
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod pool;
pub mod prelude;
pub mod script;

// Re-exports
pub use breaker::{BreakerConfig, CircuitState, ScriptBreaker};
pub use client::{Client, Script, StoreClient};
pub use clock::{Clock, MonotonicClock};
pub use codec::Reply;
pub use config::{ConfigError, StoreConfig};
pub use connection::Connection;
pub use error::{Error, Result};
pub use limiter::{Limit, LimitResult, Limiter};
pub use middleware::{LayerError, RateLimitLayer, RateLimitService, SourceExtractor};
pub use pool::{Pool, PooledConnection};
pub use script::StoredScript;
