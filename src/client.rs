//! The narrow store interface the limiter depends on, and its pooled implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::Reply;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::script::StoredScript;

/// A server-side script that can be executed with keys and arguments.
///
/// A successful run returns the store's reply: an [`Reply::Array`] for
/// multi-value results, or the scalar reply as-is. Never a [`Reply::Error`].
#[async_trait]
pub trait Script: Send + Sync {
    async fn run(&self, keys: &[String], args: &[String]) -> Result<Reply>;
}

/// The handful of store operations the limiter needs.
///
/// Kept deliberately small so tests can substitute the store without a network.
#[async_trait]
pub trait Client: Send + Sync {
    /// Drain and close every idle connection.
    fn close(&self);

    /// Round-trip a PING; succeeds only on a `PONG` status.
    async fn ping(&self) -> Result<()>;

    /// Delete `key` and everything stored under it.
    async fn del(&self, key: &str) -> Result<()>;

    /// Wrap `source` as an executable script sharing this client's connections.
    fn new_script(&self, source: &str) -> Arc<dyn Script>;
}

/// [`Client`] backed by a [`Pool`] of connections to one store.
#[derive(Debug, Clone)]
pub struct StoreClient {
    pool: Arc<Pool>,
}

impl StoreClient {
    /// Validate `config` and build the connection pool.
    ///
    /// Succeeds even if no connection could be pre-opened; call
    /// [`Client::ping`] afterwards to fail fast on an unreachable store.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { pool: Arc::new(Pool::new(config).await) })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl Client for StoreClient {
    fn close(&self) {
        self.pool.close();
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.checkout().await?;
        match conn.exec(&["PING"]).await? {
            Reply::Status(ref pong) if pong == "PONG" => Ok(()),
            Reply::Error(reason) => Err(Error::CommandFailed { command: "PING", reason }),
            other => Err(Error::protocol(format!("unexpected {} reply to PING", other.kind_name()))),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.checkout().await?;
        match conn.exec(&["DEL", key]).await? {
            Reply::Integer(_) => Ok(()),
            Reply::Error(reason) => Err(Error::CommandFailed { command: "DEL", reason }),
            other => Err(Error::protocol(format!("unexpected {} reply to DEL", other.kind_name()))),
        }
    }

    fn new_script(&self, source: &str) -> Arc<dyn Script> {
        Arc::new(StoredScript::new(self.pool.clone(), source))
    }
}
