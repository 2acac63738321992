//! Bounded pool of idle store connections.
//!
//! `get` never blocks on the pool: it pops an idle connection or dials a new
//! one. `put` re-buffers a connection only while fewer than `capacity` are
//! idle and closes it otherwise. The mutex guards the capacity check and the
//! enqueue only; it is never held across network I/O.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::join_all;

use crate::codec::Reply;
use crate::config::StoreConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Pool {
    config: StoreConfig,
    // `None` once the pool has been closed.
    idle: Mutex<Option<VecDeque<Connection>>>,
}

impl Pool {
    /// Build a pool and eagerly open `capacity` connections.
    ///
    /// A slot whose dial, AUTH or SELECT fails is left empty; the pool is still
    /// usable and later `get` calls dial on demand.
    pub async fn new(config: StoreConfig) -> Self {
        let capacity = config.pool_capacity();
        let attempts = join_all((0..capacity).map(|_| Connection::open(&config))).await;

        let mut idle = VecDeque::with_capacity(capacity);
        for (slot, attempt) in attempts.into_iter().enumerate() {
            match attempt {
                Ok(conn) => idle.push_back(conn),
                Err(err) => {
                    tracing::warn!(slot, addr = config.address(), error = %err, "pool slot left empty")
                }
            }
        }
        tracing::info!(
            addr = config.address(),
            warm = idle.len(),
            capacity,
            "store connection pool ready"
        );

        Self { config, idle: Mutex::new(Some(idle)) }
    }

    /// Maximum number of idle connections kept.
    pub fn capacity(&self) -> usize {
        self.config.pool_capacity()
    }

    /// Number of idle connections currently buffered.
    pub fn idle_count(&self) -> usize {
        self.lock().as_ref().map_or(0, VecDeque::len)
    }

    /// Take an idle connection, or dial a fresh one when none is idle.
    pub async fn get(&self) -> Result<Connection> {
        let idle = match self.lock().as_mut() {
            Some(queue) => queue.pop_front(),
            None => return Err(Error::PoolClosed),
        };
        match idle {
            Some(conn) => Ok(conn),
            None => Connection::open(&self.config).await,
        }
    }

    /// Return a healthy connection. Closes it when the pool is full or closed.
    pub fn put(&self, conn: Connection) {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(queue) if queue.len() < self.config.pool_capacity() => queue.push_back(conn),
            _ => drop(conn),
        }
    }

    /// Close the pool and every idle connection in it.
    ///
    /// Must only be called once in-flight requests have drained; later `get`
    /// calls fail with [`Error::PoolClosed`].
    pub fn close(&self) {
        let drained = self.lock().take();
        if let Some(queue) = drained {
            tracing::info!(closed = queue.len(), "store connection pool closed");
        }
    }

    /// Check a connection out for one exchange; see [`PooledConnection`].
    pub async fn checkout(&self) -> Result<PooledConnection<'_>> {
        let conn = self.get().await?;
        Ok(PooledConnection { pool: self, conn: Some(conn), healthy: true })
    }

    fn lock(&self) -> MutexGuard<'_, Option<VecDeque<Connection>>> {
        // The queue holds no invariant a panic could break.
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out connection that goes back to the pool on drop only if every
/// exchange on it completed.
///
/// A fault, or a future dropped mid-exchange, leaves `healthy` false and the
/// connection is closed instead of pooled.
#[derive(Debug)]
pub struct PooledConnection<'a> {
    pool: &'a Pool,
    conn: Option<Connection>,
    healthy: bool,
}

impl PooledConnection<'_> {
    pub async fn exec<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(Error::PoolClosed),
        };
        self.healthy = false;
        let reply = conn.exec(args).await?;
        self.healthy = true;
        Ok(reply)
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.healthy {
                self.pool.put(conn);
            } else {
                tracing::warn!(addr = self.pool.config.address(), "discarding faulted store connection");
            }
        }
    }
}
