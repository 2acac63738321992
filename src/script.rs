//! Script execution by cached digest, with load-then-run fallback.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;

use crate::client::Script;
use crate::codec::Reply;
use crate::error::{Error, Result};
use crate::pool::{Pool, PooledConnection};

/// Length of a SHA-1 hex digest as returned by `SCRIPT LOAD`.
pub const DIGEST_LEN: usize = 40;

/// Error kind the store uses when a digest is unknown (e.g. after a restart).
const MISSING_SCRIPT: &str = "NOSCRIPT";

/// Script source plus the digest the store knows it by.
///
/// The digest is only a cache: losing it costs one `SCRIPT LOAD` round trip.
/// Concurrent runs may race to reload; every load of the same source yields
/// the same digest, so last-writer-wins is harmless.
#[derive(Debug)]
pub struct StoredScript {
    pool: Arc<Pool>,
    source: String,
    digest: ArcSwapOption<String>,
}

enum Step {
    Execute(Arc<String>),
    Load,
}

impl StoredScript {
    pub fn new(pool: Arc<Pool>, source: impl Into<String>) -> Self {
        Self { pool, source: source.into(), digest: ArcSwapOption::empty() }
    }

    /// Digest cached by the last successful load, if any.
    pub fn digest(&self) -> Option<Arc<String>> {
        self.digest.load_full()
    }

    async fn load(&self, conn: &mut PooledConnection<'_>) -> Result<Arc<String>> {
        let reply = conn.exec(&["SCRIPT", "LOAD", self.source.as_str()]).await?;
        let digest = match reply {
            Reply::Bulk(digest) if is_digest(&digest) => Arc::new(digest),
            Reply::Error(reason) => return Err(Error::ScriptLoad(reason)),
            other => return Err(Error::ScriptLoad(format!("unexpected reply {other:?}"))),
        };
        tracing::debug!(digest = digest.as_str(), "script loaded");
        self.digest.store(Some(digest.clone()));
        Ok(digest)
    }
}

#[async_trait]
impl Script for StoredScript {
    async fn run(&self, keys: &[String], args: &[String]) -> Result<Reply> {
        let mut conn = self.pool.checkout().await?;
        let numkeys = keys.len().to_string();
        let mut reloaded = false;
        let mut step = match self.digest() {
            Some(digest) => Step::Execute(digest),
            None => Step::Load,
        };

        loop {
            step = match step {
                Step::Load => {
                    reloaded = true;
                    Step::Execute(self.load(&mut conn).await?)
                }
                Step::Execute(digest) => {
                    let mut command: Vec<&str> = Vec::with_capacity(3 + keys.len() + args.len());
                    command.extend(["EVALSHA", digest.as_str(), numkeys.as_str()]);
                    command.extend(keys.iter().map(String::as_str));
                    command.extend(args.iter().map(String::as_str));

                    let reply = conn.exec(&command).await?;
                    if reply.error_kind() == Some(MISSING_SCRIPT) && !reloaded {
                        tracing::debug!(digest = digest.as_str(), "script missing from store, reloading");
                        Step::Load
                    } else {
                        return match reply {
                            Reply::Error(reason) => Err(Error::Script(reason)),
                            other => Ok(other),
                        };
                    }
                }
            };
        }
    }
}

fn is_digest(candidate: &str) -> bool {
    candidate.len() == DIGEST_LEN && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}
