//! A single authenticated, database-selected stream to the store.

use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::codec::{encode_command, read_reply, Reply};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// One open stream plus its reusable write buffer.
///
/// A connection is owned by exactly one task at a time. Any error returned by
/// [`Connection::exec`] other than an error *reply* leaves the stream in an
/// unknown state; callers must drop it instead of pooling it.
#[derive(Debug)]
pub struct Connection {
    reader: BufReader<TcpStream>,
    write_buf: Vec<u8>,
    timeout: Duration,
}

impl Connection {
    /// Dial, AUTH when a credential is configured, then SELECT the database.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let dial_timeout = config.dial_timeout();
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(config.address()))
            .await
            .map_err(|_| Error::Timeout { timeout: dial_timeout })??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            reader: BufReader::new(stream),
            write_buf: Vec::with_capacity(256),
            timeout: config.command_timeout(),
        };

        if let Some(password) = config.password() {
            match conn.exec(&["AUTH", password]).await? {
                Reply::Status(ref ok) if ok == "OK" => {}
                other => return Err(Error::Auth(describe(&other))),
            }
        }

        let db = config.db();
        match conn.exec(&["SELECT", db.to_string().as_str()]).await? {
            Reply::Status(ref ok) if ok == "OK" => {}
            other => return Err(Error::Select { db, reason: describe(&other) }),
        }

        Ok(conn)
    }

    /// Send one command and read its reply under a single deadline.
    pub async fn exec<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let Self { reader, write_buf, timeout } = self;
        write_buf.clear();
        encode_command(args, write_buf);

        let exchange = async {
            let stream = reader.get_mut();
            stream.write_all(write_buf.as_slice()).await?;
            stream.flush().await?;
            read_reply(&mut *reader).await
        };

        match tokio::time::timeout(*timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { timeout: *timeout }),
        }
    }
}

fn describe(reply: &Reply) -> String {
    match reply {
        Reply::Status(s) | Reply::Error(s) | Reply::Bulk(s) => s.clone(),
        other => format!("unexpected {} reply", other.kind_name()),
    }
}
