//! In-process fake store speaking just enough RESP2 for the limiter.
//!
//! Implements AUTH, SELECT, PING, DEL, SCRIPT LOAD and EVALSHA. The two
//! admission scripts are recognised by source and evaluated by an
//! integer-microsecond GCRA model against a frozen clock, so decisions are
//! deterministic. The Lua itself runs in `tests/redis_scripts.rs`.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clusterlimit::limiter::{ALLOW_AT_MOST_SCRIPT, ALLOW_N_SCRIPT};
use clusterlimit::StoreConfig;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Script that echoes its keys followed by its args as an array.
pub const ECHO_SCRIPT: &str = "return {KEYS, ARGV}";

/// Script whose execution always fails with `-ERR boom`.
pub const FAILING_SCRIPT: &str = "return redis.error_reply('boom')";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Default)]
struct State {
    password: Option<String>,
    reject_select: bool,
    down: bool,
    hang: bool,
    now_micros: i64,
    next_digest: u64,
    scripts: HashMap<String, String>,
    tats: HashMap<String, i64>,
    commands: Vec<String>,
    accepted: usize,
    open: usize,
}

#[derive(Clone)]
pub struct FakeStore {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl FakeStore {
    pub async fn start() -> Self {
        Self::start_with(State::default()).await
    }

    pub async fn with_password(password: &str) -> Self {
        Self::start_with(State { password: Some(password.to_owned()), ..State::default() }).await
    }

    async fn start_with(mut state: State) -> Self {
        state.now_micros = 1_000_000_000;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake store");
        let addr = listener.local_addr().expect("fake store address");
        let store = Self { addr, state: Arc::new(Mutex::new(state)) };

        let accept = store.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = accept.clone();
                tokio::spawn(async move { conn.serve(stream).await });
            }
        });
        store
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Client config pointing at this store with a short command timeout.
    pub fn config(&self) -> StoreConfig {
        StoreConfig::new(self.addr()).with_command_timeout(Duration::from_millis(250))
    }

    /// Command names received so far (`SCRIPT LOAD` as one name).
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// Forget every loaded script, as a restarted store would.
    pub fn flush_scripts(&self) {
        self.state().scripts.clear();
    }

    /// While down, every command makes the store drop the connection.
    pub fn set_down(&self, down: bool) {
        self.state().down = down;
    }

    /// While hanging, commands are read but never answered.
    pub fn set_hang(&self, hang: bool) {
        self.state().hang = hang;
    }

    pub fn set_reject_select(&self, reject: bool) {
        self.state().reject_select = reject;
    }

    pub fn advance(&self, by: Duration) {
        self.state().now_micros += by.as_micros() as i64;
    }

    /// Connections accepted since start.
    pub fn accepted(&self) -> usize {
        self.state().accepted
    }

    /// Connections currently open from the client side.
    pub fn open_connections(&self) -> usize {
        self.state().open
    }

    /// Poll until `open_connections() == expected`, for at most one second.
    pub async fn wait_for_open(&self, expected: usize) -> usize {
        for _ in 0..100 {
            if self.open_connections() == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.open_connections()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake store state")
    }

    async fn serve(&self, stream: TcpStream) {
        {
            let mut state = self.state();
            state.accepted += 1;
            state.open += 1;
        }
        let mut reader = BufReader::new(stream);
        while let Ok(Some(args)) = read_command(&mut reader).await {
            let reply = {
                let mut state = self.state();
                if state.down {
                    break;
                }
                if state.hang {
                    None
                } else {
                    Some(state.handle(&args))
                }
            };
            let Some(reply) = reply else {
                std::future::pending::<()>().await;
                return;
            };
            if reader.get_mut().write_all(&reply).await.is_err() {
                break;
            }
        }
        self.state().open -= 1;
    }
}

async fn read_command(reader: &mut BufReader<TcpStream>) -> io::Result<Option<Vec<String>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let count: usize = header(&line, '*')?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len: usize = header(&line, '$')?;
        let mut payload = vec![0; len + 2];
        reader.read_exact(&mut payload).await?;
        payload.truncate(len);
        args.push(String::from_utf8(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?);
    }
    Ok(Some(args))
}

fn header(line: &str, lead: char) -> io::Result<usize> {
    line.trim_end()
        .strip_prefix(lead)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad header {line:?}")))
}

impl State {
    fn handle(&mut self, args: &[String]) -> Vec<u8> {
        let name = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();
        match name.as_str() {
            "SCRIPT" => self.commands.push("SCRIPT LOAD".into()),
            _ => self.commands.push(name.clone()),
        }

        match (name.as_str(), args.get(1..).unwrap_or_default()) {
            ("AUTH", [password]) => match &self.password {
                Some(expected) if expected == password => status("OK"),
                Some(_) => error("WRONGPASS invalid username-password pair"),
                None => error("ERR AUTH called without any password configured"),
            },
            ("SELECT", [_]) if self.reject_select => error("ERR DB index is out of range"),
            ("SELECT", [_]) => status("OK"),
            ("PING", []) => status("PONG"),
            ("DEL", [key]) => integer(i64::from(self.tats.remove(key).is_some())),
            ("SCRIPT", [sub, source]) if sub.eq_ignore_ascii_case("LOAD") => {
                let known = self.scripts.iter().find(|(_, s)| *s == source).map(|(d, _)| d.clone());
                let digest = match known {
                    Some(digest) => digest,
                    None => {
                        self.next_digest += 1;
                        let digest = format!("{:040x}", self.next_digest);
                        self.scripts.insert(digest.clone(), source.clone());
                        digest
                    }
                };
                bulk(&digest)
            }
            ("EVALSHA", [digest, numkeys, rest @ ..]) => {
                let Some(source) = self.scripts.get(digest).cloned() else {
                    return error("NOSCRIPT No matching script. Please use EVAL.");
                };
                let numkeys: usize = numkeys.parse().unwrap_or(0);
                let (keys, argv) = rest.split_at(numkeys.min(rest.len()));
                self.eval(&source, keys, argv)
            }
            _ => error("ERR unknown command"),
        }
    }

    fn eval(&mut self, source: &str, keys: &[String], argv: &[String]) -> Vec<u8> {
        if source == ECHO_SCRIPT {
            let items: Vec<Vec<u8>> = keys.iter().chain(argv).map(|s| bulk(s)).collect();
            return array(items);
        }
        if source == FAILING_SCRIPT {
            return error("ERR boom");
        }
        let at_most = if source == ALLOW_N_SCRIPT {
            false
        } else if source == ALLOW_AT_MOST_SCRIPT {
            true
        } else {
            return bulk("aaa");
        };

        let (Some(key), [burst, rate, period, cost]) = (keys.first(), argv) else {
            return error("ERR wrong number of arguments");
        };
        let burst: i64 = burst.parse().unwrap_or(0);
        let rate: i64 = rate.parse().unwrap_or(1);
        let period: f64 = period.parse().unwrap_or(1.0);
        let cost: i64 = cost.parse().unwrap_or(1);

        let now = self.now_micros;
        let emission = (period * 1_000_000.0).round() as i64 / rate;
        let burst_offset = emission * burst;
        let tat = self.tats.get(key).copied().unwrap_or(now).max(now);

        if at_most {
            let diff = now - (tat - burst_offset);
            let remaining = diff / emission;
            if remaining < 1 {
                return decision(0, 0, Some(emission - diff), tat - now);
            }
            let allowed = cost.min(remaining);
            let new_tat = tat + emission * allowed;
            self.store(key, new_tat, now);
            decision(allowed, remaining - allowed, None, new_tat - now)
        } else {
            let new_tat = tat + emission * cost;
            let diff = now - (new_tat - burst_offset);
            if diff < 0 {
                return decision(0, 0, Some(-diff), tat - now);
            }
            self.store(key, new_tat, now);
            decision(cost, diff / emission, None, new_tat - now)
        }
    }

    fn store(&mut self, key: &str, new_tat: i64, now: i64) {
        if new_tat > now {
            self.tats.insert(key.to_owned(), new_tat);
        }
    }
}

fn decision(allowed: i64, remaining: i64, retry_micros: Option<i64>, reset_micros: i64) -> Vec<u8> {
    let seconds = |micros: i64| (micros as f64 / 1_000_000.0).to_string();
    let retry = retry_micros.map_or_else(|| "-1".to_owned(), seconds);
    array(vec![integer(allowed), integer(remaining), bulk(&retry), bulk(&seconds(reset_micros))])
}

fn status(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

fn error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

fn integer(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{s}\r\n", s.len()).into_bytes()
}

fn array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend(item);
    }
    out
}
