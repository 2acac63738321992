//! Minimal RESP2 codec: command encoding and single-reply decoding.
//!
//! Commands are always sent as an array of bulk strings. Replies are decoded
//! one top-level value at a time, dispatched on the first byte of the line:
//!
//! | lead | reply      |
//! |------|------------|
//! | `+`  | status     |
//! | `-`  | error      |
//! | `$`  | bulk       |
//! | `*`  | array      |
//! | `:`  | integer    |
//!
//! Bulk payloads are read as the next CRLF-terminated line, so payloads with
//! an embedded CRLF are not supported. Everything this crate reads back is a
//! digest, a status word or a number.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

/// Largest element count accepted for a single array reply.
pub const MAX_ARRAY_LEN: usize = 1024;
/// Deepest array nesting accepted in a reply.
pub const MAX_DEPTH: usize = 4;
/// Longest line (including CRLF) accepted from the peer.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK`, `+PONG`, ...
    Status(String),
    /// `-ERR ...`, `-NOSCRIPT ...`
    Error(String),
    /// `$<len>` followed by the payload line.
    Bulk(String),
    /// `:<n>`
    Integer(i64),
    /// `*<n>` followed by `n` replies.
    Array(Vec<Reply>),
    /// `$-1` or `*-1`.
    Nil,
}

impl Reply {
    /// Leading upper-case token of an error reply (`NOSCRIPT`, `ERR`, `WRONGPASS`...).
    pub fn error_kind(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => msg.split_whitespace().next(),
            _ => None,
        }
    }

    /// Text of a status or bulk reply.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Status(s) | Reply::Bulk(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, also accepting a bulk string holding a base-10 integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            Reply::Bulk(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Floating point value of an integer or numeric bulk reply.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reply::Integer(n) => Some(*n as f64),
            Reply::Bulk(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Bulk(_) => "bulk",
            Reply::Integer(_) => "integer",
            Reply::Array(_) => "array",
            Reply::Nil => "nil",
        }
    }
}

/// Append the RESP encoding of `args` to `out`.
///
/// ```
/// let mut buf = Vec::new();
/// clusterlimit::codec::encode_command(&["SELECT", "2"], &mut buf);
/// assert_eq!(buf, b"*2\r\n$6\r\nSELECT\r\n$1\r\n2\r\n");
/// ```
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

enum Header {
    Value(Reply),
    Bulk(i64),
    Array(i64),
}

/// Read exactly one top-level reply from `reader`.
///
/// Nested arrays are decoded iteratively with a bounded depth and element
/// count, so a misbehaving peer cannot make us allocate without limit.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    // (children decoded so far, declared child count)
    let mut open: Vec<(Vec<Reply>, usize)> = Vec::new();

    loop {
        read_line(reader, &mut line).await?;
        let mut reply = match decode_header(&line)? {
            Header::Value(reply) => reply,
            Header::Bulk(len) if len < 0 => Reply::Nil,
            Header::Bulk(_) => {
                // Declared length is not enforced; the payload is the next line.
                read_line(reader, &mut line).await?;
                Reply::Bulk(utf8(&line)?)
            }
            Header::Array(count) if count < 0 => Reply::Nil,
            Header::Array(count) => {
                let count = usize::try_from(count).unwrap_or(usize::MAX);
                if count > MAX_ARRAY_LEN {
                    return Err(Error::protocol(format!(
                        "array of {count} elements exceeds limit of {MAX_ARRAY_LEN}"
                    )));
                }
                if count == 0 {
                    Reply::Array(Vec::new())
                } else {
                    if open.len() >= MAX_DEPTH {
                        return Err(Error::protocol(format!(
                            "array nesting deeper than {MAX_DEPTH}"
                        )));
                    }
                    open.push((Vec::with_capacity(count), count));
                    continue;
                }
            }
        };

        // Fold the finished value into its parents, closing every array it completes.
        loop {
            let (mut items, want) = match open.pop() {
                Some(frame) => frame,
                None => return Ok(reply),
            };
            items.push(reply);
            if items.len() < want {
                open.push((items, want));
                break;
            }
            reply = Reply::Array(items);
        }
    }
}

/// Read one CRLF-terminated line into `buf`, without the terminator.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader).take(MAX_LINE_LEN as u64).read_until(b'\n', buf).await?;
    if read == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "store closed the connection",
        )));
    }
    if buf.len() < 2 || !buf.ends_with(b"\r\n") {
        return Err(Error::protocol(format!("truncated reply line ({} bytes)", buf.len())));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn decode_header(line: &[u8]) -> Result<Header> {
    let (lead, rest) = match line.split_first() {
        Some(split) => split,
        None => return Err(Error::protocol("empty reply line")),
    };
    match *lead {
        b'+' => Ok(Header::Value(Reply::Status(utf8(rest)?))),
        b'-' => Ok(Header::Value(Reply::Error(utf8(rest)?))),
        b':' => Ok(Header::Value(Reply::Integer(parse_int(rest)?))),
        b'$' => Ok(Header::Bulk(parse_int(rest)?)),
        b'*' => Ok(Header::Array(parse_int(rest)?)),
        other => Err(Error::protocol(format!("unknown reply type byte 0x{other:02x}"))),
    }
}

fn parse_int(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::protocol(format!("invalid integer {:?}", String::from_utf8_lossy(raw))))
}

fn utf8(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("reply is not valid UTF-8"))
}
