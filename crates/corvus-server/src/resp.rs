//! Minimal RESP codec for the cluster command surface.
//!
//! Parses inbound client traffic into argv vectors (multibulk arrays of
//! bulk strings, plus the inline form redis-cli falls back to) and encodes
//! the reply types the cluster commands produce. The parser works on a
//! buffered byte slice and returns `Ok(None)` until a complete command is
//! available, so the connection loop can retry as data arrives.

use bytes::{BufMut, Bytes, BytesMut};

/// Hard cap on argv length; commands here never need more.
const MAX_ARGS: usize = 1024 * 1024;

/// Bulk strings above this are rejected (512 MB, matching Redis).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Parse failures are protocol errors; the connection should be closed.
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Attempts to parse one command from `buf`.
///
/// Returns `Ok(Some((argv, consumed)))` for a complete command,
/// `Ok(None)` when more bytes are needed.
pub fn parse_command(buf: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>, RespError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] == b'*' {
        parse_multibulk(buf)
    } else {
        parse_inline(buf)
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

fn parse_int(raw: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RespError::Protocol("invalid length".into()))
}

fn parse_multibulk(buf: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>, RespError> {
    let Some(line_end) = find_crlf(buf, 1) else {
        return Ok(None);
    };
    let argc = parse_int(&buf[1..line_end])?;
    if argc < 0 || argc as usize > MAX_ARGS {
        return Err(RespError::Protocol(format!("invalid multibulk count {argc}")));
    }
    let mut argv = Vec::with_capacity((argc as usize).min(64));
    let mut pos = line_end + 2;
    for _ in 0..argc {
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] != b'$' {
            return Err(RespError::Protocol("expected bulk string".into()));
        }
        let Some(len_end) = find_crlf(buf, pos + 1) else {
            return Ok(None);
        };
        let len = parse_int(&buf[pos + 1..len_end])?;
        if !(0..=MAX_BULK_LEN).contains(&len) {
            return Err(RespError::Protocol(format!("invalid bulk length {len}")));
        }
        let data_start = len_end + 2;
        let data_end = data_start + len as usize;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(RespError::Protocol("bulk string missing terminator".into()));
        }
        argv.push(Bytes::copy_from_slice(&buf[data_start..data_end]));
        pos = data_end + 2;
    }
    Ok(Some((argv, pos)))
}

/// Inline commands: a space-separated line, as sent by netcat or a
/// desperate operator.
fn parse_inline(buf: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>, RespError> {
    let Some(line_end) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let line = &buf[..line_end];
    let argv: Vec<Bytes> = line
        .split(|&b| b == b' ')
        .filter(|part| !part.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();
    Ok(Some((argv, line_end + 2)))
}

/// Replies the cluster surface produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".into())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Reply::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Error(msg) => {
                buf.put_u8(b'-');
                buf.put_slice(msg.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Int(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Reply::Nil => buf.put_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                buf.put_u8(b'*');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parsed: Option<(Vec<Bytes>, usize)>) -> Vec<String> {
        parsed
            .unwrap()
            .0
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    #[test]
    fn multibulk_roundtrip() {
        let input = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let (argv, consumed) = parse_command(input).unwrap().unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(argv.len(), 3);
        assert_eq!(&argv[0][..], b"SET");
        assert_eq!(&argv[2][..], b"bar");
    }

    #[test]
    fn incomplete_returns_none() {
        assert!(parse_command(b"").unwrap().is_none());
        assert!(parse_command(b"*2\r\n$3\r\nGET\r\n").unwrap().is_none());
        assert!(parse_command(b"*2\r\n$3\r\nGET\r\n$5\r\nhel").unwrap().is_none());
    }

    #[test]
    fn pipelined_commands_consume_exactly_one() {
        let input = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n";
        let (_, consumed) = parse_command(input).unwrap().unwrap();
        assert_eq!(consumed, input.len() / 2);
    }

    #[test]
    fn inline_command() {
        let parsed = parse_command(b"CLUSTER MEET 127.0.0.1 16001\r\n").unwrap();
        assert_eq!(args(parsed), vec!["CLUSTER", "MEET", "127.0.0.1", "16001"]);
    }

    #[test]
    fn inline_collapses_spaces() {
        let parsed = parse_command(b"GET   foo\r\n").unwrap();
        assert_eq!(args(parsed), vec!["GET", "foo"]);
    }

    #[test]
    fn malformed_rejected() {
        assert!(parse_command(b"*-5\r\n").is_err());
        assert!(parse_command(b"*1\r\n:5\r\n").is_err());
        assert!(parse_command(b"*1\r\n$-2\r\n\r\n").is_err());
        assert!(parse_command(b"*1\r\n$3\r\nfooXX").is_err());
    }

    #[test]
    fn reply_encodings() {
        assert_eq!(&Reply::ok().to_bytes()[..], b"+OK\r\n");
        assert_eq!(
            &Reply::Error("MOVED 866 127.0.0.1:16001".into()).to_bytes()[..],
            b"-MOVED 866 127.0.0.1:16001\r\n"
        );
        assert_eq!(&Reply::Int(42).to_bytes()[..], b":42\r\n");
        assert_eq!(&Reply::Bulk(Bytes::from("hi")).to_bytes()[..], b"$2\r\nhi\r\n");
        assert_eq!(&Reply::Nil.to_bytes()[..], b"$-1\r\n");
        assert_eq!(
            &Reply::Array(vec![Reply::Int(1), Reply::Bulk(Bytes::from("x"))]).to_bytes()[..],
            b"*2\r\n:1\r\n$1\r\nx\r\n"
        );
    }
}
