//! RESP (REdis Serialization Protocol) codec: multibulk command encoding and
//! an incremental, continuation-preserving reply decoder.
//!
//! The encoder is a pure function over a [`Command`]. The decoder is a
//! struct that owns its unparsed tail and resumes exactly where it left
//! off across calls to [`Decoder::feed`] — it never restarts parsing from
//! the start of the stream and never re-copies bytes beyond what a
//! completed reply's payload requires.

use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};

/// One argument of an outbound command.
///
/// `Float` exists only so encoding can reject it: per the wire contract,
/// floats are never serialized (lossy round-trips are a non-goal).
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bulk(Bytes),
    Int(i64),
    Atom(String),
    Float(f64),
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Atom(s.to_string())
    }
}
impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Atom(s)
    }
}
impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}
impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v as i64)
    }
}
impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::Int(v as i64)
    }
}
impl From<usize> for Arg {
    fn from(v: usize) -> Self {
        Arg::Int(v as i64)
    }
}
impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Arg::Bulk(b)
    }
}
impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg::Bulk(Bytes::from(b))
    }
}
impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Arg::Bulk(Bytes::copy_from_slice(b))
    }
}
impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

/// An ordered, flat sequence of arguments. Nested sequences are flattened
/// by the caller before reaching the codec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    args: Vec<Arg>,
}

impl Command {
    pub fn new() -> Self {
        Command { args: Vec::new() }
    }

    pub fn arg(mut self, a: impl Into<Arg>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args(mut self, it: impl IntoIterator<Item = impl Into<Arg>>) -> Self {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    /// Convenience constructor from plain string parts (e.g. `AUTH`/`SELECT`
    /// issued internally by the connection actor).
    pub fn from_strs(parts: &[&str]) -> Self {
        Command {
            args: parts.iter().map(|s| Arg::Atom(s.to_string())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Encode a command as a RESP multibulk frame: `*K\r\n` followed by K
/// `$L\r\nBYTES\r\n` segments.
///
/// Fails synchronously with [`Error::CannotStoreFloats`] if any argument is
/// a float; nothing is written to the wire in that case.
pub fn encode(cmd: &Command) -> Result<BytesMut> {
    let mut parts: Vec<Bytes> = Vec::with_capacity(cmd.args.len());
    for a in &cmd.args {
        parts.push(arg_to_bytes(a)?);
    }
    Ok(encode_parts(&parts))
}

fn arg_to_bytes(a: &Arg) -> Result<Bytes> {
    match a {
        Arg::Bulk(b) => Ok(b.clone()),
        Arg::Atom(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        Arg::Int(i) => Ok(Bytes::from(i.to_string().into_bytes())),
        Arg::Float(f) => Err(Error::CannotStoreFloats(f.to_string())),
    }
}

fn encode_parts(parts: &[Bytes]) -> BytesMut {
    let mut out = BytesMut::new();
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for p in parts {
        out.extend_from_slice(format!("${}\r\n", p.len()).as_bytes());
        out.extend_from_slice(p);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    SimpleString(Bytes),
    Error(Bytes),
    /// Numeric reply, carried as its textual bytes — never parsed.
    Integer(Bytes),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

struct ArrayFrame {
    remaining: usize,
    items: Vec<Reply>,
}

/// What the decoder is waiting on for the *next* value, once its header has
/// already been consumed from the buffer. This is the only state that
/// must survive across `feed` calls beyond the open-array stack, since a
/// line-terminated header either completes or is left untouched in the
/// buffer for the next call.
enum Pending {
    None,
    BulkBody(usize),
}

enum ParseOutcome {
    Leaf(Reply),
    PushedArray,
    Incomplete,
}

/// Incremental RESP reply decoder.
///
/// Owns the unparsed tail of the byte stream plus a continuation (an open
/// array stack and a pending bulk-body wait). Feeding bytes never rescans
/// already-completed replies; at most the current unresolved header line
/// is rescanned, which is bounded by the header's own length.
pub struct Decoder {
    buf: BytesMut,
    stack: Vec<ArrayFrame>,
    pending: Pending,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            buf: BytesMut::new(),
            stack: Vec::new(),
            pending: Pending::None,
        }
    }

    /// Append `bytes` to the tail and decode as many complete replies as
    /// the buffer now contains.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Reply>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            if let Some(top) = self.stack.last() {
                if top.remaining == 0 {
                    let frame = self.stack.pop().expect("just checked");
                    self.attach(Reply::Array(Some(frame.items)), &mut out);
                    continue;
                }
            }

            match self.try_parse_one()? {
                ParseOutcome::Leaf(reply) => self.attach(reply, &mut out),
                ParseOutcome::PushedArray => continue,
                ParseOutcome::Incomplete => break,
            }
        }
        Ok(out)
    }

    fn attach(&mut self, reply: Reply, out: &mut Vec<Reply>) {
        if let Some(top) = self.stack.last_mut() {
            top.items.push(reply);
            top.remaining -= 1;
        } else {
            out.push(reply);
        }
    }

    fn try_parse_one(&mut self) -> Result<ParseOutcome> {
        if let Pending::BulkBody(len) = self.pending {
            if self.buf.len() < len + 2 {
                return Ok(ParseOutcome::Incomplete);
            }
            let data = self.buf.split_to(len).freeze();
            if &self.buf[..2] != b"\r\n" {
                return Err(Error::Decode("bulk body not terminated by CRLF".into()));
            }
            self.buf.advance(2);
            self.pending = Pending::None;
            return Ok(ParseOutcome::Leaf(Reply::Bulk(Some(data))));
        }

        let Some(&type_byte) = self.buf.first() else {
            return Ok(ParseOutcome::Incomplete);
        };
        if !matches!(type_byte, b'+' | b'-' | b':' | b'$' | b'*') {
            return Err(Error::Decode(format!(
                "unknown reply type byte {type_byte:#x}"
            )));
        }

        let Some(line_len) = find_line_end(&self.buf[1..])? else {
            return Ok(ParseOutcome::Incomplete);
        };
        let line = self.buf[1..1 + line_len].to_vec();
        let total = 1 + line_len + 2;

        match type_byte {
            b'+' => {
                self.buf.advance(total);
                Ok(ParseOutcome::Leaf(Reply::SimpleString(Bytes::from(line))))
            }
            b'-' => {
                self.buf.advance(total);
                Ok(ParseOutcome::Leaf(Reply::Error(Bytes::from(line))))
            }
            b':' => {
                self.buf.advance(total);
                Ok(ParseOutcome::Leaf(Reply::Integer(Bytes::from(line))))
            }
            b'$' => {
                let len = parse_length(&line)?;
                self.buf.advance(total);
                if len == -1 {
                    return Ok(ParseOutcome::Leaf(Reply::Bulk(None)));
                }
                let len = len as usize;
                if self.buf.len() < len + 2 {
                    self.pending = Pending::BulkBody(len);
                    return Ok(ParseOutcome::Incomplete);
                }
                let data = self.buf.split_to(len).freeze();
                if &self.buf[..2] != b"\r\n" {
                    return Err(Error::Decode("bulk body not terminated by CRLF".into()));
                }
                self.buf.advance(2);
                Ok(ParseOutcome::Leaf(Reply::Bulk(Some(data))))
            }
            b'*' => {
                let len = parse_length(&line)?;
                self.buf.advance(total);
                if len == -1 {
                    return Ok(ParseOutcome::Leaf(Reply::Array(None)));
                }
                if len == 0 {
                    return Ok(ParseOutcome::Leaf(Reply::Array(Some(Vec::new()))));
                }
                self.stack.push(ArrayFrame {
                    remaining: len as usize,
                    items: Vec::with_capacity(len as usize),
                });
                Ok(ParseOutcome::PushedArray)
            }
            _ => unreachable!("type byte validated above"),
        }
    }
}

/// Find the offset of a `\r\n` in `buf`, treating a lone `\r` not (yet)
/// followed by `\n` as a fatal protocol error rather than silently waiting
/// forever on a byte that will never complete the pair.
fn find_line_end(buf: &[u8]) -> Result<Option<usize>> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\r' {
            return match buf.get(i + 1) {
                Some(b'\n') => Ok(Some(i)),
                Some(_) => Err(Error::Decode("CR not followed by LF".into())),
                None => Ok(None),
            };
        }
        i += 1;
    }
    Ok(None)
}

fn parse_length(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|n| *n >= -1)
        .ok_or_else(|| {
            Error::Decode(format!(
                "non-numeric length: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}
