//! RESP2 wire codec.
//!
//! [`RespCodec`] encodes [`Command`]s and decodes [`Value`]s. Decoding is
//! incremental: a partial reply leaves the buffer untouched until the rest of
//! it arrives.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::{Command, Value};

/// Largest bulk string accepted from the server.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Longest header or simple-string line accepted from the server.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Deepest nesting of arrays accepted from the server.
pub const MAX_DEPTH: usize = 32;

/// The server sent bytes that are not valid RESP.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Unknown leading type byte.
    #[error("invalid reply type byte {:?}", char::from(*.0))]
    InvalidType(u8),

    /// An integer or length field is not a decimal number.
    #[error("invalid integer in reply")]
    InvalidInteger,

    /// A bulk or array length is out of range.
    #[error("invalid length {0} in reply")]
    InvalidLength(i64),

    /// A bulk payload is not followed by CRLF.
    #[error("missing CRLF terminator in reply")]
    MissingTerminator,

    /// A line grew past [`MAX_LINE_LEN`] without a terminator.
    #[error("reply line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Arrays nest deeper than [`MAX_DEPTH`].
    #[error("reply nesting exceeds {0} levels")]
    TooDeep(usize),

    /// A reply arrived while no request was waiting for one.
    #[error("unexpected reply with no pending request")]
    Unsolicited,
}

/// Error from reading or writing a framed RESP stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Malformed reply.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O error on the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec for the client side of a RESP2 connection.
///
/// Arrays are decoded one element at a time. Elements already parsed are kept
/// between calls along with the offset reached, so a large array arriving in
/// many reads is scanned once. The read buffer itself is only advanced when a
/// whole reply is complete, which means the codec expects to see the same
/// buffer, with data only appended, until then.
#[derive(Debug, Clone, Default)]
pub struct RespCodec {
    /// Arrays still waiting for elements, innermost last.
    stack: Vec<PartialArray>,
    /// Where parsing resumes in the read buffer.
    offset: usize,
}

#[derive(Debug, Clone)]
struct PartialArray {
    remaining: usize,
    items: Vec<Value>,
}

impl RespCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.offset = 0;
    }

    /// Add a finished value to the innermost open array, closing every array
    /// it completes. Returns the top-level value once there is one.
    fn complete(&mut self, mut value: Value) -> Option<Value> {
        loop {
            let Some(mut top) = self.stack.pop() else {
                return Some(value);
            };
            top.items.push(value);
            top.remaining -= 1;
            if top.remaining > 0 {
                self.stack.push(top);
                return None;
            }
            value = Value::Array(top.items);
        }
    }
}

impl Decoder for RespCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.offset > src.len() {
            // Not the buffer the partial state came from.
            self.reset();
        }

        loop {
            let parsed = match parse(src, self.offset, self.stack.len()) {
                Ok(parsed) => parsed,
                Err(error) => {
                    self.reset();
                    return Err(error.into());
                }
            };
            let Some((item, next)) = parsed else {
                return Ok(None);
            };
            self.offset = next;

            let value = match item {
                Item::Value(value) => value,
                Item::Array(0) => Value::Array(Vec::new()),
                Item::Array(len) => {
                    // Each element needs at least three bytes, so cap the
                    // preallocation by what is already buffered.
                    let capacity = len.min(src.len().saturating_sub(next) / 3);
                    self.stack.push(PartialArray {
                        remaining: len,
                        items: Vec::with_capacity(capacity),
                    });
                    continue;
                }
            };

            if let Some(value) = self.complete(value) {
                src.advance(self.offset);
                self.offset = 0;
                return Ok(Some(value));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(value) => Ok(Some(value)),
            None => {
                // A truncated reply at EOF is dropped, the stream is closed either way.
                if !buf.is_empty() {
                    tracing::trace!(bytes = buf.len(), "discarding partial reply at eof");
                    buf.clear();
                }
                self.reset();
                Ok(None)
            }
        }
    }
}

impl Encoder<Command> for RespCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

/// One step of decoding: a complete scalar, or the header of an array.
#[derive(Debug)]
enum Item {
    Value(Value),
    Array(usize),
}

type Parsed = Option<(Item, usize)>;

/// Parse one item starting at `pos`, nested `depth` arrays deep. Returns the
/// item and the position just past it, or `None` if the buffer ends first.
fn parse(buf: &[u8], pos: usize, depth: usize) -> Result<Parsed, ProtocolError> {
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };

    if !matches!(kind, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(ProtocolError::InvalidType(kind));
    }

    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    let value = match kind {
        b'+' => Value::Status(String::from_utf8_lossy(line).into_owned()),
        b'-' => Value::Error(String::from_utf8_lossy(line).into_owned()),
        b':' => Value::Integer(parse_integer(line)?),
        b'$' => return parse_bulk(buf, parse_integer(line)?, next),
        _ => return parse_array_header(parse_integer(line)?, next, depth),
    };
    Ok(Some((Item::Value(value), next)))
}

fn parse_bulk(buf: &[u8], len: i64, start: usize) -> Result<Parsed, ProtocolError> {
    if len == -1 {
        return Ok(Some((Item::Value(Value::Bulk(None)), start)));
    }
    if !(0..=MAX_BULK_LEN).contains(&len) {
        return Err(ProtocolError::InvalidLength(len));
    }

    let end = start + len as usize;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(ProtocolError::MissingTerminator);
    }

    Ok(Some((
        Item::Value(Value::Bulk(Some(Bytes::copy_from_slice(&buf[start..end])))),
        end + 2,
    )))
}

fn parse_array_header(len: i64, start: usize, depth: usize) -> Result<Parsed, ProtocolError> {
    if len == -1 {
        return Ok(Some((Item::Value(Value::Bulk(None)), start)));
    }
    let Ok(len) = usize::try_from(len) else {
        return Err(ProtocolError::InvalidLength(len));
    };
    if depth >= MAX_DEPTH {
        return Err(ProtocolError::TooDeep(MAX_DEPTH));
    }
    Ok(Some((Item::Array(len), start)))
}

/// Find the CRLF-terminated line starting at `start`.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let rest = buf.get(start..).unwrap_or_default();
    match rest.windows(2).position(|window| window == b"\r\n") {
        Some(len) if len > MAX_LINE_LEN => Err(ProtocolError::LineTooLong(MAX_LINE_LEN)),
        Some(len) => Ok(Some((&rest[..len], start + len + 2))),
        None if rest.len() > MAX_LINE_LEN => Err(ProtocolError::LineTooLong(MAX_LINE_LEN)),
        None => Ok(None),
    }
}

fn parse_integer(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(ProtocolError::InvalidInteger)
}
