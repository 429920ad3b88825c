//! RESP values and commands.
//!
//! Commands are always sent as arrays of bulk strings. Replies may be any of
//! the five RESP2 types, represented by [`Value`].
//!
//! The wire format lives in [`codec`], as a [`tokio_util::codec`] pair that can
//! be used with [`tokio_util::codec::Framed`] on any byte stream.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

pub mod codec;

pub use self::codec::{CodecError, ProtocolError, RespCodec};

/// A reply from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Simple string, `+OK`.
    Status(String),

    /// Error reply, `-ERR message`.
    Error(String),

    /// Integer reply, `:42`.
    Integer(i64),

    /// Bulk string, `$3\r\nfoo`. `None` is the null reply (`$-1` or `*-1`).
    Bulk(Option<Bytes>),

    /// Array of nested values.
    Array(Vec<Value>),
}

impl Value {
    /// The null value.
    pub const NIL: Value = Value::Bulk(None);

    /// Whether this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Bulk(None))
    }

    /// Whether this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Raw bytes of a bulk or status reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bulk(Some(bytes)) => Some(bytes),
            Value::Status(status) => Some(status.as_bytes()),
            _ => None,
        }
    }

    /// Value of an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Elements of an array reply.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Status(status) => f.write_str(status),
            Value::Error(message) => write!(f, "(error) {message}"),
            Value::Integer(n) => write!(f, "(integer) {n}"),
            Value::Bulk(None) => f.write_str("(nil)"),
            Value::Bulk(Some(bytes)) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A command to send to the server: a name followed by arguments.
///
/// Arguments are binary safe.
///
/// ```
/// # use respdriver::resp::Command;
/// let command = Command::new("SET").arg("greeting").arg(b"hello");
/// assert_eq!(command.args().len(), 3);
///
/// let same: Command = ["SET", "greeting", "hello"].into();
/// assert_eq!(command, same);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command with its name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.push(arg);
        self
    }

    /// Append an argument in place.
    pub fn push(&mut self, arg: impl AsRef<[u8]>) {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
    }

    /// All words of the command, name first.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Command name, if the command is not empty.
    pub fn name(&self) -> Option<&[u8]> {
        self.args.first().map(|name| name.as_ref())
    }

    /// Write the wire form of this command into `dst`.
    pub(crate) fn write_to(&self, dst: &mut BytesMut) {
        let payload: usize = self.args.iter().map(|arg| arg.len() + 16).sum();
        dst.reserve(payload + 16);

        dst.put_u8(b'*');
        dst.put_slice(self.args.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");

        for arg in &self.args {
            dst.put_u8(b'$');
            dst.put_slice(arg.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
    }
}

impl<S: AsRef<[u8]>> FromIterator<S> for Command {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            args: iter
                .into_iter()
                .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
                .collect(),
        }
    }
}

impl<S: AsRef<[u8]>, const N: usize> From<[S; N]> for Command {
    fn from(args: [S; N]) -> Self {
        args.into_iter().collect()
    }
}

impl<S: AsRef<[u8]>> From<Vec<S>> for Command {
    fn from(args: Vec<S>) -> Self {
        args.into_iter().collect()
    }
}

impl From<&str> for Command {
    fn from(name: &str) -> Self {
        Command::new(name)
    }
}
