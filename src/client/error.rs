use std::io;

use thiserror::Error;

use crate::resp::{CodecError, ProtocolError};
use crate::target::InvalidTarget;
use crate::BoxError;

/// Client error type.
///
/// Setup failures keep the wording clients of Redis servers expect, with the
/// underlying cause available through [`std::error::Error::source`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection target could not be parsed.
    #[error(transparent)]
    InvalidTarget(#[from] InvalidTarget),

    /// The transport failed to open a stream.
    #[error("Connection to Redis server failed because underlying transport connection failed")]
    TransportConnectFailed(#[source] BoxError),

    /// The server rejected `AUTH`.
    #[error("Connection to Redis server failed because AUTH command failed")]
    AuthFailed(#[source] ServerError),

    /// The server rejected `SELECT`.
    #[error("Connection to Redis server failed because SELECT command failed")]
    SelectFailed(#[source] ServerError),

    /// The connection was not ready before the timeout elapsed.
    #[error("Connection to Redis server timed out after {seconds} seconds")]
    ConnectionTimedOut {
        /// The configured timeout, in seconds.
        seconds: f64,
    },

    /// The connection attempt was cancelled by the caller.
    #[error("Connection to Redis server cancelled")]
    ConnectionCancelled,

    /// The server sent a malformed reply. The connection is closed.
    #[error("protocol error: {0}")]
    Protocol(#[source] ProtocolError),

    /// The connection closed before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// The underlying stream failed. The connection is closed.
    #[error("transport error")]
    Transport(#[source] io::Error),

    /// The server answered with an error reply.
    #[error(transparent)]
    Server(ServerError),
}

impl Error {
    /// Whether this error came from an error reply, leaving the connection usable.
    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server(_))
    }

    /// Whether this error ended (or prevented) the connection.
    pub fn is_closed(&self) -> bool {
        !self.is_server()
    }

    /// The server's error reply, if this error carries one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(error) | Error::AuthFailed(error) | Error::SelectFailed(error) => {
                Some(error)
            }
            _ => None,
        }
    }

    /// Produce an equivalent error for another waiter on the same connection.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Protocol(error) => Error::Protocol(error.clone()),
            Error::Transport(error) => {
                Error::Transport(io::Error::new(error.kind(), error.to_string()))
            }
            Error::Server(error) => Error::Server(error.clone()),
            _ => Error::ConnectionClosed,
        }
    }
}

impl From<CodecError> for Error {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Protocol(error) => Error::Protocol(error),
            CodecError::Io(error) => Error::Transport(error),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(error: ProtocolError) -> Self {
        Error::Protocol(error)
    }
}

/// An error reply from the server, such as `ERR invalid password`.
///
/// Displays as the server's text, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServerError {
    message: String,
}

impl ServerError {
    /// Wrap the text of an error reply.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error code, the first word of the message (`ERR`, `WRONGTYPE`, ...).
    pub fn code(&self) -> &str {
        self.message.split_whitespace().next().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync);
    assert_impl_all!(ServerError: std::error::Error, Send, Sync, Clone);

    #[test]
    fn auth_failure_keeps_server_text() {
        let error = Error::AuthFailed(ServerError::new("ERR invalid password"));
        assert_eq!(
            error.to_string(),
            "Connection to Redis server failed because AUTH command failed"
        );
        assert_eq!(
            error.source().map(|source| source.to_string()),
            Some("ERR invalid password".to_owned())
        );
        assert_eq!(error.server_error().map(ServerError::code), Some("ERR"));
    }

    #[test]
    fn timeout_names_duration() {
        assert_eq!(
            Error::ConnectionTimedOut { seconds: 0.0 }.to_string(),
            "Connection to Redis server timed out after 0 seconds"
        );
        assert_eq!(
            Error::ConnectionTimedOut { seconds: 1.5 }.to_string(),
            "Connection to Redis server timed out after 1.5 seconds"
        );
    }

    #[test]
    fn duplicate_transport_error() {
        let error = Error::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        match error.duplicate() {
            Error::Transport(copy) => {
                assert_eq!(copy.kind(), io::ErrorKind::BrokenPipe);
                assert_eq!(copy.to_string(), "gone");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            Error::ConnectionCancelled.duplicate(),
            Error::ConnectionClosed
        ));
    }

    #[test]
    fn server_errors_leave_connection_open() {
        assert!(Error::Server(ServerError::new("WRONGTYPE nope")).is_server());
        assert!(Error::ConnectionClosed.is_closed());
    }
}
