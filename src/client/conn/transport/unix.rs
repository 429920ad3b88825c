//! Unix Domain Socket transport implementation for client connections.
//!
//! Unlike TCP transports, Unix sockets use filesystem paths as addresses, so this transport only
//! accepts [`Address::Unix`].

use std::io;
use std::task::{Context, Poll};

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{trace, Instrument};

use crate::target::Address;
use crate::BoxFuture;

/// Error returned when connecting to a unix socket fails.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UnixConnectionError {
    /// The address is not a unix socket path.
    #[error("no unix socket path in address {0}")]
    NoAddress(Address),

    /// Connecting to the socket failed.
    #[error("unix connect to {path}")]
    Connect {
        /// The socket path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Transport which connects to a unix domain socket.
#[derive(Debug, Clone, Default)]
pub struct UnixTransport {
    _priv: (),
}

impl UnixTransport {
    /// Create a new unix socket transport.
    pub fn new() -> Self {
        Self::default()
    }
}

impl tower::Service<Address> for UnixTransport {
    type Response = UnixStream;
    type Error = UnixConnectionError;
    type Future = BoxFuture<'static, Result<UnixStream, UnixConnectionError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Address) -> Self::Future {
        let path = match req {
            Address::Unix(path) => path,
            address => {
                return Box::pin(std::future::ready(Err(UnixConnectionError::NoAddress(
                    address,
                ))))
            }
        };

        let span = tracing::trace_span!("unix", path = %path);
        Box::pin(
            async move {
                let stream = UnixStream::connect(&path)
                    .await
                    .map_err(|source| UnixConnectionError::Connect { path, source })?;
                trace!("unix connected");
                Ok(stream)
            }
            .instrument(span),
        )
    }
}
