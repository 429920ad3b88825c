//! Transport streams for connecting to servers.
//!
//! Transports are responsible for establishing a connection to a server and
//! shuffling bytes back and forth. They know nothing about RESP: a transport
//! takes an [`Address`] and produces a bidirectional byte stream.
//!
//! Any [`tower::Service<Address>`] which returns an [`AsyncRead`] +
//! [`AsyncWrite`] stream is a [`Transport`]. The builtin ones are:
//!
//! - [`TcpTransport`][tcp::TcpTransport] for `host:port` addresses,
//! - [`TlsTransport`][tls::TlsTransport] wrapping another transport for
//!   `tls://host:port` addresses (feature `tls`),
//! - [`UnixTransport`][unix::UnixTransport] for `unix:///path` addresses,
//! - [`StreamTransport`], which picks one of the above per address and is what
//!   the default [`Factory`][crate::client::Factory] uses.

use std::future::Future;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tower::Service;

use crate::target::Address;
use crate::BoxFuture;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;
#[cfg(target_family = "unix")]
pub mod unix;

use super::stream::Stream;
use self::tcp::{TcpConnectionError, TcpTransport, TcpTransportConfig};
#[cfg(feature = "tls")]
use self::tls::{TlsConnectionError, TlsTransport};
#[cfg(target_family = "unix")]
use self::unix::{UnixConnectionError, UnixTransport};

/// A transport provides data transmission between the client and a server.
pub trait Transport: Clone + Send {
    /// The type of IO stream used by this transport
    type IO: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Error returned when connection fails
    type Error: std::error::Error + Send + Sync + 'static;

    /// The future type returned by this service
    type Future: Future<Output = Result<Self::IO, <Self as Transport>::Error>> + Send + 'static;

    /// Connect to a server and return a stream.
    fn connect(&mut self, address: Address) -> <Self as Transport>::Future;

    /// Poll the transport to see if it is ready to accept a new connection.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), <Self as Transport>::Error>>;
}

impl<T, IO> Transport for T
where
    T: Service<Address, Response = IO>,
    T: Clone + Send + Sync + 'static,
    T::Error: std::error::Error + Send + Sync + 'static,
    T::Future: Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type IO = IO;
    type Error = T::Error;
    type Future = T::Future;

    fn connect(&mut self, address: Address) -> <Self as Service<Address>>::Future {
        self.call(address)
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), <Self as Transport>::Error>> {
        Service::poll_ready(self, cx)
    }
}

/// Error returned by [`StreamTransport`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamConnectionError {
    /// TCP connection failed.
    #[error(transparent)]
    Tcp(#[from] TcpConnectionError),

    /// TLS connection failed.
    #[cfg(feature = "tls")]
    #[error(transparent)]
    Tls(#[from] TlsConnectionError<TcpConnectionError>),

    /// Unix socket connection failed.
    #[cfg(target_family = "unix")]
    #[error(transparent)]
    Unix(#[from] UnixConnectionError),

    /// The address needs a transport which isn't available in this build.
    #[error("no transport available for {0}")]
    Unsupported(Address),
}

/// The default transport, which connects to any kind of [`Address`].
///
/// TLS addresses need the `tls` feature and a TLS configuration, see
/// [`StreamTransport::with_tls`].
#[derive(Debug, Clone, Default)]
pub struct StreamTransport {
    tcp: TcpTransport,
    #[cfg(feature = "tls")]
    tls: Option<TlsTransport<TcpTransport>>,
    #[cfg(target_family = "unix")]
    unix: UnixTransport,
}

impl StreamTransport {
    /// Create a transport with the given TCP configuration and no TLS support.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            tcp: TcpTransport::new(config),
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(target_family = "unix")]
            unix: UnixTransport::new(),
        }
    }

    /// Enable `rediss://` targets using this TLS configuration.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: std::sync::Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(TlsTransport::new(self.tcp.clone(), config));
        self
    }

    /// Replace the TCP configuration, keeping TLS support if it was enabled.
    pub fn with_tcp_config(mut self, config: TcpTransportConfig) -> Self {
        self.tcp = TcpTransport::new(config);
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.take() {
            self.tls = Some(TlsTransport::new(self.tcp.clone(), tls.config().clone()));
        }
        self
    }

    /// Whether `rediss://` targets can be connected.
    pub fn has_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    /// The TCP configuration in use.
    pub fn tcp_config(&self) -> &TcpTransportConfig {
        self.tcp.config()
    }
}

impl Service<Address> for StreamTransport {
    type Response = Stream;
    type Error = StreamConnectionError;
    type Future = BoxFuture<'static, Result<Stream, StreamConnectionError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, address: Address) -> Self::Future {
        match address {
            Address::Tcp { .. } => {
                let future = self.tcp.call(address);
                Box::pin(async move { Ok(Stream::Tcp(future.await?)) })
            }

            #[cfg(feature = "tls")]
            Address::Tls { .. } => match self.tls.as_mut() {
                Some(tls) => {
                    let future = tls.call(address);
                    Box::pin(async move { Ok(Stream::Tls(Box::new(future.await?))) })
                }
                None => Box::pin(std::future::ready(Err(StreamConnectionError::Unsupported(
                    address,
                )))),
            },

            #[cfg(target_family = "unix")]
            Address::Unix(_) => {
                let future = self.unix.call(address);
                Box::pin(async move { Ok(Stream::Unix(future.await?)) })
            }

            #[allow(unreachable_patterns)]
            address => Box::pin(std::future::ready(Err(StreamConnectionError::Unsupported(
                address,
            )))),
        }
    }
}
