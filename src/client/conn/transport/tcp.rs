//! TCP transport implementation for client connections.
//!
//! This module contains the [`TcpTransport`] type, which is a [`tower::Service`] that connects to
//! [`Address::Tcp`] addresses. It also contains the [`TcpTransportConfig`] type, which is used to
//! configure TCP connections.
//!
//! Normally, you will not need to use this module directly. The default
//! [`StreamTransport`][super::StreamTransport] uses [`TcpTransport`] internally.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn, Instrument};

use crate::target::Address;
use crate::BoxFuture;

/// A TCP connector for client connections.
///
/// Host names are resolved with the system resolver, and each resolved address
/// is tried in turn until one accepts the connection.
///
/// `Address::Tls` is accepted as well and connects to the same host and port
/// without TLS, which is what a TLS wrapper needs underneath.
///
/// # Example
/// ```no_run
/// # use respdriver::client::conn::transport::tcp::TcpTransport;
/// # use respdriver::target::Address;
/// # use tower::ServiceExt as _;
/// # async fn run() {
/// let transport = TcpTransport::default();
/// let address = Address::Tcp { host: "localhost".into(), port: 6379 };
/// let stream = transport.oneshot(address).await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
}

impl TcpTransport {
    /// Create a TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

impl tower::Service<Address> for TcpTransport {
    type Response = TcpStream;
    type Error = TcpConnectionError;
    type Future = BoxFuture<'static, Result<TcpStream, TcpConnectionError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Address) -> Self::Future {
        let (host, port) = match get_host_and_port(&req) {
            Ok((host, port)) => (host, port),
            Err(e) => return Box::pin(std::future::ready(Err(e))),
        };

        let config = self.config.clone();
        let span = tracing::trace_span!("tcp", host = %host, port = %port);

        Box::pin(
            async move {
                let stream = connect_host(&host, port, &config).await?;

                if let Ok(peer_addr) = stream.peer_addr() {
                    trace!(peer.addr = %peer_addr, "tcp connected");
                } else {
                    trace!("tcp connected");
                }

                Ok(stream)
            }
            .instrument(span),
        )
    }
}

/// Resolve `host` and try each address in order.
async fn connect_host(
    host: &str,
    port: u16,
    config: &TcpTransportConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(TcpConnectionError::msg("dns resolution"))?
        .collect();
    trace!(count = addrs.len(), "resolved addresses");

    let mut last_error = None;
    for addr in addrs {
        match connect(&addr, config.connect_timeout, config) {
            Ok(connecting) => match connecting.await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    trace!(%addr, %error, "connection attempt failed");
                    last_error = Some(error);
                }
            },
            Err(error) => last_error = Some(error),
        }
    }

    Err(last_error.unwrap_or_else(|| TcpConnectionError::new("Exhausted connection candidates")))
}

/// Error type for TCP connections.
#[derive(Debug, Error)]
pub struct TcpConnectionError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TcpConnectionError {
    pub(super) fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub(super) fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }

    /// The kind of the underlying I/O error, if there is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        self.source
            .as_ref()
            .and_then(|source| source.downcast_ref::<io::Error>())
            .map(io::Error::kind)
    }
}

impl fmt::Display for TcpConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// The timeout for a single connection attempt.
    pub connect_timeout: Option<Duration>,

    /// Idle time before keep-alive probes are sent.
    pub keep_alive_timeout: Option<Duration>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            local_address_ipv4: None,
            local_address_ipv6: None,
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

fn get_host_and_port(address: &Address) -> Result<(String, u16), TcpConnectionError> {
    match address {
        Address::Tcp { host, port } | Address::Tls { host, port } => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(TcpConnectionError::new("missing host"));
            }
            Ok((host.to_owned(), *port))
        }
        Address::Unix(path) => Err(TcpConnectionError::new(format!(
            "cannot connect to unix socket {path} over tcp"
        ))),
    }
}

fn bind_local_address(
    socket: &socket2::Socket,
    dst_addr: &SocketAddr,
    local_addr_ipv4: &Option<Ipv4Addr>,
    local_addr_ipv6: &Option<Ipv6Addr>,
) -> io::Result<()> {
    match (*dst_addr, local_addr_ipv4, local_addr_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        (SocketAddr::V6(_), _, Some(addr)) => {
            socket.bind(&SocketAddr::new((*addr).into(), 0).into())?;
        }
        _ => {}
    }

    Ok(())
}

#[tracing::instrument(skip(connect_timeout, config), level = "debug")]
fn connect(
    addr: &SocketAddr,
    connect_timeout: Option<Duration>,
    config: &TcpTransportConfig,
) -> Result<
    impl std::future::Future<Output = Result<TcpStream, TcpConnectionError>>,
    TcpConnectionError,
> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(TcpConnectionError::msg("tcp open error"))?;
    tracing::trace!("tcp socket opened");

    let guard = tracing::trace_span!("socket_options").entered();

    // Tokio expects O_NONBLOCK to already be set on sockets handed to it.
    socket
        .set_nonblocking(true)
        .map_err(TcpConnectionError::msg("tcp set_nonblocking error"))?;

    if let Some(dur) = config.keep_alive_timeout {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    if let Err(e) = socket.set_nodelay(config.nodelay) {
        warn!("tcp set_nodelay error: {}", e);
    }

    bind_local_address(
        &socket,
        addr,
        &config.local_address_ipv4,
        &config.local_address_ipv6,
    )
    .map_err(TcpConnectionError::msg("tcp bind local address"))?;

    let socket = TcpSocket::from_std_stream(std::net::TcpStream::from(socket));

    if config.reuse_address {
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("tcp set_reuse_address error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    drop(guard);

    let span = tracing::trace_span!("tcp", remote.addr = %addr);
    let connect = socket.connect(*addr).instrument(span);
    Ok(async move {
        match connect_timeout {
            Some(dur) => match tokio::time::timeout(dur, connect).await {
                Ok(Ok(s)) => Ok(s),
                Ok(Err(e)) => Err(e),
                Err(e) => {
                    tracing::trace!(timeout=?dur, "connection timed out");
                    Err(io::Error::new(io::ErrorKind::TimedOut, e))
                }
            },
            None => connect.await,
        }
        .map_err(TcpConnectionError::msg("tcp connect error"))
    })
}

#[cfg(test)]
mod test {
    use tokio::net::TcpListener;
    use tower::ServiceExt as _;

    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn test_get_host_and_port() {
        let address = Address::Tcp {
            host: "example.com".into(),
            port: 6379,
        };
        assert_eq!(
            get_host_and_port(&address).unwrap(),
            ("example.com".into(), 6379)
        );

        let address = Address::Tls {
            host: "[::1]".into(),
            port: 6380,
        };
        assert_eq!(get_host_and_port(&address).unwrap(), ("::1".into(), 6380));

        let address = Address::Unix(Utf8PathBuf::from("/tmp/redis.sock"));
        assert!(get_host_and_port(&address).is_err());
    }

    #[tokio::test]
    async fn test_tcp_transport() {
        let _ = tracing_subscriber::fmt::try_init();

        let bind = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = bind.local_addr().unwrap().port();

        let address = Address::Tcp {
            host: "127.0.0.1".into(),
            port,
        };

        let transport = TcpTransport::new(TcpTransportConfig::default());
        let (stream, accepted) =
            tokio::join!(transport.oneshot(address), async { bind.accept().await.unwrap() });

        let stream = stream.unwrap();
        assert_eq!(
            stream.peer_addr().unwrap(),
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
        );
        assert_eq!(stream.local_addr().unwrap(), accepted.1);
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        let _ = tracing_subscriber::fmt::try_init();

        let bind = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = bind.local_addr().unwrap().port();
        drop(bind);

        let address = Address::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let error = TcpTransport::default().oneshot(address).await.unwrap_err();
        assert_eq!(error.io_kind(), Some(io::ErrorKind::ConnectionRefused));
    }
}
