//! TLS transport, wrapping another transport.
//!
//! [`TlsTransport`] connects the inner transport to the same host and port,
//! then runs a TLS handshake on top using the host for SNI and certificate
//! verification.

use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::ClientConfig as TlsClientConfig;
use thiserror::Error;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{trace, Instrument};

use super::Transport;
use crate::target::Address;
use crate::BoxFuture;

/// Error returned when a TLS connection fails.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsConnectionError<E> {
    /// The inner transport failed.
    #[error(transparent)]
    Connection(E),

    /// The TLS handshake failed.
    #[error("tls handshake")]
    Handshake(#[source] std::io::Error),

    /// The address has no host usable as a TLS server name.
    #[error("invalid tls server name in {0}")]
    NoDomain(Address),
}

/// Transport via TLS
#[derive(Debug, Clone)]
pub struct TlsTransport<T> {
    transport: T,
    config: Arc<TlsClientConfig>,
}

impl<T> TlsTransport<T> {
    /// Create a new `TlsTransport`
    pub fn new(transport: T, config: Arc<TlsClientConfig>) -> Self {
        Self { transport, config }
    }

    /// Returns the inner transport and the TLS configuration.
    pub fn into_parts(self) -> (T, Arc<TlsClientConfig>) {
        (self.transport, self.config)
    }

    /// Returns a reference to the inner transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns a reference to the TLS configuration.
    pub fn config(&self) -> &Arc<TlsClientConfig> {
        &self.config
    }
}

impl<T> tower::Service<Address> for TlsTransport<T>
where
    T: Transport,
{
    type Response = TlsStream<T::IO>;
    type Error = TlsConnectionError<T::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.transport
            .poll_ready(cx)
            .map_err(TlsConnectionError::Connection)
    }

    fn call(&mut self, req: Address) -> Self::Future {
        let (host, port) = match &req {
            Address::Tls { host, port } | Address::Tcp { host, port } => (host.clone(), *port),
            Address::Unix(_) => {
                return Box::pin(std::future::ready(Err(TlsConnectionError::NoDomain(req))))
            }
        };

        let domain = host.trim_start_matches('[').trim_end_matches(']').to_owned();
        let Ok(domain) = ServerName::try_from(domain) else {
            return Box::pin(std::future::ready(Err(TlsConnectionError::NoDomain(req))));
        };

        let connector = TlsConnector::from(self.config.clone());
        let future = self.transport.connect(Address::Tcp { host, port });
        let span = tracing::trace_span!("tls", %req);

        Box::pin(
            async move {
                let stream = future.await.map_err(TlsConnectionError::Connection)?;
                let stream = connector
                    .connect(domain, stream)
                    .await
                    .map_err(TlsConnectionError::Handshake)?;
                trace!("tls handshake complete");
                Ok(stream)
            }
            .instrument(span),
        )
    }
}
