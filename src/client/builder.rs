use std::fmt;
use std::sync::Arc;

#[cfg(feature = "tls")]
use rustls::ClientConfig;

use super::conn::transport::tcp::TcpTransportConfig;
use super::conn::{StreamTransport, Transport};
use super::{Factory, DEFAULT_TIMEOUT};
use crate::rt::{Timer, TokioTimer};

/// A builder for a connection [`Factory`].
///
/// ```
/// # use respdriver::client::Builder;
/// let factory = Builder::new().with_default_timeout(5.0).build();
/// assert_eq!(factory.default_timeout(), 5.0);
/// ```
pub struct Builder<T = StreamTransport> {
    transport: T,
    timer: Option<Arc<dyn Timer>>,
    default_timeout: f64,
}

impl<T: fmt::Debug> fmt::Debug for Builder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("transport", &self.transport)
            .field("timer", &self.timer)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Builder {
    /// Create a builder with the default transport, the tokio timer and a
    /// [`DEFAULT_TIMEOUT`] second timeout.
    pub fn new() -> Self {
        Self {
            transport: StreamTransport::default(),
            timer: None,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Builder<T> {
    /// Timeout in seconds for targets without a `timeout` parameter.
    ///
    /// A negative value disables the timeout.
    pub fn with_default_timeout(mut self, seconds: f64) -> Self {
        self.default_timeout = seconds;
        self
    }

    /// Use a custom timer for connection timeouts.
    pub fn with_timer(mut self, timer: impl Timer) -> Self {
        self.timer = Some(Arc::new(timer));
        self
    }

    /// Use a custom transport.
    ///
    /// Any [`tower::Service`] taking an [`Address`][crate::target::Address] and returning
    /// a stream will do.
    pub fn with_transport<T2>(self, transport: T2) -> Builder<T2>
    where
        T2: Transport,
    {
        Builder {
            transport,
            timer: self.timer,
            default_timeout: self.default_timeout,
        }
    }

    /// Get a mutable reference to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Build the factory.
    pub fn build(self) -> Factory<T> {
        let timer = self
            .timer
            .unwrap_or_else(|| Arc::new(TokioTimer::new()) as Arc<dyn Timer>);
        Factory::from_parts(self.transport, timer, self.default_timeout)
    }
}

impl Builder<StreamTransport> {
    /// Configure TCP connections.
    pub fn with_tcp_config(mut self, config: TcpTransportConfig) -> Self {
        self.transport = self.transport.with_tcp_config(config);
        self
    }

    /// Enable `rediss://` targets with this TLS configuration.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: ClientConfig) -> Self {
        self.transport = self.transport.with_tls(Arc::new(config));
        self
    }

    /// Enable `rediss://` targets, trusting the platform's native certificates.
    #[cfg(feature = "tls")]
    pub fn with_default_tls(self) -> Result<Self, rustls::Error> {
        let config = super::default_tls_config()?;
        Ok(self.with_tls(config))
    }
}
