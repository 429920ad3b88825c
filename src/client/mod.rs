//! RESP client library.
//!
//! There are two levels of available APIs in this library:
//!
//! 1. The [`Factory`] API, which parses a target, connects a transport, runs the `AUTH` and
//!    `SELECT` handshake under a timeout and hands back a ready [`Client`]. [`connect`] uses a
//!    default factory.
//! 2. The [connection][self::conn] API, which turns any stream into a [`Client`] and a
//!    [`Connection`][conn::Connection] driver, with no handshake. This is useful for custom
//!    transports or for tests.
//!

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use self::conn::Message;
use crate::resp::{Command, Value};

mod builder;
pub mod conn;
mod connect;
mod error;

pub use self::builder::Builder;
pub use self::connect::{CancelHandle, Connecting, ConnectionState, Factory};
pub use self::error::{Error, ServerError};

/// Default connection timeout in seconds, used when the target has no `timeout` parameter.
pub const DEFAULT_TIMEOUT: f64 = 60.0;

/// Connect to `target` with the default [`Factory`].
///
/// Plain TCP and unix targets are supported. `rediss://` targets need a factory
/// built with TLS, see [`Builder::with_tls`].
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), respdriver::client::Error> {
/// let client = respdriver::connect("redis://:secret@localhost/2").await?;
/// client.send(["PING"]).await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect(target: &str) -> Result<Client, Error> {
    Factory::new().connect(target).await
}

#[cfg(feature = "tls")]
/// Get a default TLS client configuration by loading the platform's native certificates.
///
/// Uses the crypto provider selected by the `tls-aws-lc` or `tls-ring`
/// feature, or the process default provider otherwise.
pub fn default_tls_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!("error loading platform certificates: {error}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!(added, ignored, "loaded platform certificates");

    #[cfg(feature = "tls-aws-lc")]
    let builder = rustls::ClientConfig::builder_with_provider(std::sync::Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?;

    #[cfg(all(feature = "tls-ring", not(feature = "tls-aws-lc")))]
    let builder = rustls::ClientConfig::builder_with_provider(std::sync::Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?;

    #[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
    let builder = rustls::ClientConfig::builder();

    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// A handle for sending commands over a connection.
///
/// Cloning a client is cheap, and every clone shares the same connection. Commands
/// from all clones are written in the order [`send`][Client::send] was called, and
/// each reply goes to the command it answers.
#[derive(Clone)]
pub struct Client {
    requests: mpsc::UnboundedSender<Message>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    pub(crate) fn new(requests: mpsc::UnboundedSender<Message>) -> Self {
        Self { requests }
    }

    /// Queue a command and return a future for its reply.
    ///
    /// The command is queued immediately, before the future is polled, so
    /// commands keep the order of `send` calls even if their futures are
    /// awaited in a different order. Dropping the future discards the reply.
    ///
    /// An error reply resolves as [`Error::Server`]. If the connection closes
    /// first, the future resolves with the error that closed it.
    pub fn send(&self, command: impl Into<Command>) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let message = Message::Request {
            command: command.into(),
            reply: tx,
        };

        match self.requests.send(message) {
            Ok(()) => ResponseFuture {
                inner: Some(rx),
            },
            Err(_) => ResponseFuture { inner: None },
        }
    }

    /// Close the connection.
    ///
    /// Commands already written but not yet answered fail with
    /// [`Error::ConnectionClosed`], and later [`send`][Client::send] calls fail
    /// immediately. This affects every clone of this client.
    pub fn close(&self) {
        let _ = self.requests.send(Message::Close);
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

/// Future returned by [`Client::send`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    inner: Option<oneshot::Receiver<Result<Value, Error>>>,
}

impl Future for ResponseFuture {
    type Output = Result<Value, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.inner.as_mut() else {
            return Poll::Ready(Err(Error::ConnectionClosed));
        };

        Pin::new(rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::ConnectionClosed)))
    }
}
