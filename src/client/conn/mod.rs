//! Client connection types.
//!
//! A client connection is composed of a transport and a pipeline.
//!
//! ## Transport
//!
//! The transport is responsible for establishing a connection to a server and shuffling bytes back
//! and forth. Transports implement the [`Transport`] trait, effectively making them a service which
//! accepts an [`Address`][crate::target::Address] and returns a bidirectional stream.
//!
//! ## Pipeline
//!
//! [`handshake`] splits a stream into a [`Client`], which queues commands, and a [`Connection`],
//! a future which owns the stream. The connection writes queued commands in order and resolves
//! each one with the next reply read from the stream. Replies carry no identifiers, so the
//! order in which commands were written is the only thing matching them up.
//!
//! The [`Connection`] must be polled for anything to happen, usually by spawning it:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use respdriver::client::conn;
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:6379").await?;
//! let (client, connection) = conn::handshake(stream);
//! tokio::spawn(connection);
//!
//! let reply = client.send(["PING"]).await?;
//! assert_eq!(reply.as_bytes(), Some(&b"PONG"[..]));
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_core::Stream as _;
use futures_util::Sink;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::client::{Client, Error, ServerError};
use crate::resp::{Command, ProtocolError, RespCodec, Value};

pub mod stream;
pub mod transport;

pub use self::stream::Stream;
pub use self::transport::{StreamTransport, Transport};

pub(crate) type ReplySender = oneshot::Sender<Result<Value, Error>>;

/// Messages from [`Client`] handles to their [`Connection`].
#[derive(Debug)]
pub(crate) enum Message {
    Request { command: Command, reply: ReplySender },
    Close,
}

/// Split a stream into a [`Client`] handle and the [`Connection`] driving it.
pub fn handshake<IO>(io: IO) -> (Client, Connection<IO>)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Connection {
        framed: Framed::new(io, RespCodec::new()),
        requests: rx,
        pending: VecDeque::new(),
        state: State::Open,
        handles_dropped: false,
    };
    (Client::new(tx), connection)
}

#[derive(Debug)]
enum State {
    Open,
    Closing(Option<Error>),
    Closed,
}

/// The driver for a pipelined connection.
///
/// Resolves once the stream is closed, either because every [`Client`] was
/// dropped and all replies were received, because [`Client::close`] was
/// called, or because the stream failed. The error, if any, is the one that
/// ended the connection; every request still waiting has already been failed.
pub struct Connection<IO> {
    framed: Framed<IO, RespCodec>,
    requests: mpsc::UnboundedReceiver<Message>,
    pending: VecDeque<ReplySender>,
    state: State,
    handles_dropped: bool,
}

impl<IO> fmt::Debug for Connection<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("pending", &self.pending.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<IO> Connection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Number of requests written and still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether the connection has started closing.
    pub fn is_closing(&self) -> bool {
        !matches!(self.state, State::Open)
    }

    /// Begin closing the connection.
    ///
    /// Every request still waiting fails with [`Error::ConnectionClosed`] and
    /// no new requests are accepted. The stream is shut down the next time the
    /// connection is polled.
    pub fn start_close(&mut self) {
        self.fail(Error::ConnectionClosed, None);
    }

    /// Fail everything outstanding with `error` and move to closing.
    ///
    /// `result` is what the connection future resolves with.
    fn fail(&mut self, error: Error, result: Option<Error>) {
        if !matches!(self.state, State::Open) {
            return;
        }

        if !self.pending.is_empty() {
            trace!(pending = self.pending.len(), %error, "failing pending requests");
        }
        for reply in self.pending.drain(..) {
            let _ = reply.send(Err(error.duplicate()));
        }

        self.requests.close();
        while let Ok(message) = self.requests.try_recv() {
            if let Message::Request { reply, .. } = message {
                let _ = reply.send(Err(error.duplicate()));
            }
        }

        self.state = State::Closing(result);
    }

    /// Fail with an error which also ends the connection future.
    fn fail_fatal(&mut self, error: Error) {
        let duplicate = error.duplicate();
        self.fail(duplicate, Some(error));
    }

    /// Move queued requests into the write buffer, then flush it.
    fn poll_write(&mut self, cx: &mut Context<'_>) -> Result<(), Error> {
        loop {
            match Sink::<Command>::poll_ready(Pin::new(&mut self.framed), cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(error)) => return Err(error.into()),
                Poll::Pending => break,
            }

            match self.requests.poll_recv(cx) {
                Poll::Ready(Some(Message::Request { command, reply })) => {
                    trace!(command = %CommandName(&command), "send");
                    Pin::new(&mut self.framed).start_send(command)?;
                    self.pending.push_back(reply);
                }
                Poll::Ready(Some(Message::Close)) => {
                    debug!("connection closed by client");
                    self.start_close();
                    return Ok(());
                }
                Poll::Ready(None) => {
                    self.handles_dropped = true;
                    break;
                }
                Poll::Pending => break,
            }
        }

        match Sink::<Command>::poll_flush(Pin::new(&mut self.framed), cx) {
            Poll::Ready(Err(error)) => Err(error.into()),
            _ => Ok(()),
        }
    }

    /// Resolve pending requests with every complete reply available.
    fn poll_read(&mut self, cx: &mut Context<'_>) -> Result<(), Error> {
        loop {
            match Pin::new(&mut self.framed).poll_next(cx) {
                Poll::Ready(Some(Ok(value))) => {
                    let Some(reply) = self.pending.pop_front() else {
                        return Err(ProtocolError::Unsolicited.into());
                    };

                    let result = match value {
                        Value::Error(message) => Err(Error::Server(ServerError::new(message))),
                        value => Ok(value),
                    };

                    // The caller may have stopped waiting; the reply is consumed either way.
                    let _ = reply.send(result);
                }
                Poll::Ready(Some(Err(error))) => return Err(error.into()),
                Poll::Ready(None) => {
                    debug!("connection closed by server");
                    self.fail(Error::ConnectionClosed, None);
                    return Ok(());
                }
                Poll::Pending => return Ok(()),
            }
        }
    }
}

impl<IO> Future for Connection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if matches!(this.state, State::Open) {
            if let Err(error) = this.poll_write(cx) {
                this.fail_fatal(error);
            }
        }

        if matches!(this.state, State::Open) {
            if let Err(error) = this.poll_read(cx) {
                this.fail_fatal(error);
            }
        }

        if matches!(this.state, State::Open) && this.handles_dropped && this.pending.is_empty() {
            trace!("all clients dropped");
            this.fail(Error::ConnectionClosed, None);
        }

        match this.state {
            State::Open => Poll::Pending,
            State::Closing(_) => {
                // Shutdown errors don't matter, the stream is going away.
                if let Err(error) = ready!(Sink::<Command>::poll_close(Pin::new(&mut this.framed), cx)) {
                    trace!(%error, "error shutting down stream");
                }

                let result = match std::mem::replace(&mut this.state, State::Closed) {
                    State::Closing(Some(error)) => Err(error),
                    _ => Ok(()),
                };
                trace!("connection closed");
                Poll::Ready(result)
            }
            State::Closed => Poll::Ready(Ok(())),
        }
    }
}

struct CommandName<'c>(&'c Command);

impl fmt::Display for CommandName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.name() {
            Some(name) => f.write_str(&String::from_utf8_lossy(name)),
            None => f.write_str("<empty>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::poll;
    use static_assertions::assert_impl_all;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    use super::*;

    assert_impl_all!(Connection<DuplexStream>: Future, Send, Unpin);
    assert_impl_all!(Client: Send, Sync, Clone);

    async fn read_exactly(server: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    #[tokio::test]
    async fn replies_resolve_in_order() {
        let _ = tracing_subscriber::fmt::try_init();

        let (io, mut server) = tokio::io::duplex(1024);
        let (client, connection) = handshake(io);
        let driver = tokio::spawn(connection);

        let first = client.send(["GET", "a"]);
        let second = client.send(["GET", "b"]);
        let third = client.send(["INCR", "c"]);

        read_exactly(
            &mut server,
            b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n*2\r\n$3\r\nGET\r\n$1\r\nb\r\n*2\r\n$4\r\nINCR\r\n$1\r\nc\r\n",
        )
        .await;

        // Split across writes to exercise partial decoding.
        server.write_all(b"$1\r\nA\r\n$-1\r\n:").await.unwrap();
        server.write_all(b"3\r\n").await.unwrap();

        assert_eq!(first.await.unwrap(), Value::Bulk(Some(Bytes::from_static(b"A"))));
        assert_eq!(second.await.unwrap(), Value::NIL);
        assert_eq!(third.await.unwrap(), Value::Integer(3));

        drop(client);
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn error_reply_fails_only_its_request() {
        let (io, mut server) = tokio::io::duplex(1024);
        let (client, connection) = handshake(io);
        tokio::spawn(connection);

        let failing = client.send(["LPOP", "string"]);
        let ok = client.send(["PING"]);

        server
            .write_all(b"-WRONGTYPE Operation against a key\r\n+PONG\r\n")
            .await
            .unwrap();

        match failing.await {
            Err(Error::Server(error)) => {
                assert_eq!(error.message(), "WRONGTYPE Operation against a key")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ok.await.unwrap(), Value::Status("PONG".into()));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn eof_fails_remaining_requests() {
        let (io, mut server) = tokio::io::duplex(1024);
        let (client, connection) = handshake(io);
        let driver = tokio::spawn(connection);

        let answered = client.send(["PING"]);
        let dropped = client.send(["PING"]);
        let also_dropped = client.send(["PING"]);

        server.write_all(b"+PONG\r\n").await.unwrap();
        assert!(answered.await.is_ok());
        drop(server);

        assert!(matches!(dropped.await, Err(Error::ConnectionClosed)));
        assert!(matches!(also_dropped.await, Err(Error::ConnectionClosed)));
        driver.await.unwrap().unwrap();

        assert!(client.is_closed());
        assert!(matches!(
            client.send(["PING"]).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn protocol_error_is_fatal() {
        let (io, mut server) = tokio::io::duplex(1024);
        let (client, connection) = handshake(io);
        let driver = tokio::spawn(connection);

        let first = client.send(["PING"]);
        let second = client.send(["PING"]);
        server.write_all(b"!bogus\r\n").await.unwrap();

        assert!(matches!(
            first.await,
            Err(Error::Protocol(ProtocolError::InvalidType(b'!')))
        ));
        assert!(matches!(
            second.await,
            Err(Error::Protocol(ProtocolError::InvalidType(b'!')))
        ));
        assert!(matches!(
            driver.await.unwrap(),
            Err(Error::Protocol(ProtocolError::InvalidType(b'!')))
        ));

        // The stream was shut down.
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn unsolicited_reply_is_fatal() {
        let (io, mut server) = tokio::io::duplex(1024);
        let (_client, connection) = handshake(io);
        let driver = tokio::spawn(connection);

        server.write_all(b"+OK\r\n").await.unwrap();
        assert!(matches!(
            driver.await.unwrap(),
            Err(Error::Protocol(ProtocolError::Unsolicited))
        ));
    }

    #[tokio::test]
    async fn close_fails_pending_and_shuts_down() {
        let (io, mut server) = tokio::io::duplex(1024);
        let (client, connection) = handshake(io);
        let driver = tokio::spawn(connection);

        let waiting = client.send(["BLPOP", "queue", "0"]);
        read_exactly(&mut server, b"*3\r\n$5\r\nBLPOP\r\n$5\r\nqueue\r\n$1\r\n0\r\n").await;

        client.close();
        assert!(matches!(waiting.await, Err(Error::ConnectionClosed)));
        driver.await.unwrap().unwrap();

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn dropped_handles_drain_replies_first() {
        let (io, mut server) = tokio::io::duplex(1024);
        let (client, mut connection) = handshake(io);

        let reply = client.send(["PING"]);
        drop(client);

        assert!(poll!(&mut connection).is_pending());
        assert_eq!(connection.pending(), 1);
        assert!(!connection.is_closing());

        server.write_all(b"+PONG\r\n").await.unwrap();
        connection.await.unwrap();
        assert_eq!(reply.await.unwrap(), Value::Status("PONG".into()));
    }

    #[tokio::test]
    async fn dropped_response_future_keeps_order() {
        let (io, mut server) = tokio::io::duplex(1024);
        let (client, connection) = handshake(io);
        tokio::spawn(connection);

        drop(client.send(["GET", "ignored"]));
        let kept = client.send(["GET", "kept"]);

        server.write_all(b"$1\r\n1\r\n$1\r\n2\r\n").await.unwrap();
        assert_eq!(kept.await.unwrap(), Value::Bulk(Some(Bytes::from_static(b"2"))));
    }

    #[tokio::test]
    async fn start_close_then_poll() {
        let (io, _server) = tokio::io::duplex(1024);
        let (client, mut connection) = handshake(io);
        let reply = client.send(["PING"]);

        connection.start_close();
        assert!(connection.is_closing());
        tokio::time::timeout(Duration::from_secs(1), &mut connection)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(reply.await, Err(Error::ConnectionClosed)));
        // Polling again after completion stays ready.
        assert!(matches!(poll!(&mut connection), Poll::Ready(Ok(()))));
    }
}
