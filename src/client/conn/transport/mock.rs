//! A transport backed by in-memory streams, suitable for testing behavior of transport-dependent code.
//!
//! Every connection made through a [`MockTransport`] is recorded, and the
//! server side of each stream is handed to the test through [`MockServer`].

use std::collections::VecDeque;
use std::future::{ready, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::DuplexStream;

use crate::target::Address;
use crate::BoxFuture;

const BUFFER_SIZE: usize = 64 * 1024;

/// An error that can occur when connecting with a mock transport.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection error")]
pub struct MockConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportMode {
    Duplex,
    Pending,
    ConnectionError,
}

#[derive(Debug, Default)]
struct Recorder {
    addresses: Vec<Address>,
    servers: VecDeque<DuplexStream>,
    cancelled: usize,
}

/// A mock transport that can be used to test connection behavior.
#[derive(Debug, Clone)]
pub struct MockTransport {
    mode: TransportMode,
    recorder: Arc<Mutex<Recorder>>,
}

impl MockTransport {
    fn new(mode: TransportMode) -> (Self, MockServer) {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        (
            Self {
                mode,
                recorder: recorder.clone(),
            },
            MockServer { recorder },
        )
    }

    /// Transport which connects immediately to an in-memory stream.
    pub fn duplex() -> (Self, MockServer) {
        Self::new(TransportMode::Duplex)
    }

    /// Transport whose connection attempts never finish.
    pub fn pending() -> (Self, MockServer) {
        Self::new(TransportMode::Pending)
    }

    /// Transport which returns an error during connection attempts.
    pub fn error() -> Self {
        Self::new(TransportMode::ConnectionError).0
    }
}

impl tower::Service<Address> for MockTransport {
    type Response = DuplexStream;
    type Error = MockConnectionError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Address) -> Self::Future {
        let mut recorder = self.recorder.lock();
        recorder.addresses.push(req);

        match self.mode {
            TransportMode::Duplex => {
                let (client, server) = tokio::io::duplex(BUFFER_SIZE);
                recorder.servers.push_back(server);
                Box::pin(ready(Ok(client)))
            }
            TransportMode::Pending => Box::pin(PendingConnect {
                recorder: self.recorder.clone(),
            }),
            TransportMode::ConnectionError => Box::pin(ready(Err(MockConnectionError))),
        }
    }
}

/// Connection attempt which never completes and records when it is dropped.
struct PendingConnect {
    recorder: Arc<Mutex<Recorder>>,
}

impl Future for PendingConnect {
    type Output = Result<DuplexStream, MockConnectionError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Pending
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        self.recorder.lock().cancelled += 1;
    }
}

/// The test's view of a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockServer {
    recorder: Arc<Mutex<Recorder>>,
}

impl MockServer {
    /// Addresses the transport was asked to connect to, oldest first.
    pub fn addresses(&self) -> Vec<Address> {
        self.recorder.lock().addresses.clone()
    }

    /// Take the server side of the oldest unclaimed connection.
    pub fn next_server(&self) -> Option<DuplexStream> {
        self.recorder.lock().servers.pop_front()
    }

    /// Number of pending connection attempts which were dropped before completing.
    pub fn cancelled(&self) -> usize {
        self.recorder.lock().cancelled
    }
}
