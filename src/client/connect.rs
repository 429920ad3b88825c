//! Connection factory.
//!
//! A [`Factory`] turns a target string into a ready [`Client`]:
//!
//! 1. parse the [`Target`],
//! 2. connect the transport to the target's address,
//! 3. send `auth <credential>` if the target has one,
//! 4. send `select <database>` if the target names one,
//! 5. spawn the connection and hand back the client.
//!
//! The whole attempt runs under one timeout and can be cancelled at any point
//! through a [`CancelHandle`]. Once the stream exists, every failure drops it,
//! closing the socket, before the error is returned.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace, Instrument};

use super::conn::{self, Connection, StreamTransport, Transport};
use super::{Builder, Client, Error, ResponseFuture};
use crate::resp::Command;
use crate::rt::{Sleep, Timer};
use crate::target::{Address, Target};

/// Stage of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Waiting for the transport to open a stream.
    Connecting,

    /// Waiting for the reply to `AUTH`.
    Authenticating,

    /// Waiting for the reply to `SELECT`.
    SelectingNamespace,

    /// The client has been handed back.
    Ready,

    /// The attempt failed or was cancelled. This is final.
    Closed,
}

/// Builds clients for targets, sharing a transport, timer and default timeout.
#[derive(Clone)]
pub struct Factory<T = StreamTransport> {
    transport: T,
    timer: Arc<dyn Timer>,
    default_timeout: f64,
}

impl<T: fmt::Debug> fmt::Debug for Factory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("transport", &self.transport)
            .field("timer", &self.timer)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Factory {
    /// A factory with the default transport, the tokio timer and a 60 second timeout.
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// Start building a factory.
    pub fn builder() -> Builder {
        Builder::new()
    }
}

impl Default for Factory {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Factory<T> {
    pub(super) fn from_parts(transport: T, timer: Arc<dyn Timer>, default_timeout: f64) -> Self {
        Self {
            transport,
            timer,
            default_timeout,
        }
    }

    /// Timeout in seconds for targets without a `timeout` parameter. Negative means none.
    pub fn default_timeout(&self) -> f64 {
        self.default_timeout
    }

    /// The transport used for new connections.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T> Factory<T>
where
    T: Transport,
{
    /// Start connecting to `target`.
    ///
    /// Nothing happens until the returned future is polled. An invalid target
    /// fails on the first poll, without touching the transport or the timer.
    pub fn connect(&self, target: &str) -> Connecting<T> {
        match Target::parse(target) {
            Ok(target) => self.connect_to(target),
            Err(error) => {
                debug!(%error, "invalid connection target");
                Connecting::failed(error.into())
            }
        }
    }

    /// Start connecting to an already parsed target.
    pub fn connect_to(&self, target: Target) -> Connecting<T> {
        let seconds = target.timeout().unwrap_or(self.default_timeout);
        let timer = (seconds >= 0.0).then(|| self.timer.clone());
        let span = tracing::debug_span!("connect", %target);

        Connecting::new(
            State::PollReady {
                transport: self.transport.clone(),
                address: Some(target.address().clone()),
            },
            Handshake {
                auth: target.auth().map(String::from),
                database: target.database().map(String::from),
            },
            timer,
            seconds,
            span,
        )
    }
}

/// Cancels a connection attempt from outside its future.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Cancel the attempt.
    ///
    /// An attempt still waiting on the transport drops the transport's
    /// connect future. An attempt in the handshake closes its stream. Either
    /// way it fails with [`Error::ConnectionCancelled`]. Cancelling an attempt
    /// which has already finished does nothing.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`cancel`][CancelHandle::cancel] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Auth,
    Select,
}

impl Step {
    fn failed(self, error: super::ServerError) -> Error {
        match self {
            Step::Auth => Error::AuthFailed(error),
            Step::Select => Error::SelectFailed(error),
        }
    }
}

#[derive(Debug)]
struct Handshake {
    auth: Option<String>,
    database: Option<String>,
}

impl Handshake {
    /// The command following `after`, or `None` once the handshake is done.
    fn next(&self, after: Option<Step>) -> Option<(Step, Command)> {
        if after.is_none() {
            if let Some(auth) = &self.auth {
                return Some((Step::Auth, Command::new("auth").arg(auth)));
            }
        }

        if after != Some(Step::Select) {
            if let Some(database) = &self.database {
                return Some((Step::Select, Command::new("select").arg(database)));
            }
        }

        None
    }
}

#[pin_project(project = StateProj, project_replace = StateOwned)]
enum State<T: Transport> {
    Failed {
        error: Option<Error>,
    },
    PollReady {
        transport: T,
        address: Option<Address>,
    },
    Connect {
        #[pin]
        future: T::Future,
    },
    Handshake {
        connection: Connection<T::IO>,
        client: Client,
        step: Step,
        reply: ResponseFuture,
    },
    Done {
        ready: bool,
    },
}

impl<T: Transport> State<T> {
    fn is_active(&self) -> bool {
        matches!(
            self,
            State::PollReady { .. } | State::Connect { .. } | State::Handshake { .. }
        )
    }

    fn connection_state(&self) -> ConnectionState {
        match self {
            State::PollReady { .. } | State::Connect { .. } => ConnectionState::Connecting,
            State::Handshake {
                step: Step::Auth, ..
            } => ConnectionState::Authenticating,
            State::Handshake {
                step: Step::Select,
                ..
            } => ConnectionState::SelectingNamespace,
            State::Done { ready: true } => ConnectionState::Ready,
            State::Failed { .. } | State::Done { ready: false } => ConnectionState::Closed,
        }
    }
}

impl<T: Transport> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Failed { error } => f.debug_struct("Failed").field("error", error).finish(),
            State::PollReady { address, .. } => f
                .debug_struct("PollReady")
                .field("address", address)
                .finish(),
            State::Connect { .. } => f.debug_tuple("Connect").finish(),
            State::Handshake { step, .. } => f.debug_struct("Handshake").field("step", step).finish(),
            State::Done { ready } => f.debug_struct("Done").field("ready", ready).finish(),
        }
    }
}

/// A connection attempt, resolving to a ready [`Client`].
///
/// Returned by [`Factory::connect`]. Dropping it abandons the attempt and
/// releases whatever it holds.
#[pin_project]
pub struct Connecting<T: Transport> {
    #[pin]
    state: State<T>,
    handshake: Handshake,
    timer: Option<Arc<dyn Timer>>,
    seconds: f64,
    sleep: Option<Pin<Box<dyn Sleep>>>,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    span: tracing::Span,
}

impl<T: Transport> fmt::Debug for Connecting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connecting")
            .field("state", &self.state)
            .field("timeout", &self.seconds)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Connecting<T> {
    fn new(
        state: State<T>,
        handshake: Handshake,
        timer: Option<Arc<dyn Timer>>,
        seconds: f64,
        span: tracing::Span,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            state,
            handshake,
            timer,
            seconds,
            sleep: None,
            token,
            cancelled,
            span,
        }
    }

    fn failed(error: Error) -> Self {
        Self::new(
            State::Failed { error: Some(error) },
            Handshake {
                auth: None,
                database: None,
            },
            None,
            -1.0,
            tracing::Span::none(),
        )
    }

    /// Current stage of the attempt.
    pub fn state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    /// A handle which cancels this attempt.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }
}

impl<T> Future for Connecting<T>
where
    T: Transport,
{
    type Output = Result<Client, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let _entered = this.span.enter();

        if let Some(timer) = this.timer.take() {
            if this.state.is_active() {
                match Duration::try_from_secs_f64(*this.seconds) {
                    Ok(duration) => {
                        trace!(?duration, "connection timer started");
                        *this.sleep = Some(timer.sleep(duration));
                    }
                    Err(_) => trace!(seconds = *this.seconds, "timeout too large, no timer"),
                }
            }
        }

        if this.state.is_active() && this.cancelled.as_mut().poll(cx).is_ready() {
            debug!("connection attempt cancelled");
            this.sleep.take();
            interrupt(this.state.as_mut(), Error::ConnectionCancelled);
        }

        if let Poll::Ready(result) = poll_state(this.state.as_mut(), this.handshake, cx) {
            this.sleep.take();
            return Poll::Ready(result);
        }

        if let Some(sleep) = this.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                debug!(seconds = *this.seconds, "connection attempt timed out");
                this.sleep.take();
                interrupt(
                    this.state.as_mut(),
                    Error::ConnectionTimedOut {
                        seconds: *this.seconds,
                    },
                );
                return poll_state(this.state.as_mut(), this.handshake, cx);
            }
        }

        Poll::Pending
    }
}

/// Abandon the current stage with `error`.
///
/// A pending transport connect is dropped. A stream in the handshake is
/// dropped too, which closes it without waiting on the peer.
fn interrupt<T: Transport>(mut state: Pin<&mut State<T>>, error: Error) {
    state.set(State::Failed { error: Some(error) });
}

fn poll_state<T: Transport>(
    mut state: Pin<&mut State<T>>,
    handshake: &Handshake,
    cx: &mut Context<'_>,
) -> Poll<Result<Client, Error>> {
    loop {
        match state.as_mut().project() {
            StateProj::Failed { error } => {
                let error = error.take().unwrap_or(Error::ConnectionClosed);
                state.set(State::Done { ready: false });
                return Poll::Ready(Err(error));
            }

            StateProj::PollReady { transport, address } => {
                if let Err(error) = ready!(transport.poll_ready(cx)) {
                    debug!(%error, "transport not ready");
                    state.set(State::Failed {
                        error: Some(Error::TransportConnectFailed(error.into())),
                    });
                    continue;
                }

                let Some(address) = address.take() else {
                    state.set(State::Done { ready: false });
                    return Poll::Ready(Err(Error::ConnectionClosed));
                };
                trace!(%address, "transport ready");
                let future = transport.connect(address);
                state.set(State::Connect { future });
            }

            StateProj::Connect { future } => match ready!(future.poll(cx)) {
                Ok(stream) => {
                    trace!("transport connected");
                    let (client, connection) = conn::handshake(stream);
                    if let Some(client) = advance(state.as_mut(), handshake, None, connection, client)
                    {
                        return Poll::Ready(Ok(client));
                    }
                }
                Err(error) => {
                    debug!(%error, "transport connection failed");
                    state.set(State::Failed {
                        error: Some(Error::TransportConnectFailed(error.into())),
                    });
                }
            },

            StateProj::Handshake {
                connection, reply, ..
            } => {
                let closed = Pin::new(&mut *connection).poll(cx).is_ready();
                let result = match Pin::new(reply).poll(cx) {
                    Poll::Ready(result) => result,
                    Poll::Pending if closed => Err(Error::ConnectionClosed),
                    Poll::Pending => return Poll::Pending,
                };

                let StateOwned::Handshake {
                    connection,
                    client,
                    step,
                    ..
                } = state.as_mut().project_replace(State::Done { ready: false })
                else {
                    unreachable!();
                };

                match result {
                    Ok(_) => {
                        trace!(?step, "handshake step complete");
                        if let Some(client) =
                            advance(state.as_mut(), handshake, Some(step), connection, client)
                        {
                            return Poll::Ready(Ok(client));
                        }
                    }
                    Err(error) => {
                        let error = match error {
                            Error::Server(error) => step.failed(error),
                            error => error,
                        };
                        debug!(?step, %error, "handshake failed, closing stream");
                        drop((connection, client));
                        state.set(State::Failed { error: Some(error) });
                    }
                }
            }

            StateProj::Done { .. } => return Poll::Ready(Err(Error::ConnectionClosed)),
        }
    }
}

/// Send the next handshake command, or finish and return the client.
fn advance<T: Transport>(
    mut state: Pin<&mut State<T>>,
    handshake: &Handshake,
    after: Option<Step>,
    connection: Connection<T::IO>,
    client: Client,
) -> Option<Client> {
    match handshake.next(after) {
        Some((step, command)) => {
            trace!(?step, "handshake step");
            let reply = client.send(command);
            state.set(State::Handshake {
                connection,
                client,
                step,
                reply,
            });
            None
        }
        None => {
            debug!("connection ready");
            tokio::spawn(
                async move {
                    if let Err(error) = connection.await {
                        debug!(%error, "connection error");
                    }
                }
                .instrument(tracing::Span::current()),
            );
            state.as_mut().set(State::Done { ready: true });
            Some(client)
        }
    }
}
