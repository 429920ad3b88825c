//! Respdriver
//!
//! An asynchronous client for servers speaking RESP, the length-prefixed
//! request/reply protocol used by Redis and its relatives.
//!
//! The library is layered the same way a connection is built:
//!
//! 1. A [`Target`] describes where to connect and how to prepare the connection
//!    (credential, database, timeout). It is parsed from strings like
//!    `redis://:secret@localhost:6379/2`.
//! 2. A [transport][client::conn::Transport] turns the target's address into a
//!    byte stream: TCP, TLS or a unix socket, or anything else implementing
//!    [`tower::Service`].
//! 3. The [RESP codec][resp] frames commands and replies on that stream, and the
//!    [connection][client::conn::Connection] correlates each reply with the
//!    command that produced it.
//! 4. A [`Factory`][client::Factory] runs all of this, including the optional
//!    `AUTH` and `SELECT` handshake, under a timeout, and hands back a ready
//!    [`Client`].
//!
//! # Example
//! ```no_run
//! # async fn run() -> Result<(), respdriver::client::Error> {
//! let client = respdriver::connect("redis://localhost:6379/0").await?;
//! let reply = client.send(["SET", "greeting", "hello"]).await?;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::future::Future;
use std::pin::Pin;

pub mod client;
pub use client::{connect, Client};
pub mod resp;
pub mod rt;
pub mod target;
pub use target::Target;

/// Boxed error type used at transport seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
