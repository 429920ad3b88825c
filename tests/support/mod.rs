//! An in-process RESP server for integration tests.
//!
//! Understands just enough commands to exercise the client: `AUTH`, `SELECT`,
//! `PING`, `ECHO`, `GET`, `SET`, `INCR` and `QUIT`.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt as _;
use parking_lot::Mutex;
use respdriver::resp::{RespCodec, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio_util::codec::FramedRead;

const DATABASES: usize = 16;

#[derive(Debug, Default)]
struct Shared {
    password: Option<String>,
    silent: bool,
    log: Mutex<Vec<Vec<String>>>,
    data: Mutex<HashMap<(usize, Bytes), Bytes>>,
}

/// Fake server. Clones share configuration, data and the command log.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    shared: Arc<Shared>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `AUTH password` before any other command.
    pub fn with_password(password: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                password: Some(password.to_owned()),
                ..Default::default()
            }),
        }
    }

    /// A server which reads commands but never answers.
    pub fn silent() -> Self {
        Self {
            shared: Arc::new(Shared {
                silent: true,
                ..Default::default()
            }),
        }
    }

    /// Every command received so far, across all connections.
    pub fn log(&self) -> Vec<Vec<String>> {
        self.shared.log.lock().clone()
    }

    /// Accept TCP connections on an ephemeral localhost port.
    pub async fn listen_tcp(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(server.clone().serve(stream));
            }
        });
        addr
    }

    /// Accept unix socket connections at `path`.
    #[cfg(unix)]
    pub fn listen_unix(&self, path: &std::path::Path) {
        let listener = tokio::net::UnixListener::bind(path).unwrap();
        let server = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(server.clone().serve(stream));
            }
        });
    }

    /// Serve one connection until the client goes away.
    pub async fn serve<IO>(self, stream: IO)
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut commands = FramedRead::new(read, RespCodec::new());
        let mut session = Session {
            authenticated: self.shared.password.is_none(),
            database: 0,
        };

        while let Some(Ok(frame)) = commands.next().await {
            let Some(args) = arguments(&frame) else {
                return;
            };
            self.shared.log.lock().push(
                args.iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect(),
            );

            if self.shared.silent {
                continue;
            }

            let reply = self.execute(&mut session, &args);
            let mut out = Vec::new();
            encode(&reply, &mut out);
            if write.write_all(&out).await.is_err() {
                return;
            }

            if args[0].eq_ignore_ascii_case(b"quit") {
                let _ = write.shutdown().await;
                return;
            }
        }
    }

    fn execute(&self, session: &mut Session, args: &[Bytes]) -> Value {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_lowercase();

        if name == "auth" {
            return match (&self.shared.password, args.get(1)) {
                (None, _) => error("ERR Client sent AUTH, but no password is set"),
                (Some(password), Some(given)) if password.as_bytes() == &given[..] => {
                    session.authenticated = true;
                    ok()
                }
                _ => error("ERR invalid password"),
            };
        }

        if !session.authenticated {
            return error("NOAUTH Authentication required.");
        }

        match (name.as_str(), &args[1..]) {
            ("ping", []) => Value::Status("PONG".into()),
            ("echo", [message]) => Value::Bulk(Some(message.clone())),
            ("quit", []) => ok(),
            ("select", [index]) => {
                match std::str::from_utf8(index).ok().and_then(|i| i.parse::<usize>().ok()) {
                    Some(index) if index < DATABASES => {
                        session.database = index;
                        ok()
                    }
                    Some(_) => error("ERR DB index is out of range"),
                    None => error("ERR value is not an integer or out of range"),
                }
            }
            ("get", [key]) => Value::Bulk(
                self.shared
                    .data
                    .lock()
                    .get(&(session.database, key.clone()))
                    .cloned(),
            ),
            ("set", [key, value]) => {
                self.shared
                    .data
                    .lock()
                    .insert((session.database, key.clone()), value.clone());
                ok()
            }
            ("incr", [key]) => {
                let mut data = self.shared.data.lock();
                let entry = data
                    .entry((session.database, key.clone()))
                    .or_insert_with(|| Bytes::from_static(b"0"));
                match std::str::from_utf8(&entry[..]).ok().and_then(|n| n.parse::<i64>().ok()) {
                    Some(n) => {
                        *entry = Bytes::from((n + 1).to_string());
                        Value::Integer(n + 1)
                    }
                    None => error("ERR value is not an integer or out of range"),
                }
            }
            _ => error(&format!("ERR unknown command '{name}'")),
        }
    }
}

#[derive(Debug)]
struct Session {
    authenticated: bool,
    database: usize,
}

fn ok() -> Value {
    Value::Status("OK".into())
}

fn error(message: &str) -> Value {
    Value::Error(message.into())
}

fn arguments(frame: &Value) -> Option<Vec<Bytes>> {
    let items = frame.as_array()?;
    let args: Option<Vec<Bytes>> = items
        .iter()
        .map(|item| match item {
            Value::Bulk(Some(bytes)) => Some(bytes.clone()),
            _ => None,
        })
        .collect();
    args.filter(|args| !args.is_empty())
}

fn encode(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Status(status) => out.extend_from_slice(format!("+{status}\r\n").as_bytes()),
        Value::Error(message) => out.extend_from_slice(format!("-{message}\r\n").as_bytes()),
        Value::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
        Value::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        Value::Bulk(Some(bytes)) => {
            out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
        Value::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode(item, out);
            }
        }
    }
}
