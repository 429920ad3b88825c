//! Test the respdriver client over unix domain sockets.
#![cfg(unix)]

use respdriver::client::Error;
use respdriver::resp::Value;

#[path = "../support/mod.rs"]
mod support;
use support::FakeServer;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const SOCKET: &str = "test-transport.sock";

#[tokio::test]
async fn handshake_over_unix_socket() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(SOCKET);
    let server = FakeServer::with_password("secret");
    server.listen_unix(&path);

    let target = format!("redis+unix://:secret@{}?db=3", path.display());
    let client = respdriver::connect(&target).await?;
    assert_eq!(client.send(["PING"]).await?, Value::Status("PONG".into()));

    assert_eq!(
        server.log(),
        vec![vec!["auth", "secret"], vec!["select", "3"], vec!["PING"]]
    );
    Ok(())
}

#[tokio::test]
async fn plain_unix_scheme() -> Result<(), BoxError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(SOCKET);
    let server = FakeServer::new();
    server.listen_unix(&path);

    let client = respdriver::connect(&format!("unix://{}", path.display())).await?;
    client.send(["SET", "a", "1"]).await?;
    assert_eq!(client.send(["INCR", "a"]).await?, Value::Integer(2));
    Ok(())
}

#[tokio::test]
async fn missing_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nothing-here.sock");

    let error = respdriver::connect(&format!("unix://{}", path.display()))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::TransportConnectFailed(_)));
}

#[tokio::test]
async fn relative_socket_path() {
    let error = respdriver::connect("unix://relative.sock").await.unwrap_err();
    assert!(matches!(error, Error::InvalidTarget(_)));
}
