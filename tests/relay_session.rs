//! End-to-end relay sessions against a mock upstream over real sockets:
//! the upstream must receive the publisher's connect command byte-identical
//! and in order, auth failures must leak nothing upstream, and the live
//! session count must return to zero.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use streamrelay::core::config::Config;
use streamrelay::relay::RelayServer;
use streamrelay::rtmp::amf::{self, Amf0Value};
use streamrelay::rtmp::{chunk, handshake, TYPE_AMF0_COMMAND};

/// Mock upstream: accept one connection, speak the RTMP server handshake,
/// optionally send `greeting`, then collect every byte until EOF.
async fn spawn_mock_upstream(
    handshake_expected: bool,
    greeting: Option<&'static [u8]>,
) -> (String, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        if handshake_expected {
            handshake::server_handshake(&mut socket).await.unwrap();
        }
        if let Some(greeting) = greeting {
            socket.write_all(greeting).await.unwrap();
        }

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        let _ = tx.send(received);
    });

    (addr, rx)
}

/// Start a relay on an ephemeral port in front of `upstream_addr`.
async fn spawn_relay(upstream_addr: &str, auth_token: Option<&str>) -> (String, Arc<RelayServer>) {
    let mut config = Config {
        upstream: format!("rtmp://{upstream_addr}/live"),
        ..Config::default()
    };
    config.read_buffer = 4 * 1024;
    config.write_buffer = 4 * 1024;
    if let Some(token) = auth_token {
        config.security.auth_enabled = true;
        config.security.auth_tokens = vec![token.to_string()];
    }

    let server = RelayServer::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    tokio::spawn(server.clone().run_with_listener(listener, cancel));

    (relay_addr, server)
}

/// Chunk-framed `connect` command with the given command-object fields.
async fn connect_command(fields: &[(&str, &str)]) -> Vec<u8> {
    let entries: Vec<(&str, Amf0Value)> = fields
        .iter()
        .map(|(k, v)| (*k, Amf0Value::String(v.to_string())))
        .collect();
    let payload = amf::encode_all(&[
        Amf0Value::String("connect".into()),
        Amf0Value::Number(1.0),
        amf::object(&entries),
    ]);
    // Must fit one chunk at the initial 128-byte chunk size, since it is
    // the first message on the wire.
    assert!(payload.len() <= 128, "connect payload too large for test");

    let mut framed = Vec::new();
    chunk::write_message(&mut framed, TYPE_AMF0_COMMAND, &payload)
        .await
        .unwrap();
    framed
}

async fn wait_for_zero_sessions(server: &RelayServer) {
    for _ in 0..50 {
        if server.tracker().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "sessions still live: {}",
        server.tracker().len()
    );
}

#[tokio::test]
async fn test_connect_payload_reaches_upstream_byte_identical() {
    let (upstream_addr, upstream_rx) = spawn_mock_upstream(true, Some(b"UPSTREAM-ACK")).await;
    let (relay_addr, server) =
        spawn_relay(&upstream_addr, Some("secret-token")).await;

    let mut client = TcpStream::connect(&relay_addr).await.unwrap();
    handshake::client_handshake(&mut client).await.unwrap();

    let connect = connect_command(&[("app", "live"), ("token", "secret-token")]).await;
    client.write_all(&connect).await.unwrap();

    let media = b"not-quite-media-but-ordered-bytes-0123456789";
    client.write_all(media).await.unwrap();
    client.flush().await.unwrap();

    // The reverse pump must deliver upstream bytes to the client.
    let mut ack = vec![0u8; b"UPSTREAM-ACK".len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut ack))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&ack, b"UPSTREAM-ACK");

    // Closing the publisher ends the session and flushes the pumps.
    drop(client);

    let received = tokio::time::timeout(Duration::from_secs(5), upstream_rx)
        .await
        .unwrap()
        .unwrap();

    let mut expected = connect.clone();
    expected.extend_from_slice(media);
    assert_eq!(
        received, expected,
        "upstream must see the connect bytes first, verbatim and in order"
    );

    wait_for_zero_sessions(&server).await;
}

#[tokio::test]
async fn test_auth_failure_sends_nothing_upstream() {
    // No handshake expected: the relay must drop the upstream connection
    // before a single byte.
    let (upstream_addr, upstream_rx) = spawn_mock_upstream(false, None).await;
    let (relay_addr, server) = spawn_relay(&upstream_addr, Some("secret-token")).await;

    let mut client = TcpStream::connect(&relay_addr).await.unwrap();
    handshake::client_handshake(&mut client).await.unwrap();

    let connect = connect_command(&[("app", "live"), ("token", "wrong")]).await;
    client.write_all(&connect).await.unwrap();

    // The relay terminates the session; the client observes EOF.
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "session must be closed after auth failure");

    let received = tokio::time::timeout(Duration::from_secs(5), upstream_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(
        received.is_empty(),
        "upstream must see zero bytes on auth failure"
    );

    wait_for_zero_sessions(&server).await;
}

#[tokio::test]
async fn test_token_falls_back_to_app_field() {
    let (upstream_addr, upstream_rx) = spawn_mock_upstream(true, None).await;
    // The app name doubles as the token when no token field is present.
    let (relay_addr, server) = spawn_relay(&upstream_addr, Some("live")).await;

    let mut client = TcpStream::connect(&relay_addr).await.unwrap();
    handshake::client_handshake(&mut client).await.unwrap();

    let connect = connect_command(&[("app", "live")]).await;
    client.write_all(&connect).await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(client);

    let received = tokio::time::timeout(Duration::from_secs(5), upstream_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, connect);

    wait_for_zero_sessions(&server).await;
}
