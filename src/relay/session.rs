//! Per-connection session orchestration: admission, upstream selection,
//! handshakes, connect interception and authentication, then the
//! bidirectional byte pump (or the transcode passthrough).

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{ProtocolError, RelayError};
use crate::observability::metrics as obs;
use crate::relay::conn::{IdleStream, RelayStream};
use crate::relay::server::RelayServer;
use crate::relay::tracker::{self, SessionInfo, SessionState};
use crate::resilience::ConnectionLimiter;
use crate::rtmp::amf::{self, Amf0Value};
use crate::rtmp::session::ServerSession;
use crate::rtmp::{flv, handshake, ChunkStream};
use crate::transcode;

/// How long the second pump may take to report after the first one ended.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Releases a connection-limiter slot when the session ends.
struct ConnPermit {
    limiter: Arc<ConnectionLimiter>,
    ip: std::net::IpAddr,
}

impl Drop for ConnPermit {
    fn drop(&mut self) {
        self.limiter.release(self.ip);
    }
}

/// Removes the session from the live index when the handler returns.
struct TrackerGuard<'a> {
    server: &'a RelayServer,
    request_id: String,
}

impl Drop for TrackerGuard<'_> {
    fn drop(&mut self) {
        self.server.tracker.remove(&self.request_id);
    }
}

/// Handle one accepted downstream connection through its whole lifecycle.
pub(crate) async fn handle_session(
    server: &RelayServer,
    socket: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let request_id = tracker::new_request_id();
    let client_ip = peer.ip();

    server.tracker.insert(SessionInfo {
        request_id: request_id.clone(),
        client_addr: peer.to_string(),
        upstream: String::new(),
        start_time: Utc::now(),
        state: SessionState::Connecting,
    });
    let _tracked = TrackerGuard {
        server,
        request_id: request_id.clone(),
    };

    info!(%request_id, client = %peer, "new connection");

    if let Some(limiter) = &server.rate_limiter {
        if let Err(e) = limiter.allow(client_ip) {
            obs::inc_rate_limit_rejection();
            warn!(%request_id, ip = %client_ip, "rate limit denied");
            return Err(e);
        }
    }

    let _permit = match &server.conn_limiter {
        Some(limiter) => {
            if let Err(e) = limiter.acquire(client_ip) {
                obs::inc_connection_limit_rejection();
                warn!(%request_id, ip = %client_ip, error = %e, "connection limit denied");
                return Err(e);
            }
            Some(ConnPermit {
                limiter: limiter.clone(),
                ip: client_ip,
            })
        }
        None => None,
    };

    // TLS on the listener happens after admission so over-limit clients
    // never cost a TLS handshake.
    let downstream = match &server.tls_acceptor {
        Some(acceptor) => RelayStream::TlsServer(Box::new(acceptor.accept(socket).await?)),
        None => RelayStream::Tcp(socket),
    };
    downstream.tune();
    let mut downstream = IdleStream::new(downstream, server.idle_timeout);

    let (upstream_info, upstream_raw) = server.select_upstream()?;
    server.tracker.set_upstream(&request_id, &upstream_raw);

    if server.config.transcode.enabled {
        return handle_transcode(server, downstream, &request_id, &upstream_raw, &cancel).await;
    }

    // Dial before touching the downstream so a dead upstream fails fast.
    let dial_start = Instant::now();
    let upstream = server
        .dial_guarded(&upstream_info, &cancel)
        .await
        .map_err(|e| {
            obs::inc_upstream_error("dial");
            e
        })?;
    upstream.tune();
    let mut upstream = IdleStream::new(upstream, server.idle_timeout);

    server
        .tracker
        .set_state(&request_id, SessionState::Handshaking);
    handshake::server_handshake(&mut downstream).await?;

    // Read the connect command through a recording reader so the exact bytes
    // can be replayed upstream after authentication.
    let (down_read, down_write) = tokio::io::split(downstream);
    let mut recorder = RecordingReader::new(down_read);
    let connect_msg = {
        let mut chunks = ChunkStream::new(&mut recorder);
        chunks.read_message().await?
    };
    debug!(
        %request_id,
        type_id = connect_msg.header.type_id,
        length = connect_msg.header.length,
        "read connect message"
    );

    let values = amf::decode_command(connect_msg.header.type_id, &connect_msg.payload)?;
    let Some(first) = values.first() else {
        return Err(ProtocolError::EmptyCommand.into());
    };
    match first.as_str() {
        Some("connect") => {}
        other => {
            return Err(
                ProtocolError::ExpectedConnect(other.unwrap_or("<non-string>").to_string()).into(),
            );
        }
    }

    let command_object = values.get(2).and_then(Amf0Value::as_object);
    match command_object {
        Some(obj) => {
            let app = obj.get("app").and_then(Amf0Value::as_str).unwrap_or("");
            let tc_url = obj.get("tcUrl").and_then(Amf0Value::as_str).unwrap_or("");
            info!(%request_id, app, tc_url, "rtmp connect");

            if let Some(auth) = &server.authenticator {
                let token = obj
                    .get("token")
                    .and_then(Amf0Value::as_str)
                    .unwrap_or(app);
                if let Err(e) = auth.authenticate(token) {
                    obs::inc_auth_failure();
                    warn!(%request_id, ip = %client_ip, "authentication failed");
                    return Err(e);
                }
            }
        }
        None => {
            if server.authenticator.is_some() {
                obs::inc_auth_failure();
                warn!(%request_id, ip = %client_ip, "authentication failed: missing command object");
                return Err(RelayError::Auth("missing command object".into()));
            }
        }
    }

    handshake::client_handshake(&mut upstream).await.map_err(|e| {
        obs::inc_upstream_error("handshake");
        e
    })?;
    obs::record_dial_latency(dial_start.elapsed().as_secs_f64());

    info!(%request_id, client = %peer, upstream = %upstream_raw, "relaying");

    // Replay the recorded connect bytes verbatim; this is the first
    // application data the upstream sees after its handshake.
    let recorded = recorder.take_recorded();
    let down_read = recorder.into_inner();
    let (up_read, mut up_write) = tokio::io::split(upstream);
    up_write.write_all(&recorded).await?;
    up_write.flush().await?;

    server
        .tracker
        .set_state(&request_id, SessionState::Relaying);

    let session_cancel = cancel.child_token();
    let (result_tx, mut result_rx) = mpsc::channel::<Result<u64, RelayError>>(2);

    spawn_pump(
        server,
        down_read,
        up_write,
        "upstream",
        session_cancel.clone(),
        result_tx.clone(),
    );
    spawn_pump(
        server,
        up_read,
        down_write,
        "downstream",
        session_cancel.clone(),
        result_tx,
    );

    // First pump to finish (either direction) ends the session; its error,
    // if any, is the session's error.
    let mut session_err: Option<RelayError> = None;
    if let Some(Err(e)) = result_rx.recv().await {
        if !e.is_cancelled() {
            session_err = Some(e);
        }
    }
    session_cancel.cancel();

    // Drain the partner pump briefly so its buffer returns to the pool.
    match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, result_rx.recv()).await {
        Ok(Some(Err(e))) if session_err.is_none() && !e.is_cancelled() => {
            session_err = Some(e);
        }
        _ => {}
    }

    server.tracker.set_state(&request_id, SessionState::Closing);

    match session_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Transcode branch: act as the RTMP server through publish, then stream
/// reframed FLV tags into the encoder until the publisher disconnects.
async fn handle_transcode(
    server: &RelayServer,
    mut downstream: IdleStream<RelayStream>,
    request_id: &str,
    upstream_raw: &str,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    server
        .tracker
        .set_state(request_id, SessionState::Handshaking);
    handshake::server_handshake(&mut downstream).await?;

    let (down_read, down_write) = tokio::io::split(downstream);
    let mut session = ServerSession::new(ChunkStream::new(down_read), down_write);
    let stream_name = session.handshake().await?;
    info!(%request_id, stream = %stream_name, "transcode session started");

    // A base URL ending in '/' has the published stream name appended.
    let mut upstream_url = upstream_raw.to_string();
    if upstream_url.ends_with('/') {
        upstream_url.push_str(&stream_name);
    }

    let mut sink = transcode::new_sink(&server.config.transcode, &upstream_url)?;
    sink.write_all(&flv::file_header(true, true)).await?;

    server.tracker.set_state(request_id, SessionState::Relaying);

    let (mut chunks, _down_write) = session.into_parts();
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = chunks.read_message() => msg,
        };

        match msg {
            Ok(msg) => {
                if let Some(tag) = flv::encode_tag(&msg) {
                    sink.write_all(&tag).await?;
                }
            }
            // A closed publisher ends the session cleanly.
            Err(RelayError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                let _ = sink.close().await;
                return Err(e);
            }
        }
    }

    server.tracker.set_state(request_id, SessionState::Closing);
    sink.close().await
}

fn spawn_pump<R, W>(
    server: &RelayServer,
    reader: R,
    writer: W,
    direction: &'static str,
    cancel: CancellationToken,
    results: mpsc::Sender<Result<u64, RelayError>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pool = server.buf_pool.clone();
    tokio::spawn(async move {
        let buf = pool.acquire();
        let (result, buf) = pump(reader, writer, buf, direction, &cancel).await;
        pool.release(buf);
        // Whichever pump finishes first tears the partner down.
        cancel.cancel();
        let _ = results.send(result).await;
    });
}

/// Copy bytes one way until EOF, error or cancellation. Returns the buffer
/// so it can go back to the pool.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    mut buf: Vec<u8>,
    direction: &'static str,
    cancel: &CancellationToken,
) -> (Result<u64, RelayError>, Vec<u8>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total: u64 = 0;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return (Err(RelayError::Cancelled), buf),
            r = reader.read(&mut buf) => r,
        };
        let n = match read {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return (Ok(total), buf);
            }
            Ok(n) => n,
            Err(e) => return (Err(e.into()), buf),
        };

        let write = tokio::select! {
            _ = cancel.cancelled() => return (Err(RelayError::Cancelled), buf),
            r = writer.write_all(&buf[..n]) => r,
        };
        if let Err(e) = write {
            return (Err(e.into()), buf);
        }

        total += n as u64;
        obs::add_bytes_transferred(direction, n as u64);
    }
}

// ---------------------------------------------------------------------------
// Connect recording
// ---------------------------------------------------------------------------

/// Reader wrapper that keeps a copy of every byte it hands out, so the
/// connect command can be replayed to the upstream byte-identically.
struct RecordingReader<R> {
    inner: R,
    recorded: Vec<u8>,
}

impl<R> RecordingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            recorded: Vec::new(),
        }
    }

    fn take_recorded(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.recorded)
    }

    fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RecordingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.recorded.extend_from_slice(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
