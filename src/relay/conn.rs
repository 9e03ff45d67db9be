//! Connection plumbing: the TCP/TLS stream enum, TCP tuning, the
//! idle-deadline wrapper around session streams, and TLS setup for both the
//! listener and upstream dials.

use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::core::error::RelayError;

/// A relay-side connection: plain TCP or TLS in either role.
#[derive(Debug)]
pub enum RelayStream {
    Tcp(TcpStream),
    TlsClient(Box<client::TlsStream<TcpStream>>),
    TlsServer(Box<server::TlsStream<TcpStream>>),
}

impl RelayStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            RelayStream::Tcp(s) => s,
            RelayStream::TlsClient(s) => s.get_ref().0,
            RelayStream::TlsServer(s) => s.get_ref().0,
        }
    }

    /// Low-latency socket tuning; failures are logged and ignored.
    pub fn tune(&self) {
        if let Err(e) = self.tcp().set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.tcp().peer_addr()
    }
}

macro_rules! delegate_stream {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self.get_mut() {
            RelayStream::Tcp($inner) => {
                let $inner = Pin::new($inner);
                $body
            }
            RelayStream::TlsClient($inner) => {
                let $inner = Pin::new($inner.as_mut());
                $body
            }
            RelayStream::TlsServer($inner) => {
                let $inner = Pin::new($inner.as_mut());
                $body
            }
        }
    };
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate_stream!(self, inner => inner.poll_read(cx, buf))
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate_stream!(self, inner => inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_stream!(self, inner => inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_stream!(self, inner => inner.poll_shutdown(cx))
    }
}

// ---------------------------------------------------------------------------
// Idle deadlines
// ---------------------------------------------------------------------------

/// Wraps a stream so that a read or write which makes no progress for the
/// idle timeout fails with `TimedOut`.
///
/// The deadline is armed when an operation starts waiting and cleared every
/// time one completes, so continuously flowing traffic never times out. A
/// zero timeout disables the wrapper.
pub struct IdleStream<S> {
    inner: S,
    idle: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> IdleStream<S> {
    pub fn new(inner: S, idle: Duration) -> Self {
        Self {
            inner,
            idle: (!idle.is_zero()).then_some(idle),
            read_deadline: None,
            write_deadline: None,
        }
    }
}

fn poll_deadline(
    idle: Option<Duration>,
    deadline: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
) -> Result<(), io::Error> {
    let Some(idle) = idle else {
        return Ok(());
    };
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(idle)));
    if sleep.as_mut().poll(cx).is_ready() {
        *deadline = None;
        return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
    }
    Ok(())
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = poll_deadline(this.idle, &mut this.read_deadline, cx) {
            return Poll::Ready(Err(e));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = poll_deadline(this.idle, &mut this.write_deadline, cx) {
            return Poll::Ready(Err(e));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// TLS setup
// ---------------------------------------------------------------------------

/// Shared TLS connector for rtmps/rtsps upstream dials and health probes,
/// verifying against the bundled web PKI roots.
pub fn tls_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    let config = CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone();
    TlsConnector::from(config)
}

/// Build the listener-side TLS acceptor from PEM cert and key files.
pub fn tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, RelayError> {
    let cert_file = File::open(cert_path)
        .map_err(|e| RelayError::Config(format!("open tls_cert {cert_path}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Config(format!("parse tls_cert {cert_path}: {e}")))?;
    if certs.is_empty() {
        return Err(RelayError::Config(format!(
            "no certificates found in {cert_path}"
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| RelayError::Config(format!("open tls_key {key_path}: {e}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| RelayError::Config(format!("parse tls_key {key_path}: {e}")))?
        .ok_or_else(|| RelayError::Config(format!("no private key found in {key_path}")))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Config(format!("build TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
