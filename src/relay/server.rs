//! Relay server: owns the engine components, accepts downstream
//! connections and spawns one session handler per connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::auth::TokenAuthenticator;
use crate::core::config::Config;
use crate::core::error::RelayError;
use crate::core::shutdown;
use crate::observability::metrics as obs;
use crate::relay::conn::{tls_acceptor, tls_connector, RelayStream};
use crate::relay::pool::{HealthCheckSettings, UpstreamPool};
use crate::relay::session::handle_session;
use crate::relay::tracker::SessionTracker;
use crate::relay::upstream::{parse_upstream, UpstreamInfo};
use crate::resilience::{retry, Breaker, BufferPool, ConnectionLimiter, RateLimiter, RetryPolicy};

/// The relay engine: one instance per listen address.
///
/// Ownership is unidirectional: the server owns pool, breaker, limiters and
/// tracker; sessions borrow them through the shared `Arc<RelayServer>` and
/// never hold references back into a session.
pub struct RelayServer {
    pub(crate) config: Config,
    pub(crate) idle_timeout: Duration,
    pub(crate) authenticator: Option<Arc<TokenAuthenticator>>,
    pub(crate) rate_limiter: Option<Arc<RateLimiter>>,
    pub(crate) conn_limiter: Option<Arc<ConnectionLimiter>>,
    pub(crate) breaker: Option<Arc<Breaker>>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) retry_jitter: f64,
    pub(crate) pool: Option<Arc<UpstreamPool>>,
    pub(crate) single_upstream: Option<(UpstreamInfo, String)>,
    pub(crate) buf_pool: Arc<BufferPool>,
    pub(crate) tracker: Arc<SessionTracker>,
    pub(crate) tls_acceptor: Option<TlsAcceptor>,
}

impl RelayServer {
    /// Build the engine from a config.
    ///
    /// The config is expected to have passed [`Config::validate`] at load
    /// time; construction only fails on unparseable upstreams or TLS
    /// material.
    pub fn new(config: Config) -> Result<Arc<Self>, RelayError> {
        let authenticator = config
            .security
            .auth_enabled
            .then(|| Arc::new(TokenAuthenticator::new(&config.security.auth_tokens)));

        let rate_limiter = config.rate_limit.enabled.then(|| {
            Arc::new(RateLimiter::new(
                config.rate_limit.requests_per_sec,
                config.rate_limit.burst,
            ))
        });

        let conn_limiter = (config.connection_limit.max_total_connections > 0
            || config.connection_limit.max_per_ip > 0)
            .then(|| {
                Arc::new(ConnectionLimiter::new(
                    config.connection_limit.max_total_connections,
                    config.connection_limit.max_per_ip,
                ))
            });

        let breaker = config.circuit_breaker.enabled.then(|| {
            Arc::new(Breaker::new(
                config.circuit_breaker.max_failures,
                Duration::from_secs(config.circuit_breaker.reset_timeout_sec),
                config.circuit_breaker.success_threshold,
            ))
        });

        let retry_policy = config
            .retry
            .enabled
            .then(|| RetryPolicy::from_config(&config.retry));
        let retry_jitter = config.retry.jitter_fraction;

        let (pool, single_upstream) = if config.upstreams.is_empty() {
            let info = parse_upstream(&config.upstream)?;
            (None, Some((info, config.upstream.clone())))
        } else {
            let pool = UpstreamPool::new(&config.upstreams, &config.strategy())?;
            (Some(Arc::new(pool)), None)
        };

        let tls_acceptor = if config.security.tls_enabled {
            Some(tls_acceptor(
                &config.security.tls_cert,
                &config.security.tls_key,
            )?)
        } else {
            None
        };

        let idle_timeout = config.idle_timeout.as_duration();
        let buf_pool = Arc::new(BufferPool::new(config.read_buffer));

        Ok(Arc::new(Self {
            config,
            idle_timeout,
            authenticator,
            rate_limiter,
            conn_limiter,
            breaker,
            retry_policy,
            retry_jitter,
            pool,
            single_upstream,
            buf_pool,
            tracker: Arc::new(SessionTracker::new()),
            tls_acceptor,
        }))
    }

    /// Live-session index handle, e.g. for an admin surface.
    pub fn tracker(&self) -> Arc<SessionTracker> {
        self.tracker.clone()
    }

    /// Upstream pool handle, when pooling is configured.
    pub fn pool(&self) -> Option<Arc<UpstreamPool>> {
        self.pool.clone()
    }

    /// Bind the configured listen address and accept until the token fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), RelayError> {
        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await?;
        self.run_with_listener(listener, cancel).await
    }

    /// Accept connections on an existing listener until the token fires,
    /// then drain live sessions.
    pub async fn run_with_listener(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        let bind_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.config.bind_addr());
        let upstream_desc = self
            .single_upstream
            .as_ref()
            .map(|(_, raw)| raw.clone())
            .unwrap_or_else(|| format!("pool of {}", self.pool.as_ref().map_or(0, |p| p.len())));
        info!(listen = %bind_addr, upstream = %upstream_desc, "listening");

        if let Some(pool) = &self.pool {
            pool.start_health_checks(
                cancel.clone(),
                HealthCheckSettings::from_config(&self.config.upstream_health_check),
            );
        }

        loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let server = self.clone();
            let session_cancel = cancel.clone();
            tokio::spawn(async move {
                obs::inc_connection_start();
                let start = Instant::now();

                let result = handle_session(&server, socket, peer, session_cancel).await;

                obs::record_connection_duration(start.elapsed().as_secs_f64());
                match result {
                    Ok(()) => {
                        obs::inc_connection_success();
                        info!(client = %peer, duration = ?start.elapsed(), "session completed");
                    }
                    Err(e) if e.is_cancelled() => {
                        info!(client = %peer, "session cancelled by shutdown");
                    }
                    Err(e) => {
                        obs::inc_connection_error(e.kind());
                        error!(client = %peer, error = %e, duration = ?start.elapsed(), "session error");
                    }
                }
            });
        }

        info!("listener closed, draining sessions");
        if let Some(limiter) = &self.rate_limiter {
            limiter.stop();
        }
        let tracker = self.tracker.clone();
        shutdown::drain_sessions(move || tracker.len()).await;

        Ok(())
    }

    /// Pick the session's upstream: pool selection or the single configured
    /// target.
    pub(crate) fn select_upstream(&self) -> Result<(UpstreamInfo, String), RelayError> {
        if let Some(pool) = &self.pool {
            return pool.pick().map_err(|e| {
                obs::inc_upstream_error("select");
                e
            });
        }
        match &self.single_upstream {
            Some(target) => Ok(target.clone()),
            None => {
                obs::inc_upstream_error("parse");
                Err(RelayError::UpstreamSelect("no upstream configured".into()))
            }
        }
    }

    /// Dial the upstream, guarded by the circuit breaker and retry policy
    /// when configured.
    pub(crate) async fn dial_guarded(
        &self,
        info: &UpstreamInfo,
        cancel: &CancellationToken,
    ) -> Result<RelayStream, RelayError> {
        match &self.breaker {
            Some(breaker) => breaker.call(self.dial_with_retry(info, cancel)).await,
            None => self.dial_with_retry(info, cancel).await,
        }
    }

    async fn dial_with_retry(
        &self,
        info: &UpstreamInfo,
        cancel: &CancellationToken,
    ) -> Result<RelayStream, RelayError> {
        match self.retry_policy {
            Some(policy) => {
                if self.retry_jitter > 0.0 {
                    retry::retry_with_jitter(policy, self.retry_jitter, cancel, || {
                        dial_once(info)
                    })
                    .await
                } else {
                    retry::retry(policy, cancel, || dial_once(info)).await
                }
            }
            None => dial_once(info).await,
        }
    }
}

/// One dial attempt, TLS-wrapped for rtmps/rtsps.
async fn dial_once(info: &UpstreamInfo) -> Result<RelayStream, RelayError> {
    let tcp = TcpStream::connect(&info.address)
        .await
        .map_err(|e| RelayError::UpstreamDial(format!("{}: {e}", info.address)))?;

    if !info.use_tls {
        return Ok(RelayStream::Tcp(tcp));
    }

    let server_name = ServerName::try_from(info.host.clone())
        .map_err(|e| RelayError::UpstreamDial(format!("invalid server name: {e}")))?;
    let tls = tls_connector()
        .connect(server_name, tcp)
        .await
        .map_err(|e| RelayError::UpstreamDial(format!("tls {}: {e}", info.address)))?;

    Ok(RelayStream::TlsClient(Box::new(tls)))
}
