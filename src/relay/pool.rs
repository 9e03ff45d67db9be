use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::config::{UpstreamEndpoint, UpstreamHealthCheckConfig};
use crate::core::error::RelayError;
use crate::observability::metrics as obs;
use crate::relay::conn::tls_connector;
use crate::relay::upstream::{parse_upstream, UpstreamInfo};

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    RoundRobin,
    Random,
}

/// Normalized health-probe settings.
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
}

impl HealthCheckSettings {
    pub fn from_config(cfg: &UpstreamHealthCheckConfig) -> Self {
        let interval = if cfg.interval_sec == 0 {
            DEFAULT_PROBE_INTERVAL
        } else {
            Duration::from_secs(cfg.interval_sec)
        };
        let timeout = if cfg.timeout_sec == 0 {
            DEFAULT_PROBE_TIMEOUT
        } else {
            Duration::from_secs(cfg.timeout_sec)
        };
        Self {
            enabled: cfg.enabled,
            interval,
            timeout,
        }
    }
}

/// Status snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
    pub last_checked_unix: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

#[derive(Debug)]
struct EndpointState {
    url: String,
    info: UpstreamInfo,
    weight: u32,
    healthy: bool,
    last_checked: Option<DateTime<Utc>>,
    last_error: String,
}

#[derive(Debug)]
struct PoolInner {
    endpoints: Vec<EndpointState>,
    rr_index: usize,
}

/// Weighted upstream selection with background TCP/TLS health probing.
///
/// Selection walks the healthy candidates (all endpoints when none are
/// healthy) subtracting weights until the position lands in one; the
/// round-robin cursor advances modulo the total weight under the pool mutex
/// so concurrent picks stay fair.
#[derive(Debug)]
pub struct UpstreamPool {
    strategy: Strategy,
    inner: Mutex<PoolInner>,
}

impl UpstreamPool {
    pub fn new(endpoints: &[UpstreamEndpoint], strategy: &str) -> Result<Self, RelayError> {
        if endpoints.is_empty() {
            return Err(RelayError::Config("no upstreams configured".into()));
        }

        let strategy = match strategy.trim().to_ascii_lowercase().as_str() {
            "" | "round_robin" => Strategy::RoundRobin,
            "random" => Strategy::Random,
            other => {
                return Err(RelayError::Config(format!(
                    "invalid upstream strategy {other:?}"
                )));
            }
        };

        let mut states = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let info = parse_upstream(&endpoint.url)?;
            let weight = if endpoint.weight <= 0 {
                1
            } else {
                endpoint.weight as u32
            };
            states.push(EndpointState {
                url: endpoint.url.clone(),
                info,
                weight,
                healthy: true,
                last_checked: None,
                last_error: String::new(),
            });
        }

        Ok(Self {
            strategy,
            inner: Mutex::new(PoolInner {
                endpoints: states,
                rr_index: 0,
            }),
        })
    }

    /// Select an upstream; healthy endpoints are preferred, the full list is
    /// the fallback when none are.
    pub fn pick(&self) -> Result<(UpstreamInfo, String), RelayError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let candidates: Vec<usize> = {
            let healthy: Vec<usize> = inner
                .endpoints
                .iter()
                .enumerate()
                .filter(|(_, e)| e.healthy)
                .map(|(i, _)| i)
                .collect();
            if healthy.is_empty() {
                (0..inner.endpoints.len()).collect()
            } else {
                healthy
            }
        };

        let total_weight: u32 = candidates
            .iter()
            .map(|&i| inner.endpoints[i].weight)
            .sum();
        if total_weight == 0 {
            return Err(RelayError::UpstreamSelect("invalid upstream weights".into()));
        }

        let mut pos = match self.strategy {
            Strategy::RoundRobin => {
                let pos = inner.rr_index as u32 % total_weight;
                inner.rr_index = (inner.rr_index + 1) % total_weight as usize;
                pos
            }
            Strategy::Random => rand::thread_rng().gen_range(0..total_weight),
        };

        for &i in &candidates {
            let endpoint = &inner.endpoints[i];
            if pos < endpoint.weight {
                return Ok((endpoint.info.clone(), endpoint.url.clone()));
            }
            pos -= endpoint.weight;
        }

        Err(RelayError::UpstreamSelect("no upstream selected".into()))
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn healthy_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.endpoints.iter().filter(|e| e.healthy).count()
    }

    pub fn stats(&self) -> Vec<UpstreamStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .endpoints
            .iter()
            .map(|e| UpstreamStatus {
                url: e.url.clone(),
                weight: e.weight,
                healthy: e.healthy,
                last_checked_unix: e.last_checked.map(|t| t.timestamp()).unwrap_or(0),
                last_error: e.last_error.clone(),
            })
            .collect()
    }

    /// Spawn the periodic health-probe task; it runs one sweep immediately
    /// and then every `interval` until the token fires.
    pub fn start_health_checks(
        self: &Arc<Self>,
        cancel: CancellationToken,
        settings: HealthCheckSettings,
    ) {
        if !settings.enabled {
            return;
        }

        let pool = self.clone();
        tokio::spawn(async move {
            pool.check_all(settings.timeout).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("health-probe task stopping");
                        return;
                    }
                    _ = tokio::time::sleep(settings.interval) => {
                        pool.check_all(settings.timeout).await;
                    }
                }
            }
        });
    }

    async fn check_all(&self, timeout: Duration) {
        let targets: Vec<(usize, UpstreamInfo, String)> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .endpoints
                .iter()
                .enumerate()
                .map(|(i, e)| (i, e.info.clone(), e.url.clone()))
                .collect()
        };

        for (index, info, url) in targets {
            let result = probe(&info, timeout).await;
            if let Err(e) = &result {
                warn!(upstream = %url, error = %e, "upstream health check failed");
            }
            self.record_probe(index, result);
        }

        obs::set_upstream_healthy(self.healthy_count());
    }

    fn record_probe(&self, index: usize, result: Result<(), RelayError>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(endpoint) = inner.endpoints.get_mut(index) else {
            return;
        };
        endpoint.last_checked = Some(Utc::now());
        match result {
            Ok(()) => {
                endpoint.healthy = true;
                endpoint.last_error.clear();
            }
            Err(e) => {
                endpoint.healthy = false;
                endpoint.last_error = e.to_string();
            }
        }
    }

    #[cfg(test)]
    fn set_healthy(&self, index: usize, healthy: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.endpoints[index].healthy = healthy;
    }
}

/// Dial the endpoint once (TLS for rtmps/rtsps) within `timeout`.
async fn probe(info: &UpstreamInfo, timeout: Duration) -> Result<(), RelayError> {
    let dial = async {
        let tcp = TcpStream::connect(&info.address)
            .await
            .map_err(|e| RelayError::UpstreamDial(e.to_string()))?;
        if info.use_tls {
            let server_name = ServerName::try_from(info.host.clone())
                .map_err(|e| RelayError::UpstreamDial(format!("invalid server name: {e}")))?;
            tls_connector()
                .connect(server_name, tcp)
                .await
                .map_err(|e| RelayError::UpstreamDial(e.to_string()))?;
        }
        Ok(())
    };

    match tokio::time::timeout(timeout, dial).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::UpstreamDial(format!(
            "health check timed out after {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(specs: &[(&str, i32)]) -> Vec<UpstreamEndpoint> {
        specs
            .iter()
            .map(|(url, weight)| UpstreamEndpoint {
                url: url.to_string(),
                weight: *weight,
            })
            .collect()
    }

    #[test]
    fn test_requires_endpoints_and_known_strategy() {
        assert!(UpstreamPool::new(&[], "round_robin").is_err());
        assert!(UpstreamPool::new(
            &endpoints(&[("rtmp://a.example.com/app", 1)]),
            "least_conn"
        )
        .is_err());
        assert!(UpstreamPool::new(&endpoints(&[("rtmp://a.example.com/app", 1)]), "").is_ok());
    }

    #[test]
    fn test_weighted_round_robin_pattern() {
        // Weights 1:2 yield the repeating pattern A, B, B.
        let pool = UpstreamPool::new(
            &endpoints(&[
                ("rtmp://a.example.com/app", 1),
                ("rtmp://b.example.com/app", 2),
            ]),
            "round_robin",
        )
        .unwrap();

        let picks: Vec<String> = (0..6).map(|_| pool.pick().unwrap().1).collect();
        assert_eq!(
            picks,
            vec![
                "rtmp://a.example.com/app",
                "rtmp://b.example.com/app",
                "rtmp://b.example.com/app",
                "rtmp://a.example.com/app",
                "rtmp://b.example.com/app",
                "rtmp://b.example.com/app",
            ]
        );
    }

    #[test]
    fn test_unhealthy_endpoints_are_skipped() {
        let pool = UpstreamPool::new(
            &endpoints(&[
                ("rtmp://a.example.com/app", 1),
                ("rtmp://b.example.com/app", 2),
            ]),
            "round_robin",
        )
        .unwrap();

        pool.set_healthy(0, false);
        assert_eq!(pool.healthy_count(), 1);
        for _ in 0..3 {
            let (_, url) = pool.pick().unwrap();
            assert_eq!(url, "rtmp://b.example.com/app");
        }
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_full_list() {
        let pool = UpstreamPool::new(
            &endpoints(&[("rtmp://a.example.com/app", 1)]),
            "round_robin",
        )
        .unwrap();
        pool.set_healthy(0, false);
        assert!(pool.pick().is_ok());
    }

    #[test]
    fn test_zero_weight_defaults_to_one() {
        let pool =
            UpstreamPool::new(&endpoints(&[("rtmp://a.example.com/app", 0)]), "round_robin")
                .unwrap();
        let stats = pool.stats();
        assert_eq!(stats[0].weight, 1);
    }

    #[test]
    fn test_random_strategy_picks_valid_endpoints() {
        let pool = UpstreamPool::new(
            &endpoints(&[
                ("rtmp://a.example.com/app", 1),
                ("rtmp://b.example.com/app", 3),
            ]),
            "random",
        )
        .unwrap();

        for _ in 0..50 {
            let (_, url) = pool.pick().unwrap();
            assert!(url.contains("example.com"));
        }
    }

    #[test]
    fn test_stats_snapshot() {
        let pool = UpstreamPool::new(
            &endpoints(&[("rtmp://a.example.com/app", 2)]),
            "round_robin",
        )
        .unwrap();
        pool.record_probe(0, Err(RelayError::UpstreamDial("refused".into())));

        let stats = pool.stats();
        assert!(!stats[0].healthy);
        assert!(stats[0].last_error.contains("refused"));
        assert!(stats[0].last_checked_unix > 0);

        pool.record_probe(0, Ok(()));
        let stats = pool.stats();
        assert!(stats[0].healthy);
        assert!(stats[0].last_error.is_empty());
    }

    #[tokio::test]
    async fn test_probe_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                drop(socket);
            }
        });

        let info = parse_upstream(&format!("rtmp://{addr}/app")).unwrap();
        assert!(probe(&info, Duration::from_secs(1)).await.is_ok());

        // A port with no listener must fail the probe.
        let dead = parse_upstream("rtmp://127.0.0.1:1/app").unwrap();
        assert!(probe(&dead, Duration::from_secs(1)).await.is_err());
    }
}
