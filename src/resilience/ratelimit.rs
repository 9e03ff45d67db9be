use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::RelayError;

const DEFAULT_RATE: f64 = 10.0;
const DEFAULT_BURST: f64 = 20.0;

/// How often the background sweep looks for idle buckets.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Buckets idle at least this long are evicted.
const IDLE_EVICTION: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// Per-IP token-bucket rate limiter.
///
/// `allow` never waits: it refills the caller's bucket lazily, consumes one
/// token or denies. A background task evicts buckets idle for half an hour
/// so the map cannot grow without bound; call [`RateLimiter::stop`] to
/// release it.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, Bucket>>>,
    rate: f64,
    burst: f64,
    sweep_cancel: CancellationToken,
}

impl RateLimiter {
    /// `rate` is tokens per second, `burst` the bucket capacity; values
    /// <= 0 fall back to 10 req/s and burst 20.
    pub fn new(rate: f64, burst: u32) -> Self {
        let rate = if rate <= 0.0 { DEFAULT_RATE } else { rate };
        let burst = if burst == 0 {
            DEFAULT_BURST
        } else {
            f64::from(burst)
        };

        let buckets: Arc<Mutex<HashMap<IpAddr, Bucket>>> = Arc::new(Mutex::new(HashMap::new()));
        let sweep_cancel = CancellationToken::new();

        let sweep_buckets = buckets.clone();
        let sweep_token = sweep_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep_token.cancelled() => return,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        let Some(cutoff) = Instant::now().checked_sub(IDLE_EVICTION) else {
                            continue;
                        };
                        let mut map = sweep_buckets.lock().unwrap_or_else(|e| e.into_inner());
                        let before = map.len();
                        sweep_before(&mut map, cutoff);
                        let evicted = before - map.len();
                        if evicted > 0 {
                            debug!(evicted, remaining = map.len(), "evicted idle rate-limit buckets");
                        }
                    }
                }
            }
        });

        Self {
            buckets,
            rate,
            burst,
            sweep_cancel,
        }
    }

    /// Admit or deny one request from `ip`.
    pub fn allow(&self, ip: IpAddr) -> Result<(), RelayError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
            last_access: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.last_access = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(RelayError::RateLimited(ip))
        }
    }

    /// Number of IPs currently tracked.
    pub fn active_ips(&self) -> usize {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.len()
    }

    /// Stop the background sweep task.
    pub fn stop(&self) {
        self.sweep_cancel.cancel();
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.sweep_cancel.cancel();
    }
}

fn sweep_before(map: &mut HashMap<IpAddr, Bucket>, cutoff: Instant) {
    map.retain(|_, bucket| bucket.last_access > cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_burst_then_deny_then_refill() {
        let limiter = RateLimiter::new(2.0, 2);
        let client = ip("1.1.1.1");

        assert!(limiter.allow(client).is_ok());
        assert!(limiter.allow(client).is_ok());
        let err = limiter.allow(client).unwrap_err();
        assert!(matches!(err, RelayError::RateLimited(_)));

        // At 2 tokens/sec, 600ms refills more than one token.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(limiter.allow(client).is_ok());
        limiter.stop();
    }

    #[tokio::test]
    async fn test_ips_are_limited_independently() {
        let limiter = RateLimiter::new(1.0, 1);
        assert!(limiter.allow(ip("1.1.1.1")).is_ok());
        assert!(limiter.allow(ip("2.2.2.2")).is_ok());
        assert!(limiter.allow(ip("1.1.1.1")).is_err());
        assert_eq!(limiter.active_ips(), 2);
        limiter.stop();
    }

    #[tokio::test]
    async fn test_invalid_config_uses_defaults() {
        let limiter = RateLimiter::new(0.0, 0);
        let client = ip("3.3.3.3");
        // Default burst of 20 admits 20 requests back to back.
        for _ in 0..20 {
            assert!(limiter.allow(client).is_ok());
        }
        assert!(limiter.allow(client).is_err());
        limiter.stop();
    }

    #[test]
    fn test_sweep_evicts_only_idle_buckets() {
        let cutoff = Instant::now();
        let mut map = HashMap::new();
        map.insert(
            ip("1.1.1.1"),
            Bucket {
                tokens: 1.0,
                last_refill: cutoff,
                last_access: cutoff, // exactly at the cutoff: idle, evicted
            },
        );
        map.insert(
            ip("2.2.2.2"),
            Bucket {
                tokens: 1.0,
                last_refill: cutoff,
                last_access: cutoff + Duration::from_millis(1),
            },
        );

        sweep_before(&mut map, cutoff);
        assert!(!map.contains_key(&ip("1.1.1.1")));
        assert!(map.contains_key(&ip("2.2.2.2")));
    }
}
