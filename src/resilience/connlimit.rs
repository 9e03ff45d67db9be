use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use crate::core::error::RelayError;

/// Global and per-IP connection caps backed by atomic counters.
///
/// Acquire uses compare-and-swap loops so concurrent sessions can never
/// observe a count above the cap, and rolls the global increment back when
/// the per-IP check refuses. Zero caps mean unlimited.
#[derive(Debug)]
pub struct ConnectionLimiter {
    active_total: AtomicI64,
    active_per_ip: RwLock<HashMap<IpAddr, Arc<AtomicI64>>>,
    max_total: i64,
    max_per_ip: i64,
}

impl ConnectionLimiter {
    pub fn new(max_total: i64, max_per_ip: i64) -> Self {
        Self {
            active_total: AtomicI64::new(0),
            active_per_ip: RwLock::new(HashMap::new()),
            max_total,
            max_per_ip,
        }
    }

    /// Try to take one slot for `ip`.
    pub fn acquire(&self, ip: IpAddr) -> Result<(), RelayError> {
        if self.max_total > 0 {
            loop {
                let current = self.active_total.load(Ordering::SeqCst);
                if current >= self.max_total {
                    return Err(RelayError::ConnectionLimit(format!(
                        "global connection limit exceeded ({})",
                        self.max_total
                    )));
                }
                if self
                    .active_total
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
        } else {
            self.active_total.fetch_add(1, Ordering::SeqCst);
        }

        if self.max_per_ip > 0 {
            let counter = self.counter_for(ip);
            loop {
                let current = counter.load(Ordering::SeqCst);
                if current >= self.max_per_ip {
                    // The global slot was taken optimistically; give it back.
                    self.active_total.fetch_sub(1, Ordering::SeqCst);
                    return Err(RelayError::ConnectionLimit(format!(
                        "per-IP connection limit exceeded for {ip} ({})",
                        self.max_per_ip
                    )));
                }
                if counter
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Return one slot for `ip`; removes drained per-IP entries to cap map
    /// growth.
    pub fn release(&self, ip: IpAddr) {
        if self.max_per_ip > 0 {
            let counter = self.counter_for(ip);
            let new_count = counter.fetch_sub(1, Ordering::SeqCst) - 1;

            if new_count <= 0 {
                let mut map = self.active_per_ip.write().unwrap_or_else(|e| e.into_inner());
                // Re-check under the write lock to avoid racing an acquire
                // that grabbed the same counter.
                if let Some(existing) = map.get(&ip) {
                    if existing.load(Ordering::SeqCst) <= 0 {
                        map.remove(&ip);
                    }
                }
            }
        }

        self.active_total.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn total(&self) -> i64 {
        self.active_total.load(Ordering::SeqCst)
    }

    /// Snapshot of per-IP counts, skipping drained entries.
    pub fn per_ip(&self) -> HashMap<IpAddr, i64> {
        let map = self.active_per_ip.read().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .filter_map(|(ip, counter)| {
                let count = counter.load(Ordering::SeqCst);
                (count > 0).then_some((*ip, count))
            })
            .collect()
    }

    fn counter_for(&self, ip: IpAddr) -> Arc<AtomicI64> {
        {
            let map = self.active_per_ip.read().unwrap_or_else(|e| e.into_inner());
            if let Some(counter) = map.get(&ip) {
                return counter.clone();
            }
        }

        let mut map = self.active_per_ip.write().unwrap_or_else(|e| e.into_inner());
        map.entry(ip)
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_acquire_release_restores_counts() {
        let limiter = ConnectionLimiter::new(10, 5);
        let client = ip("1.2.3.4");

        limiter.acquire(client).unwrap();
        limiter.acquire(client).unwrap();
        assert_eq!(limiter.total(), 2);
        assert_eq!(limiter.per_ip()[&client], 2);

        limiter.release(client);
        limiter.release(client);
        assert_eq!(limiter.total(), 0);
        // Drained per-IP entries are removed entirely.
        assert!(limiter.per_ip().is_empty());
    }

    #[test]
    fn test_global_cap() {
        let limiter = ConnectionLimiter::new(2, 0);
        limiter.acquire(ip("1.1.1.1")).unwrap();
        limiter.acquire(ip("2.2.2.2")).unwrap();
        assert!(limiter.acquire(ip("3.3.3.3")).is_err());
        assert_eq!(limiter.total(), 2);
    }

    #[test]
    fn test_per_ip_cap_rolls_back_global() {
        let limiter = ConnectionLimiter::new(10, 1);
        let client = ip("1.1.1.1");
        limiter.acquire(client).unwrap();
        assert!(limiter.acquire(client).is_err());
        // The refused acquire must not leak a global slot.
        assert_eq!(limiter.total(), 1);

        limiter.acquire(ip("2.2.2.2")).unwrap();
        assert_eq!(limiter.total(), 2);
    }

    #[test]
    fn test_zero_caps_are_unlimited() {
        let limiter = ConnectionLimiter::new(0, 0);
        for i in 0..100 {
            limiter
                .acquire(ip(&format!("10.0.0.{}", i % 8 + 1)))
                .unwrap();
        }
        assert_eq!(limiter.total(), 100);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_exceed_cap() {
        let limiter = Arc::new(ConnectionLimiter::new(8, 0));
        let peak = Arc::new(AtomicI64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                if limiter.acquire(ip("9.9.9.9")).is_ok() {
                    peak.fetch_max(limiter.total(), Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    limiter.release(ip("9.9.9.9"));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 8);
        assert_eq!(limiter.total(), 0);
    }
}
