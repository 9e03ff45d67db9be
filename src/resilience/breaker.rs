use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::error::RelayError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Failing; calls short-circuit.
    Open,
    /// Probing whether the guarded operation recovered.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker guarding upstream dials.
///
/// All transitions happen under one mutex. The guarded future runs outside
/// the lock; if the state changed while it ran (a concurrent reset or
/// transition), the observation is discarded rather than applied to the new
/// state.
#[derive(Debug)]
pub struct Breaker {
    inner: Mutex<Inner>,
    max_failures: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl Breaker {
    pub fn new(max_failures: u32, reset_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
            max_failures,
            reset_timeout,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Run `fut` under breaker protection.
    ///
    /// In the Open state the call short-circuits with
    /// [`RelayError::CircuitOpen`] unless `reset_timeout` has elapsed since
    /// the last failure, in which case the breaker moves to HalfOpen and the
    /// call proceeds as a probe.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, RelayError>
    where
        F: Future<Output = Result<T, RelayError>>,
    {
        let observed = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.state == BreakerState::Open {
                let cooled_down = inner
                    .last_failure
                    .map(|t| t.elapsed() > self.reset_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = BreakerState::HalfOpen;
                    inner.failures = 0;
                    inner.successes = 0;
                } else {
                    return Err(RelayError::CircuitOpen);
                }
            }
            inner.state
        };

        let result = fut.await;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != observed {
            // A concurrent transition takes precedence over this observation.
            return result;
        }

        match &result {
            Err(_) => {
                inner.failures += 1;
                inner.last_failure = Some(Instant::now());
                if inner.state == BreakerState::HalfOpen {
                    inner.state = BreakerState::Open;
                } else if inner.failures >= self.max_failures {
                    inner.state = BreakerState::Open;
                }
            }
            Ok(_) => {
                if inner.state == BreakerState::HalfOpen {
                    inner.successes += 1;
                    if inner.successes >= self.success_threshold {
                        inner.state = BreakerState::Closed;
                        inner.failures = 0;
                        inner.successes = 0;
                    }
                } else {
                    inner.failures = 0;
                }
            }
        }

        result
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state
    }

    /// Force the breaker back to Closed, clearing counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail(breaker: &Breaker) -> Result<(), RelayError> {
        breaker
            .call(async { Err::<(), _>(RelayError::UpstreamDial("refused".into())) })
            .await
            .map(|_| ())
    }

    async fn succeed(breaker: &Breaker) -> Result<(), RelayError> {
        breaker.call(async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let breaker = Breaker::new(2, Duration::from_millis(50), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Third attempt short-circuits.
        let err = succeed(&breaker).await.unwrap_err();
        assert!(matches!(err, RelayError::CircuitOpen));
    }

    #[tokio::test]
    async fn test_recovers_through_half_open() {
        let breaker = Breaker::new(2, Duration::from_millis(50), 1);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = Breaker::new(1, Duration::from_millis(10), 1);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_success_threshold_requires_consecutive_successes() {
        let breaker = Breaker::new(1, Duration::from_millis(10), 2);
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(20)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_when_closed() {
        let breaker = Breaker::new(2, Duration::from_millis(50), 1);
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        // Still closed: the success cleared the first failure.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = Breaker::new(1, Duration::from_secs(60), 1);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        succeed(&breaker).await.unwrap();
    }
}
