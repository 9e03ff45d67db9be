use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::core::config::RetryConfig;
use crate::core::error::RelayError;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Exponential backoff settings. Invalid (zero or negative) fields are
/// silently replaced with defaults when the policy runs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            initial_delay: Duration::from_secs(cfg.initial_delay_sec),
            max_delay: Duration::from_secs(cfg.max_delay_sec),
            multiplier: cfg.multiplier,
        }
    }

    fn normalized(mut self) -> Self {
        if self.max_attempts == 0 {
            self.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        if self.initial_delay.is_zero() {
            self.initial_delay = DEFAULT_INITIAL_DELAY;
        }
        if self.max_delay.is_zero() {
            self.max_delay = DEFAULT_MAX_DELAY;
        }
        if self.multiplier <= 0.0 {
            self.multiplier = DEFAULT_MULTIPLIER;
        }
        self
    }
}

/// Retry `op` with exponential backoff, no jitter.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    retry_with_jitter(policy, 0.0, cancel, op).await
}

/// Retry `op` with exponential backoff and symmetric jitter.
///
/// The sleep between attempts is `delay + U(-delay*f, +delay*f)`; a fraction
/// outside [0, 1] is clamped to 0.1. Sleeps race the cancellation token and
/// return [`RelayError::Cancelled`] immediately when it fires.
pub async fn retry_with_jitter<T, F, Fut>(
    policy: RetryPolicy,
    jitter_fraction: f64,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let policy = policy.normalized();
    let jitter_fraction = if !(0.0..=1.0).contains(&jitter_fraction) {
        0.1
    } else {
        jitter_fraction
    };

    let mut delay = policy.initial_delay;
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => last_err = Some(err),
        }

        if attempt + 1 == policy.max_attempts {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(apply_jitter(delay, jitter_fraction)) => {}
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
        }

        delay = next_delay(delay, &policy);
    }

    Err(last_err.unwrap_or_else(|| RelayError::UpstreamDial("retry made no attempts".into())))
}

fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return delay;
    }
    let jitter = delay.as_secs_f64() * fraction;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    let actual = delay.as_secs_f64() + offset;
    if actual <= 0.0 {
        delay
    } else {
        Duration::from_secs_f64(actual)
    }
}

fn next_delay(delay: Duration, policy: &RetryPolicy) -> Duration {
    let next = delay.mul_f64(policy.multiplier);
    next.min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn flaky(fail_times: u32) -> (Arc<AtomicU32>, impl FnMut() -> FlakyFut) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            FlakyFut { fail: n < fail_times }
        };
        (calls, op)
    }

    struct FlakyFut {
        fail: bool,
    }

    impl Future for FlakyFut {
        type Output = Result<u32, RelayError>;
        fn poll(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Self::Output> {
            if self.fail {
                std::task::Poll::Ready(Err(RelayError::UpstreamDial("refused".into())))
            } else {
                std::task::Poll::Ready(Ok(42))
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let cancel = CancellationToken::new();
        let (calls, op) = flaky(2);
        let value = retry(fast_policy(5), &cancel, op).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let cancel = CancellationToken::new();
        let (calls, op) = flaky(100);
        let err = retry(fast_policy(3), &cancel, op).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamDial(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_config_uses_defaults() {
        // All-zero policy normalizes to 3 attempts.
        let policy = RetryPolicy {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 0.0,
        }
        .normalized();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        };

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let start = std::time::Instant::now();
        let (_, op) = flaky(100);
        let err = retry(policy, &cancel, op).await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = apply_jitter(delay, 0.5);
            assert!(jittered >= Duration::from_millis(50));
            assert!(jittered <= Duration::from_millis(150));
        }
        assert_eq!(apply_jitter(delay, 0.0), delay);
    }

    #[test]
    fn test_delay_growth_caps_at_max() {
        let policy = fast_policy(10);
        let mut delay = policy.initial_delay;
        for _ in 0..10 {
            delay = next_delay(delay, &policy);
            assert!(delay <= policy.max_delay);
        }
        assert_eq!(delay, policy.max_delay);
    }
}
