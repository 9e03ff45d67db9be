use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// How long the drain loop waits for live sessions before giving up.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for the drain loop.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Graceful shutdown coordinator.
///
/// Broadcasts shutdown through a `CancellationToken`: the listener stops
/// accepting, background loops (health probe, limiter sweep) exit, and
/// in-flight sessions are torn down by their own child tokens.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token handed to every component that must observe shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger_shutdown(&self) {
        info!("shutdown signal received, broadcasting to all tasks");
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then trigger coordinated shutdown.
    pub async fn wait_for_signal_and_shutdown(&self) {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT (Ctrl+C)");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }

        self.trigger_shutdown();
    }

}

/// Block until `live_count` reports zero, polling every second, capped at
/// [`DRAIN_TIMEOUT`]. Returns true when fully drained.
pub async fn drain_sessions(live_count: impl Fn() -> usize) -> bool {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        let remaining = live_count();
        if remaining == 0 {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            info!(remaining, "drain timeout reached, proceeding with shutdown");
            return false;
        }
        info!(remaining, "waiting for live sessions to finish");
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_trigger_cancels_token() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        assert!(!token.is_cancelled());
        coordinator.trigger_shutdown();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_when_sessions_finish() {
        let live = Arc::new(AtomicUsize::new(2));

        let counter = live.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            counter.store(0, Ordering::SeqCst);
        });

        let drained = drain_sessions(move || live.load(Ordering::SeqCst)).await;
        assert!(drained);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_timeout() {
        let drained = drain_sessions(|| 1).await;
        assert!(!drained);
    }
}
