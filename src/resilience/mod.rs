//! Per-session resilience machinery: circuit breaking, retry with backoff,
//! admission limiting and buffer pooling.

pub mod breaker;
pub mod bufpool;
pub mod connlimit;
pub mod ratelimit;
pub mod retry;

pub use breaker::{Breaker, BreakerState};
pub use bufpool::BufferPool;
pub use connlimit::ConnectionLimiter;
pub use ratelimit::RateLimiter;
pub use retry::RetryPolicy;
