//! The relay engine: listener, per-session orchestration, upstream
//! selection and health, and the live-session index.

pub mod conn;
pub mod pool;
pub mod server;
pub mod session;
pub mod tracker;
pub mod upstream;

pub use pool::{HealthCheckSettings, UpstreamPool, UpstreamStatus};
pub use server::RelayServer;
pub use tracker::{SessionInfo, SessionState, SessionTracker};
pub use upstream::{parse_upstream, UpstreamInfo};
