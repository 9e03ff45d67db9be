use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::duration::{parse_duration, ConfigDuration};
use crate::core::error::RelayError;
use crate::core::validate::validate_upstream_url;

pub const MIN_BUFFER_SIZE: usize = 4 * 1024;
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const STRATEGY_ROUND_ROBIN: &str = "round_robin";
const STRATEGY_RANDOM: &str = "random";

/// Security-related settings: connect-token auth and listener TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub requests_per_sec: f64,
    #[serde(default)]
    pub burst: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionLimitConfig {
    /// 0 = unlimited.
    #[serde(default)]
    pub max_total_connections: i64,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_per_ip: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_reset_timeout_sec")]
    pub reset_timeout_sec: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_max_failures() -> u32 {
    5
}
fn default_reset_timeout_sec() -> u64 {
    30
}
fn default_success_threshold() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_failures: default_max_failures(),
            reset_timeout_sec: default_reset_timeout_sec(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub initial_delay_sec: u64,
    #[serde(default)]
    pub max_delay_sec: u64,
    #[serde(default)]
    pub multiplier: f64,
    /// Fraction of the backoff delay used as symmetric jitter, in [0, 1].
    #[serde(default)]
    pub jitter_fraction: f64,
}

/// A single upstream target with a selection weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEndpoint {
    pub url: String,
    #[serde(default)]
    pub weight: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamHealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval_sec: u64,
    #[serde(default)]
    pub timeout_sec: u64,
}

/// Transcoding settings for the FLV passthrough path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "ffmpeg" (default) or "libav".
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub video_codec: String,
    #[serde(default)]
    pub audio_codec: String,
    #[serde(default)]
    pub preset: String,
    #[serde(default)]
    pub crf: u32,
    /// Keyframe interval: a frame count ("60") or a duration ("2s").
    #[serde(default)]
    pub gop: String,
}

/// Top-level relay configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Bind address for the external observability surface. The relay core
    /// records metrics but does not serve this address itself.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub upstreams: Vec<UpstreamEndpoint>,
    #[serde(default)]
    pub upstream_strategy: String,
    #[serde(default)]
    pub upstream_health_check: UpstreamHealthCheckConfig,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: ConfigDuration,
    #[serde(default = "default_buffer")]
    pub read_buffer: usize,
    #[serde(default = "default_buffer")]
    pub write_buffer: usize,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub connection_limit: ConnectionLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
}

fn default_listen_addr() -> String {
    ":1935".to_string()
}
fn default_http_addr() -> String {
    ":8080".to_string()
}
fn default_idle_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(30)
}
fn default_buffer() -> usize {
    64 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            http_addr: default_http_addr(),
            upstream: String::new(),
            upstreams: Vec::new(),
            upstream_strategy: STRATEGY_ROUND_ROBIN.to_string(),
            upstream_health_check: UpstreamHealthCheckConfig::default(),
            idle_timeout: default_idle_timeout(),
            read_buffer: default_buffer(),
            write_buffer: default_buffer(),
            security: SecurityConfig::default(),
            rate_limit: RateLimitConfig::default(),
            connection_limit: ConnectionLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            transcode: TranscodeConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("read {}: {e}", path.display())))?;
        let cfg: Config = serde_json::from_str(&data)
            .map_err(|e| RelayError::Config(format!("decode {}: {e}", path.display())))?;
        Ok(cfg)
    }

    /// Check the whole surface; any violation is fatal at startup.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.listen_addr.is_empty() {
            return Err(RelayError::Config("listen_addr is required".into()));
        }
        for (name, value) in [
            ("read_buffer", self.read_buffer),
            ("write_buffer", self.write_buffer),
        ] {
            if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&value) {
                return Err(RelayError::Config(format!(
                    "{name} must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE} bytes"
                )));
            }
        }

        let strategy = self.upstream_strategy.trim().to_ascii_lowercase();
        if !strategy.is_empty()
            && strategy != STRATEGY_ROUND_ROBIN
            && strategy != STRATEGY_RANDOM
        {
            return Err(RelayError::Config(
                "upstream_strategy must be round_robin or random".into(),
            ));
        }

        if self.upstreams.is_empty() {
            if self.upstream.is_empty() {
                return Err(RelayError::Config("upstream is required".into()));
            }
            validate_upstream_url(&self.upstream)?;
        } else {
            for (i, endpoint) in self.upstreams.iter().enumerate() {
                if endpoint.url.trim().is_empty() {
                    return Err(RelayError::Config(format!(
                        "upstreams[{i}] url is required"
                    )));
                }
                if endpoint.weight < 0 {
                    return Err(RelayError::Config(format!(
                        "upstreams[{i}] weight must be >= 0"
                    )));
                }
                validate_upstream_url(&endpoint.url)
                    .map_err(|e| RelayError::Config(format!("upstreams[{i}]: {e}")))?;
            }
        }

        if self.security.auth_enabled && self.security.auth_tokens.is_empty() {
            return Err(RelayError::Config(
                "auth_enabled requires at least one auth token".into(),
            ));
        }
        if self.security.tls_enabled
            && (self.security.tls_cert.trim().is_empty()
                || self.security.tls_key.trim().is_empty())
        {
            return Err(RelayError::Config(
                "tls_enabled requires tls_cert and tls_key".into(),
            ));
        }

        if self.transcode.enabled {
            validate_gop(&self.transcode.gop)?;
        }

        Ok(())
    }

    /// Normalized strategy name; empty input means round_robin.
    pub fn strategy(&self) -> String {
        let s = self.upstream_strategy.trim().to_ascii_lowercase();
        if s.is_empty() {
            STRATEGY_ROUND_ROBIN.to_string()
        } else {
            s
        }
    }

    /// Bind address with the Go-style bare-port shorthand (":1935")
    /// expanded to all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }
}

/// Validate a GOP specifier: a positive integer frame count or a positive
/// duration string. Empty means "use the encoder default".
pub fn validate_gop(gop: &str) -> Result<(), RelayError> {
    let gop = gop.trim();
    if gop.is_empty() {
        return Ok(());
    }
    if let Ok(frames) = gop.parse::<i64>() {
        if frames <= 0 {
            return Err(RelayError::Config(
                "transcode.gop must be a positive frame count or duration".into(),
            ));
        }
        return Ok(());
    }
    match parse_duration(gop) {
        Ok(d) if !d.is_zero() => Ok(()),
        _ => Err(RelayError::Config(
            "transcode.gop must be a positive frame count or duration".into(),
        )),
    }
}
