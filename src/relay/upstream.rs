use crate::core::error::RelayError;
use crate::core::validate::split_host_port;

pub const DEFAULT_RTMP_PORT: u16 = 1935;
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Everything needed to dial one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamInfo {
    /// The URL as configured, used for logging and the admin surface.
    pub raw: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// `host:port` with IPv6 literals bracketed, ready for a TCP dial.
    pub address: String,
    pub use_tls: bool,
}

/// Normalize an upstream string and derive dialing info.
///
/// Inputs without a scheme are treated as `rtmp://`; the port defaults per
/// scheme (1935 for rtmp/rtmps, 554 for rtsp/rtsps).
pub fn parse_upstream(raw: &str) -> Result<UpstreamInfo, RelayError> {
    if raw.is_empty() {
        return Err(RelayError::Config("upstream is empty".into()));
    }

    let normalized = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("rtmp://{raw}")
    };

    let (scheme, rest) = normalized
        .split_once("://")
        .ok_or_else(|| RelayError::Config(format!("parse upstream {raw:?}")))?;
    let scheme = scheme.to_ascii_lowercase();

    match scheme.as_str() {
        "rtmp" | "rtmps" | "rtsp" | "rtsps" => {}
        other => {
            return Err(RelayError::Config(format!(
                "unsupported upstream scheme {other:?}"
            )));
        }
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let (host, port) = split_host_port(authority);
    if host.is_empty() {
        return Err(RelayError::Config("upstream host is empty".into()));
    }

    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| RelayError::Config(format!("invalid upstream port {p:?}")))?,
        None => default_port(&scheme),
    };

    let address = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let use_tls = scheme == "rtmps" || scheme == "rtsps";

    Ok(UpstreamInfo {
        raw: raw.to_string(),
        scheme,
        host,
        port,
        address,
        use_tls,
    })
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "rtsp" | "rtsps" => DEFAULT_RTSP_PORT,
        _ => DEFAULT_RTMP_PORT,
    }
}
