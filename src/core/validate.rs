use std::net::IpAddr;

use crate::core::error::RelayError;

/// Hostnames that must never be used as an upstream, regardless of what they
/// resolve to. Covers the usual cloud metadata and container-host aliases.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "169.254.169.254",
    "metadata.google.internal",
    "kubernetes.default",
    "host.docker.internal",
];

/// Validate an upstream URL against SSRF targets.
///
/// Applied both at config load and to any dynamically supplied upstream:
/// checks the scheme, requires a host, bounds the port, and rejects
/// private / loopback / link-local / multicast / unspecified addresses as
/// well as the cloud metadata endpoint.
pub fn validate_upstream_url(upstream: &str) -> Result<(), RelayError> {
    if upstream.is_empty() {
        return Err(RelayError::Config("upstream URL cannot be empty".into()));
    }

    let normalized = if upstream.contains("://") {
        upstream.to_string()
    } else {
        format!("rtmp://{upstream}")
    };

    let (scheme, rest) = normalized
        .split_once("://")
        .ok_or_else(|| RelayError::Config(format!("invalid upstream URL {upstream:?}")))?;

    match scheme {
        "rtmp" | "rtmps" | "rtsp" | "rtsps" => {}
        other => {
            return Err(RelayError::Config(format!(
                "unsupported scheme {other:?} (must be rtmp, rtmps, rtsp, or rtsps)"
            )));
        }
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let (host, port) = split_host_port(authority);

    if host.is_empty() {
        return Err(RelayError::Config(
            "upstream URL must include a host".into(),
        ));
    }

    if let Some(port) = port {
        match port.parse::<u32>() {
            Ok(p) if (1..=65535).contains(&p) => {}
            _ => {
                return Err(RelayError::Config(format!(
                    "invalid port {port:?}: must be 1-65535"
                )));
            }
        }
    }

    check_host(&host)
}

/// Split an authority into (host, optional port), honoring IPv6 brackets.
pub(crate) fn split_host_port(authority: &str) -> (String, Option<String>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').map(|p| p.to_string());
            return (host.to_string(), port);
        }
        return (rest.to_string(), None);
    }
    match authority.rsplit_once(':') {
        // A second ':' means an unbracketed IPv6 literal, not a port.
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), Some(port.to_string()))
        }
        _ => (authority.to_string(), None),
    }
}

fn check_host(host: &str) -> Result<(), RelayError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return check_ip(ip, host);
    }

    for blocked in BLOCKED_HOSTNAMES {
        if host.eq_ignore_ascii_case(blocked) {
            return Err(RelayError::Config(format!("upstream cannot use {host}")));
        }
    }
    Ok(())
}

fn check_ip(ip: IpAddr, host: &str) -> Result<(), RelayError> {
    if ip.is_loopback() {
        return Err(RelayError::Config(format!(
            "upstream cannot be loopback address {host}"
        )));
    }
    if is_private(ip) {
        return Err(RelayError::Config(format!(
            "upstream cannot be in private IP range: {host}"
        )));
    }
    if is_link_local(ip) {
        return Err(RelayError::Config(format!(
            "upstream cannot be link-local address: {host}"
        )));
    }
    if ip.is_multicast() {
        return Err(RelayError::Config(format!(
            "upstream cannot be multicast address: {host}"
        )));
    }
    if ip.is_unspecified() {
        return Err(RelayError::Config(format!(
            "upstream cannot be unspecified address: {host}"
        )));
    }
    if ip == IpAddr::from([169, 254, 169, 254]) {
        return Err(RelayError::Config(format!(
            "upstream cannot be cloud metadata endpoint: {host}"
        )));
    }
    Ok(())
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        // Unique-local fc00::/7 is the v6 analogue of RFC 1918.
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
