use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ---------------------------------------------------------------------------
// Metrics catalog
// ---------------------------------------------------------------------------

/// Register all metric descriptors at startup.
///
/// Must be called once before any metrics are recorded so Prometheus
/// exposition carries descriptions.
pub fn describe_all_metrics() {
    describe_counter!(
        "streamrelay_connections_total",
        "Total accepted downstream connections"
    );
    describe_counter!(
        "streamrelay_connections_succeeded_total",
        "Sessions that completed without error"
    );
    describe_counter!(
        "streamrelay_connection_errors_total",
        "Sessions that ended with an error, by kind"
    );
    describe_gauge!(
        "streamrelay_active_sessions",
        "Currently live relay sessions"
    );
    describe_histogram!(
        "streamrelay_connection_duration_seconds",
        "Session lifetime from accept to teardown"
    );
    describe_histogram!(
        "streamrelay_upstream_dial_seconds",
        "Time from upstream selection to completed upstream handshake"
    );
    describe_counter!(
        "streamrelay_bytes_transferred_total",
        "Relayed bytes by direction"
    );
    describe_counter!(
        "streamrelay_auth_failures_total",
        "Connect commands rejected by the authenticator"
    );
    describe_counter!(
        "streamrelay_rate_limit_rejections_total",
        "Connections denied by the per-IP rate limiter"
    );
    describe_counter!(
        "streamrelay_connection_limit_rejections_total",
        "Connections denied by the connection limiter"
    );
    describe_counter!(
        "streamrelay_upstream_errors_total",
        "Upstream failures by stage (select, parse, dial, handshake)"
    );
    describe_gauge!(
        "streamrelay_upstream_healthy",
        "Healthy endpoints in the upstream pool"
    );
}

// ---------------------------------------------------------------------------
// Recording helpers
// ---------------------------------------------------------------------------

pub fn inc_connection_start() {
    counter!("streamrelay_connections_total").increment(1);
}

pub fn inc_connection_success() {
    counter!("streamrelay_connections_succeeded_total").increment(1);
}

pub fn inc_connection_error(kind: &str) {
    counter!("streamrelay_connection_errors_total", "kind" => kind.to_string()).increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!("streamrelay_active_sessions").set(count as f64);
}

pub fn record_connection_duration(seconds: f64) {
    histogram!("streamrelay_connection_duration_seconds").record(seconds);
}

pub fn record_dial_latency(seconds: f64) {
    histogram!("streamrelay_upstream_dial_seconds").record(seconds);
}

pub fn add_bytes_transferred(direction: &'static str, bytes: u64) {
    counter!("streamrelay_bytes_transferred_total", "direction" => direction).increment(bytes);
}

pub fn inc_auth_failure() {
    counter!("streamrelay_auth_failures_total").increment(1);
}

pub fn inc_rate_limit_rejection() {
    counter!("streamrelay_rate_limit_rejections_total").increment(1);
}

pub fn inc_connection_limit_rejection() {
    counter!("streamrelay_connection_limit_rejections_total").increment(1);
}

pub fn inc_upstream_error(stage: &'static str) {
    counter!("streamrelay_upstream_errors_total", "stage" => stage).increment(1);
}

pub fn set_upstream_healthy(count: usize) {
    gauge!("streamrelay_upstream_healthy").set(count as f64);
}

// ---------------------------------------------------------------------------
// Prometheus recorder installation
// ---------------------------------------------------------------------------

/// Install the global Prometheus recorder and return its render handle.
///
/// Serving the handle (the `/metrics` endpoint) is left to the embedding
/// process; the relay core only records.
pub fn install_prometheus_recorder() -> metrics_exporter_prometheus::PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder")
}
