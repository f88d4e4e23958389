//! Metrics instrumentation for the gateway client.

/// Increment reconnect attempt counter.
pub fn increment_reconnects() {
    metrics::counter!("client_reconnects", 1);
}

/// Increment request counter.
pub fn increment_requests() {
    metrics::counter!("client_requests", 1);
}

/// Record time from socket open to `hello-ok`.
pub fn record_handshake_latency(duration_ms: f64) {
    metrics::histogram!("client_handshake_ms", duration_ms);
}
