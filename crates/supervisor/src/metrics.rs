//! Metrics instrumentation for gateway supervision.

/// Increment failed health probe counter.
pub fn increment_health_failures() {
    metrics::counter!("gateway_health_failures", 1);
}

/// Increment gateway restart counter.
pub fn increment_restarts() {
    metrics::counter!("gateway_restarts", 1);
}

/// Increment adopted gateway counter.
pub fn increment_adoptions() {
    metrics::counter!("gateway_adoptions", 1);
}
