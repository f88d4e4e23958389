//! Periodic health probing and consecutive-failure accounting.

use crate::config::HealthPolicy;
use crate::error::ProbeError;
use crate::probe::GatewayProbe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub(crate) struct HealthReport {
    pub generation: u64,
    pub result: Result<(), ProbeError>,
}

/// What a single failed probe means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failures: u32,
    pub should_log: bool,
    pub ceiling_reached: bool,
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    failures: u32,
    ceiling: u32,
    log_first: u32,
    log_every: u32,
}

impl HealthTracker {
    pub fn new(policy: &HealthPolicy) -> Self {
        Self {
            failures: 0,
            ceiling: policy.failure_ceiling.max(1),
            log_first: policy.log_first,
            log_every: policy.log_every,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn record_failure(&mut self) -> FailureOutcome {
        self.failures = self.failures.saturating_add(1);
        FailureOutcome {
            failures: self.failures,
            should_log: self.failures <= self.log_first
                || (self.log_every > 0 && self.failures % self.log_every == 0),
            ceiling_reached: self.failures >= self.ceiling,
        }
    }
}

/// Probe after `initial_delay`, then every `interval`, until the receiver
/// goes away or the task is aborted.
pub(crate) fn spawn_ticker(
    probe: Arc<dyn GatewayProbe>,
    port: u16,
    initial_delay: Duration,
    interval: Duration,
    generation: u64,
    reports: mpsc::UnboundedSender<HealthReport>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        loop {
            let result = probe.check_health(port).await;
            if reports.send(HealthReport { generation, result }).is_err() {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_log_throttling() {
        let mut tracker = HealthTracker::new(&HealthPolicy {
            failure_ceiling: 100,
            ..HealthPolicy::default()
        });

        let logged: Vec<u32> = (0..20)
            .map(|_| tracker.record_failure())
            .filter(|outcome| outcome.should_log)
            .map(|outcome| outcome.failures)
            .collect();

        assert_eq!(logged, vec![1, 2, 5, 10, 15, 20]);
    }

    #[test]
    fn test_ceiling_and_reset() {
        let mut tracker = HealthTracker::new(&HealthPolicy::default());
        for _ in 0..4 {
            assert!(!tracker.record_failure().ceiling_reached);
        }
        assert!(tracker.record_failure().ceiling_reached);

        tracker.record_success();
        assert_eq!(tracker.failures(), 0);
        assert!(!tracker.record_failure().ceiling_reached);
    }

    #[test]
    fn test_zero_ceiling_is_clamped() {
        let mut tracker = HealthTracker::new(&HealthPolicy {
            failure_ceiling: 0,
            ..HealthPolicy::default()
        });
        assert!(tracker.record_failure().ceiling_reached);
    }
}
