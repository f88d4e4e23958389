use std::time::Duration;

/// Smallest delay the schedule will produce, whatever the policy says.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Reconnect delay schedule: start at `floor`, multiply by `factor` after
/// every failed attempt, never exceed `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub floor: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(800),
            max: Duration::from_millis(15_000),
            factor: 1.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current = start_delay(&policy);
        Self { policy, current }
    }

    /// Delay to wait now. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = if self.policy.factor.is_finite() && self.policy.factor >= 1.0 {
            self.current.mul_f64(self.policy.factor)
        } else {
            self.current
        };
        self.current = grown.max(self.current).min(self.policy.max).max(MIN_DELAY);
        delay
    }

    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = start_delay(&self.policy);
    }
}

fn start_delay(policy: &ReconnectPolicy) -> Duration {
    policy.floor.min(policy.max).max(MIN_DELAY)
}
