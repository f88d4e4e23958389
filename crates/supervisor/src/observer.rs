//! Where state changes and log lines go.

use crate::state::{GatewayState, LogLevel, LogLine};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receives everything the supervisor wants its caller to see.
///
/// Called from the supervisor task and from the child output readers, so
/// implementations must be cheap and must not block.
pub trait SupervisorObserver: Send + Sync {
    fn on_state_change(&self, state: GatewayState);
    fn on_log(&self, level: LogLevel, message: &str);
}

/// Emits state changes and log lines as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SupervisorObserver for TracingObserver {
    fn on_state_change(&self, state: GatewayState) {
        tracing::info!(target: "clawdesk::gateway", %state, "Gateway state changed");
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => tracing::info!(target: "clawdesk::gateway", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "clawdesk::gateway", "{}", message),
            LogLevel::Error => tracing::error!(target: "clawdesk::gateway", "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    State(GatewayState),
    Log(LogLine),
}

/// Publishes every notification on an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SupervisorObserver for ChannelObserver {
    fn on_state_change(&self, state: GatewayState) {
        let _ = self.tx.send(SupervisorEvent::State(state));
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        let _ = self.tx.send(SupervisorEvent::Log(log_line(level, message)));
    }
}

pub const DEFAULT_HISTORY_LINES: usize = 200;

/// Keeps the most recent log lines and forwards everything to an inner observer.
pub struct LogHistory {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
    inner: Arc<dyn SupervisorObserver>,
}

impl LogHistory {
    pub fn new(inner: Arc<dyn SupervisorObserver>) -> Self {
        Self::with_capacity(DEFAULT_HISTORY_LINES, inner)
    }

    pub fn with_capacity(capacity: usize, inner: Arc<dyn SupervisorObserver>) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            inner,
        }
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.lock().iter().cloned().collect()
    }
}

impl SupervisorObserver for LogHistory {
    fn on_state_change(&self, state: GatewayState) {
        self.inner.on_state_change(state);
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        {
            let mut lines = self.lines.lock();
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(log_line(level, message));
        }
        self.inner.on_log(level, message);
    }
}

fn log_line(level: LogLevel, message: &str) -> LogLine {
    LogLine {
        level,
        message: message.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}
