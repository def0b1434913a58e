//! Runtime tuning knobs

use std::time::Duration;

/// Timeouts and limits shared by every object created from one [`Context`](super::Context)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// How long `disable()` waits for in-flight buffers to come home
    pub drain_timeout: Duration,
    /// Upper bound on the orchestrator's completion wait; `None` waits forever
    pub completion_deadline: Option<Duration>,
    /// How long the orchestrator keeps waiting after cancellation before tearing down anyway
    pub cancel_grace: Duration,
    /// Blocking operations longer than this are reported by the watchdog
    pub watchdog_threshold: Duration,
    /// Frames a loopback port may queue while no buffer is available
    pub backlog_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(2),
            completion_deadline: None,
            cancel_grace: Duration::from_secs(5),
            watchdog_threshold: Duration::from_secs(5),
            backlog_limit: 64,
        }
    }
}

impl RuntimeConfig {
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_completion_deadline(mut self, deadline: Duration) -> Self {
        self.completion_deadline = Some(deadline);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_watchdog_threshold(mut self, threshold: Duration) -> Self {
        self.watchdog_threshold = threshold;
        self
    }

    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit.max(1);
        self
    }
}
