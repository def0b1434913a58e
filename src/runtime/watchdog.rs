//! Blocking-operation watchdog for detecting stalls
//!
//! Low-overhead monitoring using atomic timestamps instead of locks.
//! Each blocking operation (port drain, tunnel drain, completion wait) stores
//! its start time in an atomic variable, and the watchdog periodically scans
//! these timestamps to report operations stuck past the threshold.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{info, warn};

use super::lock;

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Shared state for a single monitored operation
struct OperationState {
    /// Timestamp (ms since epoch) when current operation started, or 0 if idle
    last_op_start: AtomicU64,
    /// Track if we've already warned about this operation being blocked
    has_warned: AtomicBool,
    scope: String,
    target: String,
    operation: String, // "drain", "await", etc.
}

/// Handle to one operation's watchdog state
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<OperationState>,
}

impl WatchdogHandle {
    /// Mark the start of a blocking operation (stores current timestamp)
    #[inline(always)]
    pub fn start_operation(&self) {
        self.state.last_op_start.store(now_millis(), Ordering::Relaxed);
        self.state.has_warned.store(false, Ordering::Relaxed);
    }

    /// Mark the end of a blocking operation (clears timestamp to 0)
    #[inline(always)]
    pub fn finish_operation(&self) {
        if self.state.has_warned.swap(false, Ordering::Relaxed) {
            info!(
                "UNBLOCKED: [{}] {} on '{}'",
                self.state.scope, self.state.operation, self.state.target
            );
        }
        self.state.last_op_start.store(0, Ordering::Relaxed);
    }
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    operations: Arc<Mutex<Vec<Weak<OperationState>>>>,
    threshold: Duration,
}

impl Watchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            operations: Arc::new(Mutex::new(Vec::new())),
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Register an operation for monitoring
    pub fn register(&self, scope: &str, operation: &str, target: &str) -> WatchdogHandle {
        let state = Arc::new(OperationState {
            last_op_start: AtomicU64::new(0),
            has_warned: AtomicBool::new(false),
            scope: scope.to_string(),
            target: target.to_string(),
            operation: operation.to_string(),
        });

        lock(&self.operations).push(Arc::downgrade(&state));

        WatchdogHandle { state }
    }

    /// Warn once about each operation blocked past the threshold; returns how many are blocked
    pub fn check_for_blocked(&self) -> usize {
        let now = now_millis();
        let threshold_ms = self.threshold.as_millis() as u64;
        let mut blocked = 0;

        let mut operations = lock(&self.operations);

        // Remove dead weak references and check live ones
        operations.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let start = state.last_op_start.load(Ordering::Relaxed);
            if start > 0 {
                let duration_ms = now.saturating_sub(start);
                if duration_ms > threshold_ms {
                    blocked += 1;
                    if !state.has_warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            "BLOCKED: [{}] {} on '{}' for {:.1}s",
                            state.scope,
                            state.operation,
                            state.target,
                            duration_ms as f64 / 1000.0
                        );
                    }
                }
            }
            true
        });
        blocked
    }

    /// Start the monitoring thread; it stops when the returned guard is dropped
    pub fn start_monitoring_thread(&self) -> MonitorGuard {
        let watchdog = self.clone();
        let interval = (self.threshold / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        watchdog.check_for_blocked();
                    }
                    _ => break,
                }
            }
        });
        MonitorGuard {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Keeps the monitoring thread alive; stops and joins it on drop
pub struct MonitorGuard {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// RAII guard for tracking an operation - near-zero cost (just atomic stores)
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_operation();
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_operation();
    }
}
