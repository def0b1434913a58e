//! One-shot completion and cancellation signals
//!
//! Both signals are a crossbeam channel whose only sender is dropped when the
//! signal fires: every receiver wakes, and receivers can be combined in a
//! [`crossbeam_channel::Select`] without polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use super::lock;

/// How a port's activation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A terminal buffer was observed
    Finished,
    /// Force-stopped, or disabled before any terminal buffer arrived
    Cancelled,
    /// Transmission failure or an error raised by a handler
    Failed(String),
}

impl Completion {
    pub fn is_failure(&self) -> bool {
        matches!(self, Completion::Failed(_))
    }
}

struct TriggerInner {
    label: String,
    outcome: OnceLock<Completion>,
    signal: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

/// Completion signal of one port activation; fires at most once
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl Trigger {
    pub fn new(label: impl Into<String>) -> Self {
        let (signal, done) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(TriggerInner {
                label: label.into(),
                outcome: OnceLock::new(),
                signal: Mutex::new(Some(signal)),
                done,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Fire with `outcome`; returns false if the trigger had already fired
    pub fn fire(&self, outcome: Completion) -> bool {
        if self.inner.outcome.set(outcome).is_err() {
            return false;
        }
        lock(&self.inner.signal).take();
        debug!("Trigger '{}' fired: {:?}", self.inner.label, self.inner.outcome.get());
        true
    }

    pub fn is_fired(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    pub fn outcome(&self) -> Option<Completion> {
        self.inner.outcome.get().cloned()
    }

    /// Block until the trigger fires
    pub fn wait(&self) -> Completion {
        let _ = self.inner.done.recv();
        self.outcome().unwrap_or(Completion::Cancelled)
    }

    /// Block up to `timeout`; `None` if the trigger has not fired by then
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        match self.inner.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => self.outcome(),
            _ => None,
        }
    }

    /// Channel that disconnects when the trigger fires, for use in a `Select`
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.done
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("label", &self.inner.label)
            .field("outcome", &self.inner.outcome.get())
            .finish()
    }
}

struct CancelInner {
    cancelled: AtomicBool,
    signal: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

/// Externally supplied request to stop a pipeline run
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (signal, done) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                signal: Mutex::new(Some(signal)),
                done,
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            lock(&self.inner.signal).take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.done
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_fires_once() {
        let trigger = Trigger::new("camera:out0");
        assert!(!trigger.is_fired());
        assert!(trigger.fire(Completion::Failed("transmission failed".into())));
        assert!(!trigger.fire(Completion::Cancelled));
        assert_eq!(
            trigger.outcome(),
            Some(Completion::Failed("transmission failed".into()))
        );
    }

    #[test]
    fn test_racing_fires_signal_once() {
        let trigger = Trigger::new("port");
        let wins = Arc::new(AtomicUsize::new(0));
        let racers: Vec<_> = (0..8)
            .map(|i| {
                let trigger = trigger.clone();
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    let outcome = if i % 2 == 0 {
                        Completion::Cancelled
                    } else {
                        Completion::Failed("tx".into())
                    };
                    if trigger.fire(outcome) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for racer in racers {
            racer.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(trigger.is_fired());
    }

    #[test]
    fn test_wait_wakes_every_waiter() {
        let trigger = Trigger::new("port");
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let trigger = trigger.clone();
                thread::spawn(move || trigger.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        trigger.fire(Completion::Finished);
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Completion::Finished);
        }
    }

    #[test]
    fn test_wait_timeout_expires() {
        let trigger = Trigger::new("port");
        assert_eq!(trigger.wait_timeout(Duration::from_millis(10)), None);
        trigger.fire(Completion::Finished);
        assert_eq!(
            trigger.wait_timeout(Duration::from_millis(10)),
            Some(Completion::Finished)
        );
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(observer.is_cancelled());
        assert!(observer.receiver().recv().is_err());
    }
}
