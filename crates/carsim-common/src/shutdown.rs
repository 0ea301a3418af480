//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the feeder runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot stop flag that background threads can sleep on.
///
/// `wait_timeout` replaces a plain `thread::sleep` so that a shutdown request
/// wakes the sleeper instead of waiting out the remaining interval.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    triggered: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter. Returns `false` if it was
    /// already triggered.
    pub fn trigger(&self) -> bool {
        let mut triggered = self.inner.triggered.lock();
        if *triggered {
            return false;
        }
        *triggered = true;
        self.inner.condvar.notify_all();
        true
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Sleep for `timeout` or until shutdown is triggered, whichever comes
    /// first. Returns `true` when shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.inner.triggered.lock();
        while !*triggered {
            if self
                .inner
                .condvar
                .wait_until(&mut triggered, deadline)
                .timed_out()
            {
                break;
            }
        }
        *triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_when_not_triggered() {
        let signal = ShutdownSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn trigger_wakes_sleeping_thread() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let stopped = waiter.wait_timeout(Duration::from_secs(30));
            (stopped, started.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        assert!(signal.trigger());
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
        assert!(signal.wait_timeout(Duration::from_secs(30)));
    }
}
