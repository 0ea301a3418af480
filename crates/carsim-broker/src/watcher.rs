//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Connectivity watcher that reports broker reachability."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use carsim_core::{ConnectivityCallback, ConnectivityState};
use parking_lot::{Condvar, Mutex};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

const WATCHER_THREAD_NAME: &str = "databroker-watcher";

#[derive(Default)]
struct WatchState {
    callbacks: Vec<ConnectivityCallback>,
    last: Option<ConnectivityState>,
    failure_pending: bool,
    started: bool,
    closed: bool,
}

struct Inner {
    target: String,
    runtime: Arc<Runtime>,
    probe_interval: Duration,
    connect_timeout: Duration,
    state: Mutex<WatchState>,
    wake: Condvar,
}

/// Reports broker reachability as connectivity transitions.
///
/// A background thread starts with the first subscriber, announces `Idle`,
/// then probes the broker endpoint with a TCP connect every probe interval.
/// Only changes are delivered, always from the watcher thread and never while
/// the watcher's lock is held.
pub(crate) struct ConnectivityWatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityWatcher {
    pub(crate) fn new(
        target: String,
        runtime: Arc<Runtime>,
        probe_interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                runtime,
                probe_interval,
                connect_timeout,
                state: Mutex::new(WatchState::default()),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn subscribe(&self, callback: ConnectivityCallback) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.callbacks.push(callback);
        if state.started {
            return;
        }
        state.started = true;
        drop(state);

        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name(WATCHER_THREAD_NAME.to_owned())
            .spawn(move || inner.run())
        {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to start connectivity watcher");
                self.inner.state.lock().started = false;
            }
        }
    }

    /// Force a `TransientFailure` report ahead of the next probe.
    pub(crate) fn report_failure(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.failure_pending = true;
        self.inner.wake.notify_all();
    }

    /// Stop probing and wait for the watcher thread. The thread announces
    /// `Shutdown` before it exits.
    pub(crate) fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            self.inner.wake.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("connectivity watcher panicked");
            }
        }
    }
}

impl Drop for ConnectivityWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn run(&self) {
        debug!(endpoint = %self.target, "connectivity watcher started");
        self.emit(ConnectivityState::Idle);
        loop {
            let forced = {
                let mut state = self.state.lock();
                if state.closed {
                    break;
                }
                std::mem::take(&mut state.failure_pending)
            };

            let observed = if forced || !self.probe() {
                ConnectivityState::TransientFailure
            } else {
                ConnectivityState::Ready
            };
            self.emit(observed);

            let mut state = self.state.lock();
            if !state.closed && !state.failure_pending {
                self.wake.wait_for(&mut state, self.probe_interval);
            }
        }
        self.emit(ConnectivityState::Shutdown);
        debug!(endpoint = %self.target, "connectivity watcher stopped");
    }

    fn probe(&self) -> bool {
        let connect = TcpStream::connect(self.target.as_str());
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(self.connect_timeout, connect).await });
        match outcome {
            Ok(Ok(_stream)) => true,
            Ok(Err(err)) => {
                debug!(endpoint = %self.target, error = %err, "broker probe failed");
                false
            }
            Err(_) => {
                debug!(endpoint = %self.target, "broker probe timed out");
                false
            }
        }
    }

    fn emit(&self, connectivity: ConnectivityState) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.closed && connectivity != ConnectivityState::Shutdown {
                return;
            }
            if state.last == Some(connectivity) {
                return;
            }
            state.last = Some(connectivity);
            state.callbacks.clone()
        };
        for callback in callbacks {
            callback(connectivity);
        }
    }
}
