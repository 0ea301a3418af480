//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Broker connection supervision and data-point publishing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Connection supervisor: tracks broker connectivity and keeps the data-point
//! registration current across reconnects.
//!
//! Two execution contexts mutate the shared state: the supervisor loop thread
//! (plus the transport thread delivering connectivity notifications) and any
//! caller thread publishing values. `connected`, `registered`, and the active
//! registration live behind one mutex and are always read and written
//! together. No lock is held across a broker call.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use carsim_common::config::{DataPointSpec, FeederConfig, SupervisorConfig};
use carsim_common::ShutdownSignal;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::classify::log_failure;
use crate::datapoint::DataPointRegistration;
use crate::metrics::{Counters, SupervisorMetrics};
use crate::publisher::Publisher;
use crate::registry::RegistryClient;
use crate::transport::{BrokerChannel, BrokerConnector, ConnectivityState};
use crate::{FeederError, Result};

const LOOP_THREAD_NAME: &str = "databroker-connector";

/// Consistent snapshot of the supervisor's connection flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// The transport last reported a usable connection.
    pub connected: bool,
    /// Data-points are registered for the current connection.
    pub registered: bool,
}

impl SupervisorStatus {
    /// Whether publishing can be attempted.
    pub fn is_ready(&self) -> bool {
        self.connected && self.registered
    }
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    registered: bool,
    registration: Option<Arc<DataPointRegistration>>,
    /// Bumped on every connect/disconnect so a registration that straddles a
    /// transition is never committed.
    epoch: u64,
    registering: bool,
    retry_after: Option<Instant>,
    last_connectivity: Option<ConnectivityState>,
    shut_down: bool,
}

impl State {
    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            connected: self.connected,
            registered: self.registered,
        }
    }

    /// Returns `true` if this dropped an established connection. The retry
    /// window belongs to the dropped connection and is cleared with it.
    fn disconnect(&mut self) -> bool {
        let was_connected = self.connected;
        self.connected = false;
        self.registered = false;
        self.registration = None;
        self.retry_after = None;
        self.epoch += 1;
        was_connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Connectivity,
    Loop,
}

#[derive(Debug)]
enum Attempt {
    Registered,
    /// Not connected, already registered, or another attempt is in flight.
    Skipped,
    /// Still inside the backoff window of the previous failure.
    Deferred,
    /// Succeeded, but connectivity changed while the call was in flight.
    Superseded,
    Failed(FeederError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    Register,
    Backoff(Duration),
    Live(u64),
    Stop,
}

pub(crate) struct Shared<C> {
    pub(crate) channel: C,
    registry: RegistryClient,
    config: SupervisorConfig,
    state: Mutex<State>,
    registered_cv: Condvar,
    shutdown: ShutdownSignal,
    pub(crate) counters: Counters,
}

impl<C: BrokerChannel> Shared<C> {
    fn new(channel: C, specs: Vec<DataPointSpec>, config: SupervisorConfig) -> Self {
        Self {
            channel,
            registry: RegistryClient::new(specs),
            config,
            state: Mutex::new(State::default()),
            registered_cv: Condvar::new(),
            shutdown: ShutdownSignal::new(),
            counters: Counters::default(),
        }
    }

    fn status(&self) -> SupervisorStatus {
        self.state.lock().status()
    }

    /// Registration to publish against and the epoch it belongs to, or the
    /// reason publishing must fail fast.
    pub(crate) fn active_registration(
        &self,
        name: &str,
    ) -> Result<(Arc<DataPointRegistration>, u64)> {
        let state = self.state.lock();
        if state.shut_down {
            return Err(FeederError::ShutDown);
        }
        match &state.registration {
            Some(registration) if state.connected && state.registered => {
                Ok((Arc::clone(registration), state.epoch))
            }
            _ => Err(FeederError::NotRegistered {
                name: name.to_owned(),
            }),
        }
    }

    /// Drop the connection after a fatal broker failure observed outside the
    /// connectivity callback. Never sets `connected`. A failure observed in an
    /// earlier epoch than the current one is stale and ignored.
    pub(crate) fn mark_disconnected(&self, epoch: u64, reason: &str) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        if state.epoch != epoch {
            debug!(reason, "ignoring failure from a superseded connection");
            return;
        }
        if state.disconnect() {
            Counters::bump(&self.counters.disconnects);
            warn!(reason, "treating data broker connection as lost");
        }
    }

    fn on_connectivity_change(&self, connectivity: ConnectivityState) {
        let mut state = self.state.lock();
        if state.shut_down {
            debug!(%connectivity, "ignoring connectivity change after shutdown");
            return;
        }
        info!(%connectivity, "connectivity changed");
        state.last_connectivity = Some(connectivity);

        if connectivity.is_usable() {
            // READY <-> IDLE flips are not reconnects.
            if state.connected {
                return;
            }
            state.connected = true;
            state.epoch += 1;
            drop(state);
            info!("connected to data broker");
            self.register_inline();
        } else if state.disconnect() {
            Counters::bump(&self.counters.disconnects);
            info!("disconnected from data broker");
        } else if connectivity == ConnectivityState::Connecting {
            info!("trying to connect to data broker");
        }
    }

    fn register_inline(&self) {
        match self.try_register(Trigger::Connectivity) {
            Attempt::Registered => info!("datapoints are registered"),
            Attempt::Skipped => debug!("registration already in flight"),
            Attempt::Deferred => debug!("registration deferred until backoff expires"),
            Attempt::Superseded => debug!("registration superseded by connectivity change"),
            Attempt::Failed(FeederError::Rpc(status)) => {
                error!("failed to register datapoints");
                log_failure("datapoint registration", &status);
            }
            Attempt::Failed(err) => error!(error = %err, "failed to register datapoints"),
        }
    }

    fn try_register(&self, trigger: Trigger) -> Attempt {
        let epoch = {
            let mut state = self.state.lock();
            if state.shut_down || !state.connected || state.registered || state.registering {
                return Attempt::Skipped;
            }
            if state.retry_after.is_some_and(|at| Instant::now() < at) {
                return Attempt::Deferred;
            }
            state.registering = true;
            state.epoch
        };

        Counters::bump(&self.counters.registration_attempts);
        debug!(?trigger, "trying to register datapoints");
        let result = self.registry.register_all(&self.channel);

        let mut state = self.state.lock();
        state.registering = false;
        match result {
            Ok(registration) => {
                if state.shut_down || !state.connected || state.epoch != epoch {
                    return Attempt::Superseded;
                }
                state.registration = Some(Arc::new(registration));
                state.registered = true;
                state.retry_after = None;
                Counters::bump(&self.counters.registrations);
                self.registered_cv.notify_all();
                Attempt::Registered
            }
            Err(err) => {
                Counters::bump(&self.counters.registration_failures);
                let backoff = match err {
                    FeederError::Rpc(_) => self.config.fatal_backoff,
                    _ => self.config.unexpected_backoff,
                };
                // a failure from a dropped connection must not throttle the next one
                if state.epoch == epoch {
                    state.retry_after = Some(Instant::now() + backoff);
                }
                Attempt::Failed(err)
            }
        }
    }

    fn next_step(&self) -> Step {
        let state = self.state.lock();
        if state.shut_down {
            return Step::Stop;
        }
        if !state.connected {
            return Step::Idle;
        }
        if state.registered {
            return Step::Live(state.epoch);
        }
        match state.retry_after {
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    Step::Register
                } else {
                    Step::Backoff(remaining)
                }
            }
            None => Step::Register,
        }
    }

    fn run(&self) {
        info!("supervisor loop started");
        loop {
            let wait = match self.next_step() {
                Step::Stop => break,
                Step::Idle => self.config.idle_poll,
                Step::Backoff(remaining) => remaining,
                Step::Register => match self.try_register(Trigger::Loop) {
                    Attempt::Registered => {
                        info!("datapoints are registered");
                        Duration::ZERO
                    }
                    Attempt::Skipped | Attempt::Deferred | Attempt::Superseded => {
                        self.config.idle_poll
                    }
                    // the retry window recorded by try_register paces the next step
                    Attempt::Failed(FeederError::Rpc(status)) => {
                        log_failure("datapoint registration", &status);
                        debug!(
                            backoff_ms = self.config.fatal_backoff.as_millis() as u64,
                            "failed to register datapoints"
                        );
                        Duration::ZERO
                    }
                    Attempt::Failed(err) => {
                        error!(error = %err, "failed to register datapoints");
                        Duration::ZERO
                    }
                },
                Step::Live(epoch) => {
                    if let Err(status) = self.channel.check_liveness() {
                        if log_failure("liveness check", &status).is_fatal() {
                            self.mark_disconnected(epoch, "liveness check failed");
                        }
                    }
                    self.config.liveness_interval
                }
            };
            if !wait.is_zero() && self.shutdown.wait_timeout(wait) {
                break;
            }
        }
        info!("supervisor loop stopped");
    }

    /// Returns `false` if shutdown had already begun.
    fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if state.shut_down {
            return false;
        }
        state.shut_down = true;
        self.shutdown.trigger();
        self.registered_cv.notify_all();
        true
    }
}

/// Owns the broker channel and the background loop that keeps the data-point
/// registration valid.
pub struct ConnectionSupervisor<C: BrokerChannel> {
    shared: Arc<Shared<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: BrokerChannel> ConnectionSupervisor<C> {
    /// Open a channel to the configured broker and start supervising it.
    pub fn start<K>(connector: &K, config: &FeederConfig) -> Result<Self>
    where
        K: BrokerConnector<Channel = C>,
    {
        info!(address = %config.broker.address, "connecting to data broker");
        let channel = connector.open(&config.broker.address)?;
        Self::with_channel(channel, config.datapoints.clone(), config.supervisor)
    }

    /// Start supervising an already opened channel.
    pub fn with_channel(
        channel: C,
        specs: Vec<DataPointSpec>,
        config: SupervisorConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new(channel, specs, config));

        let weak = Arc::downgrade(&shared);
        shared.channel.subscribe(Arc::new(move |connectivity| {
            if let Some(shared) = weak.upgrade() {
                shared.on_connectivity_change(connectivity);
            }
        }));

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_owned())
            .spawn(move || worker_shared.run())
            .map_err(|err| {
                shared.begin_shutdown();
                shared.channel.close();
                err
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Current connection flags.
    pub fn status(&self) -> SupervisorStatus {
        self.shared.status()
    }

    /// Last connectivity state the transport reported, if any.
    pub fn connectivity(&self) -> Option<ConnectivityState> {
        self.shared.state.lock().last_connectivity
    }

    /// Registration in effect, if the supervisor is registered.
    pub fn registration(&self) -> Option<Arc<DataPointRegistration>> {
        let state = self.shared.state.lock();
        if state.registered {
            state.registration.clone()
        } else {
            None
        }
    }

    /// Block until registered, shut down, or `timeout` elapses. Returns whether
    /// the supervisor is registered.
    pub fn wait_until_registered(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.shut_down {
                return false;
            }
            if state.status().is_ready() {
                return true;
            }
            if self
                .shared
                .registered_cv
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return !state.shut_down && state.status().is_ready();
            }
        }
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> SupervisorMetrics {
        self.shared.counters.snapshot()
    }

    /// Data-points this supervisor registers.
    pub fn specs(&self) -> &[DataPointSpec] {
        self.shared.registry.specs()
    }

    /// Cloneable handle for publishing from other threads.
    pub fn publisher(&self) -> Publisher<C> {
        Publisher::new(Arc::clone(&self.shared))
    }

    /// Publish a value for a registered data-point.
    pub fn publish(&self, name: &str, value: f32) -> Result<()> {
        self.publisher().publish(name, value)
    }

    /// Stop the loop and close the channel. Safe to call repeatedly and while
    /// a registration is in flight; blocks until the loop thread exits.
    pub fn shutdown(&self) {
        if self.shared.begin_shutdown() {
            info!("shutting down connection supervisor");
            self.shared.channel.close();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("supervisor loop panicked");
            }
        }
    }
}

impl<C: BrokerChannel> Drop for ConnectionSupervisor<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<C: BrokerChannel> std::fmt::Debug for ConnectionSupervisor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
