//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "Scripted in-memory broker channel for supervisor tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use carsim_common::config::{ChangeType, DataPointSpec, DataType, SupervisorConfig};
use carsim_core::{
    BrokerChannel, BrokerConnector, ConnectivityCallback, ConnectivityState, DataPointId,
};
use parking_lot::{Condvar, Mutex};
use tonic::{Code, Status};

/// What the next registration call answers.
#[derive(Debug, Clone)]
pub enum RegisterReply {
    /// Assign fresh identifiers for every requested name.
    Assign,
    /// Answer with exactly this mapping.
    Exact(HashMap<String, DataPointId>),
    Fail(Code, &'static str),
}

#[derive(Default)]
struct Script {
    register: VecDeque<RegisterReply>,
    update: VecDeque<(Code, &'static str)>,
    liveness: Option<(Code, &'static str)>,
}

#[derive(Default)]
struct Record {
    attempts: Vec<Instant>,
    batches: Vec<Vec<String>>,
    updates: Vec<(DataPointId, f32)>,
    update_calls: usize,
    next_base: DataPointId,
    closed: bool,
}

#[derive(Default)]
struct Gate {
    closed: Mutex<bool>,
    cv: Condvar,
}

/// In-memory broker channel driven by the test thread.
#[derive(Clone, Default)]
pub struct ScriptedChannel {
    callbacks: Arc<Mutex<Vec<ConnectivityCallback>>>,
    script: Arc<Mutex<Script>>,
    record: Arc<Mutex<Record>>,
    record_cv: Arc<Condvar>,
    gate: Arc<Gate>,
    update_gate: Arc<Gate>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        let channel = Self::default();
        channel.record.lock().next_base = 1;
        channel
    }

    /// Deliver a connectivity notification on the calling thread, the way a
    /// transport thread would.
    pub fn notify(&self, state: ConnectivityState) {
        let callbacks: Vec<_> = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(state);
        }
    }

    pub fn script_registration(&self, reply: RegisterReply) {
        self.script.lock().register.push_back(reply);
    }

    pub fn script_update_failure(&self, code: Code, details: &'static str) {
        self.script.lock().update.push_back((code, details));
    }

    pub fn script_liveness_failure(&self, code: Code, details: &'static str) {
        self.script.lock().liveness = Some((code, details));
    }

    /// Hold every registration call inside the transport until `open_gate`.
    pub fn close_gate(&self) {
        *self.gate.closed.lock() = true;
    }

    pub fn open_gate(&self) {
        *self.gate.closed.lock() = false;
        self.gate.cv.notify_all();
    }

    /// Hold every update call inside the transport until `open_update_gate`.
    pub fn close_update_gate(&self) {
        *self.update_gate.closed.lock() = true;
    }

    pub fn open_update_gate(&self) {
        *self.update_gate.closed.lock() = false;
        self.update_gate.cv.notify_all();
    }

    pub fn subscribers(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.record.lock().attempts.clone()
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.record.lock().batches.clone()
    }

    pub fn updates(&self) -> Vec<(DataPointId, f32)> {
        self.record.lock().updates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.record.lock().closed
    }

    /// Wait until at least `count` update calls have started.
    pub fn wait_for_update_calls(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut record = self.record.lock();
        while record.update_calls < count {
            if self.record_cv.wait_until(&mut record, deadline).timed_out() {
                return record.update_calls >= count;
            }
        }
        true
    }

    /// Wait until at least `count` registration calls have started.
    pub fn wait_for_attempts(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut record = self.record.lock();
        while record.attempts.len() < count {
            if self.record_cv.wait_until(&mut record, deadline).timed_out() {
                return record.attempts.len() >= count;
            }
        }
        true
    }
}

impl BrokerChannel for ScriptedChannel {
    fn subscribe(&self, callback: ConnectivityCallback) {
        self.callbacks.lock().push(callback);
    }

    fn register_datapoints(
        &self,
        specs: &[DataPointSpec],
    ) -> Result<HashMap<String, DataPointId>, Status> {
        {
            let mut record = self.record.lock();
            record.attempts.push(Instant::now());
            record
                .batches
                .push(specs.iter().map(|spec| spec.name.clone()).collect());
            self.record_cv.notify_all();
        }
        {
            let mut closed = self.gate.closed.lock();
            while *closed {
                self.gate.cv.wait(&mut closed);
            }
        }

        let reply = self
            .script
            .lock()
            .register
            .pop_front()
            .unwrap_or(RegisterReply::Assign);
        match reply {
            RegisterReply::Assign => {
                let mut record = self.record.lock();
                let base = record.next_base;
                record.next_base += 10;
                Ok(specs
                    .iter()
                    .enumerate()
                    .map(|(index, spec)| (spec.name.clone(), base + index as DataPointId))
                    .collect())
            }
            RegisterReply::Exact(ids) => Ok(ids),
            RegisterReply::Fail(code, details) => Err(Status::new(code, details)),
        }
    }

    fn update_datapoint(&self, id: DataPointId, value: f32) -> Result<(), Status> {
        {
            let mut record = self.record.lock();
            record.update_calls += 1;
            self.record_cv.notify_all();
        }
        {
            let mut closed = self.update_gate.closed.lock();
            while *closed {
                self.update_gate.cv.wait(&mut closed);
            }
        }
        if let Some((code, details)) = self.script.lock().update.pop_front() {
            return Err(Status::new(code, details));
        }
        self.record.lock().updates.push((id, value));
        Ok(())
    }

    fn check_liveness(&self) -> Result<(), Status> {
        match self.script.lock().liveness.take() {
            Some((code, details)) => Err(Status::new(code, details)),
            None => Ok(()),
        }
    }

    fn close(&self) {
        self.record.lock().closed = true;
    }
}

/// Connector that hands out one prepared channel and remembers the address.
pub struct ScriptedConnector {
    pub channel: ScriptedChannel,
    pub opened: Mutex<Vec<String>>,
}

impl BrokerConnector for ScriptedConnector {
    type Channel = ScriptedChannel;

    fn open(&self, address: &str) -> carsim_core::Result<ScriptedChannel> {
        self.opened.lock().push(address.to_owned());
        Ok(self.channel.clone())
    }
}

pub fn vehicle_specs() -> Vec<DataPointSpec> {
    vec![
        DataPointSpec::new("Vehicle.Speed", DataType::Float, ChangeType::Continuous),
        DataPointSpec::new("Vehicle.Acceleration", DataType::Float, ChangeType::Continuous),
    ]
}

pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        idle_poll: Duration::from_millis(10),
        fatal_backoff: Duration::from_millis(50),
        unexpected_backoff: Duration::from_millis(20),
        liveness_interval: Duration::from_millis(10),
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
