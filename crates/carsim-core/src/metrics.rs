//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Broker connection supervision and data-point publishing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of supervisor counters used for diagnostics and shutdown reports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorMetrics {
    /// Registration calls issued, from the loop or the connectivity handler.
    pub registration_attempts: u64,
    /// Registrations that completed and were committed.
    pub registrations: u64,
    /// Registration calls that failed.
    pub registration_failures: u64,
    /// Publish calls that reached the broker successfully.
    pub publishes: u64,
    /// Publish calls that failed at the broker.
    pub publish_failures: u64,
    /// Transitions from connected to disconnected.
    pub disconnects: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) registration_attempts: AtomicU64,
    pub(crate) registrations: AtomicU64,
    pub(crate) registration_failures: AtomicU64,
    pub(crate) publishes: AtomicU64,
    pub(crate) publish_failures: AtomicU64,
    pub(crate) disconnects: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SupervisorMetrics {
        SupervisorMetrics {
            registration_attempts: self.registration_attempts.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            registration_failures: self.registration_failures.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}
