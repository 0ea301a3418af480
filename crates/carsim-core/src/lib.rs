//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Broker connection supervision and data-point publishing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Connection supervision for feeding values into the vehicle data broker.
//!
//! The [`ConnectionSupervisor`] owns a [`BrokerChannel`], reacts to its
//! connectivity notifications, registers the configured data-points once per
//! connection, and hands out [`Publisher`] handles that callers use to push
//! values from any thread.
#![warn(missing_docs)]

pub mod classify;
pub mod datapoint;
pub mod metrics;
pub mod publisher;
pub mod registry;
pub mod supervisor;
pub mod transport;

use classify::FailureClass;

/// Shared result type for feeder operations.
pub type Result<T> = std::result::Result<T, FeederError>;

/// Failures surfaced by registration, publishing, and supervisor lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum FeederError {
    /// The broker RPC failed; the status carries the transport code and details.
    #[error("broker rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
    /// The broker answered, but the response could not be used.
    #[error("unexpected broker response: {0}")]
    Unexpected(String),
    /// A publish was attempted while no registration is active.
    #[error("datapoint '{name}' cannot be published: datapoints are not registered with the broker")]
    NotRegistered {
        /// Data-point the caller tried to publish.
        name: String,
    },
    /// The active registration has no identifier for this name.
    #[error("datapoint '{name}' is not part of the broker registration")]
    UnknownDataPoint {
        /// Data-point the caller tried to publish.
        name: String,
    },
    /// The supervisor was shut down.
    #[error("connection supervisor has been shut down")]
    ShutDown,
    /// The channel to the broker could not be opened.
    #[error("failed to open broker channel: {0}")]
    Channel(String),
    /// Spawning the supervisor thread failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FeederError {
    /// Classification of the underlying RPC failure, if this is one.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            FeederError::Rpc(status) => Some(classify::classify(status)),
            _ => None,
        }
    }

    /// Whether the caller used the API incorrectly rather than the broker failing.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            FeederError::NotRegistered { .. } | FeederError::UnknownDataPoint { .. }
        )
    }
}

pub use classify::{classify, classify_code, log_failure};
pub use datapoint::{DataPointId, DataPointRegistration};
pub use metrics::SupervisorMetrics;
pub use publisher::Publisher;
pub use registry::RegistryClient;
pub use supervisor::{ConnectionSupervisor, SupervisorStatus};
pub use transport::{BrokerChannel, BrokerConnector, ConnectivityCallback, ConnectivityState};
