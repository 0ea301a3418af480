//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Broker connection supervision and data-point publishing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The surface the supervisor needs from a broker transport.

use std::collections::HashMap;
use std::sync::Arc;

use carsim_common::config::DataPointSpec;
use strum::Display;
use tonic::Status;

use crate::datapoint::DataPointId;
use crate::Result;

/// Connectivity of the underlying channel as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    /// No connection attempt in progress; calls will connect on demand.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected and able to carry calls.
    Ready,
    /// The last connection attempt failed.
    TransientFailure,
    /// The channel was closed.
    Shutdown,
}

impl ConnectivityState {
    /// Ready and idle both count as connected for registration purposes.
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectivityState::Ready | ConnectivityState::Idle)
    }
}

/// Callback invoked by the transport on every connectivity change.
pub type ConnectivityCallback = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

/// An open channel to the data broker.
///
/// All calls block the calling thread until the broker answers or the
/// transport gives up.
pub trait BrokerChannel: Send + Sync + 'static {
    /// Subscribe to connectivity changes.
    ///
    /// Must return without forcing a connection attempt. Notifications,
    /// including the initial state, are delivered asynchronously on a
    /// transport-owned thread.
    fn subscribe(&self, callback: ConnectivityCallback);

    /// Register all `specs` in one batched call, returning the identifiers the
    /// broker assigned, indexed by name.
    fn register_datapoints(
        &self,
        specs: &[DataPointSpec],
    ) -> std::result::Result<HashMap<String, DataPointId>, Status>;

    /// Update a single data-point.
    fn update_datapoint(&self, id: DataPointId, value: f32) -> std::result::Result<(), Status>;

    /// Verify the session is still alive while registered and otherwise idle.
    fn check_liveness(&self) -> std::result::Result<(), Status> {
        Ok(())
    }

    /// Close the channel. Further calls fail.
    fn close(&self);
}

/// Opens channels to a broker address.
pub trait BrokerConnector {
    /// Channel type produced by this connector.
    type Channel: BrokerChannel;

    /// Open a channel without waiting for it to connect.
    fn open(&self, address: &str) -> Result<Self::Channel>;
}
