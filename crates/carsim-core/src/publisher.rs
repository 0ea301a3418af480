//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Broker connection supervision and data-point publishing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::{debug, warn};

use crate::classify::log_failure;
use crate::metrics::Counters;
use crate::supervisor::Shared;
use crate::transport::BrokerChannel;
use crate::{FeederError, Result};

/// Caller-side handle that pushes values for registered data-points.
///
/// Publishing never waits for registration: without an active registration
/// the call fails immediately with [`FeederError::NotRegistered`].
pub struct Publisher<C: BrokerChannel> {
    shared: Arc<Shared<C>>,
}

impl<C: BrokerChannel> Publisher<C> {
    pub(crate) fn new(shared: Arc<Shared<C>>) -> Self {
        Self { shared }
    }

    /// Send one value for `name`.
    ///
    /// A fatal broker failure marks the connection lost before the error is
    /// returned, so the supervisor re-registers after the next reconnect.
    /// Nothing is retried here.
    pub fn publish(&self, name: &str, value: f32) -> Result<()> {
        let (registration, epoch) = self.shared.active_registration(name)?;
        let id = registration
            .id(name)
            .ok_or_else(|| FeederError::UnknownDataPoint {
                name: name.to_owned(),
            })?;

        debug!(datapoint = name, id, value, "feeding datapoint");
        match self.shared.channel.update_datapoint(id, value) {
            Ok(()) => {
                Counters::bump(&self.shared.counters.publishes);
                Ok(())
            }
            Err(status) => {
                Counters::bump(&self.shared.counters.publish_failures);
                warn!(datapoint = name, "feeding datapoint failed");
                if log_failure("feeding", &status).is_fatal() {
                    self.shared.mark_disconnected(epoch, "feeding failed");
                }
                Err(FeederError::Rpc(status))
            }
        }
    }
}

impl<C: BrokerChannel> Clone for Publisher<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}
