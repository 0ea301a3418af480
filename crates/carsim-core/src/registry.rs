//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Broker connection supervision and data-point publishing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use carsim_common::config::DataPointSpec;
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::datapoint::DataPointRegistration;
use crate::transport::BrokerChannel;
use crate::{FeederError, Result};

/// Performs the one-shot "register every data-point" call.
///
/// Holds no retry policy of its own; the supervisor decides when to call.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    specs: Vec<DataPointSpec>,
}

impl RegistryClient {
    /// Create a client for the given ordered batch of specs.
    pub fn new(specs: Vec<DataPointSpec>) -> Self {
        Self { specs }
    }

    /// Specs sent on every registration.
    pub fn specs(&self) -> &[DataPointSpec] {
        &self.specs
    }

    /// Register all specs in a single batch.
    ///
    /// Either every configured name gets an identifier or the call fails; a
    /// response missing any name is rejected as [`FeederError::Unexpected`].
    pub fn register_all<C>(&self, channel: &C) -> Result<DataPointRegistration>
    where
        C: BrokerChannel + ?Sized,
    {
        debug!(count = self.specs.len(), "registering datapoints");
        let mut results = channel.register_datapoints(&self.specs)?;

        let mut ids = IndexMap::with_capacity(self.specs.len());
        for spec in &self.specs {
            let id = results.remove(&spec.name).ok_or_else(|| {
                FeederError::Unexpected(format!(
                    "registration response has no identifier for '{}'",
                    spec.name
                ))
            })?;
            ids.insert(spec.name.clone(), id);
        }
        if !results.is_empty() {
            debug!(extra = results.len(), "broker returned identifiers for unrequested names");
        }

        let registration = DataPointRegistration::new(ids);
        for (name, id) in registration.iter() {
            info!(datapoint = name, id, "datapoint registered");
        }
        Ok(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectivityCallback;
    use carsim_common::config::{ChangeType, DataType};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tonic::Status;

    struct CannedChannel {
        reply: Mutex<Option<std::result::Result<HashMap<String, i32>, Status>>>,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl CannedChannel {
        fn new(reply: std::result::Result<HashMap<String, i32>, Status>) -> Self {
            Self {
                reply: Mutex::new(Some(reply)),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    impl BrokerChannel for CannedChannel {
        fn subscribe(&self, _callback: ConnectivityCallback) {}

        fn register_datapoints(
            &self,
            specs: &[DataPointSpec],
        ) -> std::result::Result<HashMap<String, i32>, Status> {
            self.batches
                .lock()
                .push(specs.iter().map(|s| s.name.clone()).collect());
            self.reply.lock().take().expect("single registration call")
        }

        fn update_datapoint(&self, _id: i32, _value: f32) -> std::result::Result<(), Status> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn specs() -> Vec<DataPointSpec> {
        vec![
            DataPointSpec::new("Vehicle.Speed", DataType::Float, ChangeType::Continuous),
            DataPointSpec::new("Vehicle.Acceleration", DataType::Float, ChangeType::Continuous),
        ]
    }

    #[test]
    fn registers_every_spec_in_one_batch() {
        let channel = CannedChannel::new(Ok(HashMap::from([
            ("Vehicle.Speed".to_owned(), 1),
            ("Vehicle.Acceleration".to_owned(), 2),
        ])));
        let registration = RegistryClient::new(specs()).register_all(&channel).unwrap();

        assert_eq!(registration.id("Vehicle.Speed"), Some(1));
        assert_eq!(registration.id("Vehicle.Acceleration"), Some(2));
        assert_eq!(
            *channel.batches.lock(),
            vec![vec![
                "Vehicle.Speed".to_owned(),
                "Vehicle.Acceleration".to_owned()
            ]]
        );
    }

    #[test]
    fn incomplete_response_is_rejected_whole() {
        let channel =
            CannedChannel::new(Ok(HashMap::from([("Vehicle.Speed".to_owned(), 1)])));
        let err = RegistryClient::new(specs())
            .register_all(&channel)
            .unwrap_err();
        assert!(matches!(err, FeederError::Unexpected(ref msg) if msg.contains("Vehicle.Acceleration")));
    }

    #[test]
    fn rpc_failure_is_propagated_raw() {
        let channel = CannedChannel::new(Err(Status::unauthenticated("token expired")));
        let err = RegistryClient::new(specs())
            .register_all(&channel)
            .unwrap_err();
        match err {
            FeederError::Rpc(status) => {
                assert_eq!(status.code(), tonic::Code::Unauthenticated);
                assert_eq!(status.message(), "token expired");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
