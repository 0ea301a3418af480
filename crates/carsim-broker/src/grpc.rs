//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Blocking Collector client for the vehicle data broker."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use carsim_common::config::{BrokerConfig, ChangeType, DataPointSpec, DataType};
use carsim_core::{
    classify, BrokerChannel, BrokerConnector, ConnectivityCallback, DataPointId, FeederError,
};
use tokio::runtime::Runtime;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::{debug, info};

use crate::watcher::ConnectivityWatcher;

#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("sdv.databroker.v1");
}

use proto::collector_client::CollectorClient;

const RPC_THREAD_NAME: &str = "databroker-rpc";

/// Opens [`GrpcChannel`]s with the timeouts from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
    rpc_timeout: Duration,
    probe_interval: Duration,
}

impl GrpcConnector {
    /// Capture the broker timeouts.
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            rpc_timeout: config.rpc_timeout,
            probe_interval: config.probe_interval,
        }
    }
}

impl BrokerConnector for GrpcConnector {
    type Channel = GrpcChannel;

    fn open(&self, address: &str) -> carsim_core::Result<GrpcChannel> {
        GrpcChannel::open(address, self)
    }
}

/// Collector channel with blocking calls, backed by a private tokio runtime.
///
/// The HTTP/2 connection is established lazily on the first call; reachability
/// is reported separately by the connectivity watcher. Calls must not be made
/// from inside another tokio runtime.
pub struct GrpcChannel {
    address: String,
    runtime: Arc<Runtime>,
    channel: Channel,
    watcher: ConnectivityWatcher,
}

impl GrpcChannel {
    fn open(address: &str, connector: &GrpcConnector) -> carsim_core::Result<Self> {
        let uri = endpoint_uri(address);
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|err| FeederError::Channel(format!("invalid broker address {uri}: {err}")))?
            .connect_timeout(connector.connect_timeout)
            .timeout(connector.rpc_timeout);
        let target = probe_target(&endpoint)?;

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name(RPC_THREAD_NAME)
                .enable_all()
                .build()?,
        );
        let channel = {
            let _guard = runtime.enter();
            endpoint.connect_lazy()
        };
        debug!(%uri, probe = %target, "data broker channel opened");

        let watcher = ConnectivityWatcher::new(
            target,
            Arc::clone(&runtime),
            connector.probe_interval,
            connector.connect_timeout,
        );
        Ok(Self {
            address: uri,
            runtime,
            channel,
            watcher,
        })
    }

    /// Endpoint URI this channel talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn client(&self) -> CollectorClient<Channel> {
        CollectorClient::new(self.channel.clone())
    }
}

impl BrokerChannel for GrpcChannel {
    fn subscribe(&self, callback: ConnectivityCallback) {
        self.watcher.subscribe(callback);
    }

    fn register_datapoints(
        &self,
        specs: &[DataPointSpec],
    ) -> Result<HashMap<String, DataPointId>, Status> {
        let request = proto::RegisterDatapointsRequest {
            list: specs.iter().map(registration_metadata).collect(),
        };
        let mut client = self.client();
        let reply = self
            .runtime
            .block_on(async move { client.register_datapoints(request).await })?;
        Ok(reply.into_inner().results)
    }

    fn update_datapoint(&self, id: DataPointId, value: f32) -> Result<(), Status> {
        let request = proto::UpdateDatapointsRequest {
            datapoints: HashMap::from([(
                id,
                proto::Datapoint {
                    value: Some(proto::datapoint::Value::FloatValue(value)),
                },
            )]),
        };
        let mut client = self.client();
        let outcome = self
            .runtime
            .block_on(async move { client.update_datapoints(request).await });
        match outcome {
            Ok(reply) => {
                let errors = reply.into_inner().errors;
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(rejected(&errors))
                }
            }
            Err(status) => {
                // the probe alone cannot see a broker that restarted between probes
                if classify(&status).is_fatal() {
                    self.watcher.report_failure();
                }
                Err(status)
            }
        }
    }

    fn close(&self) {
        info!(address = %self.address, "closing data broker channel");
        self.watcher.close();
    }
}

/// Accepts `host:port` as well as full URIs.
pub(crate) fn endpoint_uri(address: &str) -> String {
    let address = address.trim();
    if address.contains("://") {
        address.to_owned()
    } else {
        format!("http://{address}")
    }
}

fn probe_target(endpoint: &Endpoint) -> carsim_core::Result<String> {
    let uri = endpoint.uri();
    let host = uri
        .host()
        .ok_or_else(|| FeederError::Channel(format!("broker address {uri} has no host")))?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok(format!("{host}:{port}"))
}

fn registration_metadata(spec: &DataPointSpec) -> proto::RegistrationMetadata {
    proto::RegistrationMetadata {
        name: spec.name.clone(),
        data_type: proto::DataType::from(spec.data_type) as i32,
        description: spec.description.clone(),
        change_type: proto::ChangeType::from(spec.change_type) as i32,
    }
}

fn rejected(errors: &HashMap<i32, i32>) -> Status {
    let mut details: Vec<String> = errors
        .iter()
        .map(|(id, code)| {
            let reason = proto::DatapointError::try_from(*code)
                .map(|err| err.as_str_name())
                .unwrap_or("UNRECOGNISED");
            format!("{id}: {reason}")
        })
        .collect();
    details.sort();
    Status::invalid_argument(format!("broker rejected update ({})", details.join(", ")))
}

impl From<DataType> for proto::DataType {
    fn from(value: DataType) -> Self {
        match value {
            DataType::String => Self::String,
            DataType::Bool => Self::Bool,
            DataType::Int8 => Self::Int8,
            DataType::Int16 => Self::Int16,
            DataType::Int32 => Self::Int32,
            DataType::Int64 => Self::Int64,
            DataType::Uint8 => Self::Uint8,
            DataType::Uint16 => Self::Uint16,
            DataType::Uint32 => Self::Uint32,
            DataType::Uint64 => Self::Uint64,
            DataType::Float => Self::Float,
            DataType::Double => Self::Double,
        }
    }
}

impl From<ChangeType> for proto::ChangeType {
    fn from(value: ChangeType) -> Self {
        match value {
            ChangeType::Static => Self::Static,
            ChangeType::OnChange => Self::OnChange,
            ChangeType::Continuous => Self::Continuous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses_get_http_scheme() {
        assert_eq!(endpoint_uri("127.0.0.1:55555"), "http://127.0.0.1:55555");
        assert_eq!(endpoint_uri(" broker:55555 "), "http://broker:55555");
        assert_eq!(endpoint_uri("https://broker:443"), "https://broker:443");
    }

    #[test]
    fn probe_target_defaults_port_from_scheme() {
        let plain = Endpoint::from_static("http://broker");
        assert_eq!(probe_target(&plain).unwrap(), "broker:80");
        let tls = Endpoint::from_static("https://broker");
        assert_eq!(probe_target(&tls).unwrap(), "broker:443");
        let explicit = Endpoint::from_static("http://10.0.0.7:55555");
        assert_eq!(probe_target(&explicit).unwrap(), "10.0.0.7:55555");
    }

    #[test]
    fn metadata_carries_wire_enums() {
        let spec = DataPointSpec::new("Vehicle.Speed", DataType::Float, ChangeType::Continuous)
            .with_description("speed in km/h");
        let metadata = registration_metadata(&spec);
        assert_eq!(metadata.name, "Vehicle.Speed");
        assert_eq!(metadata.data_type, 10);
        assert_eq!(metadata.change_type, 2);
        assert_eq!(metadata.description, "speed in km/h");
        assert_eq!(proto::DataType::from(DataType::Uint8) as i32, 6);
        assert_eq!(proto::ChangeType::from(ChangeType::OnChange) as i32, 1);
    }

    #[test]
    fn rejected_update_is_not_fatal() {
        let status = rejected(&HashMap::from([(3, 1), (1, 0)]));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(!classify(&status).is_fatal());
        assert_eq!(
            status.message(),
            "broker rejected update (1: UNKNOWN_DATAPOINT, 3: INVALID_TYPE)"
        );
    }

    #[test]
    fn malformed_address_is_a_channel_error() {
        let connector = GrpcConnector::new(&BrokerConfig::default());
        let err = connector.open("http://bad host:1").err().unwrap();
        assert!(matches!(err, FeederError::Channel(_)));
    }
}
