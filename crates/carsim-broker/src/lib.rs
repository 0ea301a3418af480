//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "gRPC adapter between the feeder and the vehicle data broker."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! gRPC implementation of the broker channel: Collector calls over tonic and a
//! connectivity watcher that turns endpoint reachability into notifications.
#![warn(missing_docs)]

pub mod grpc;
mod watcher;

pub use grpc::{proto, GrpcChannel, GrpcConnector};
