//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the feeder runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the CarSim feeder workspace.
//! This crate exposes configuration loading, tracing initialisation, and the
//! shutdown signal used by background threads.

pub mod config;
pub mod logging;
pub mod shutdown;

pub use config::{
    BrokerConfig, ChangeType, DataPointSpec, DataType, FeederConfig, LoadedFeederConfig,
    LoggingConfig, SupervisorConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use shutdown::ShutdownSignal;
