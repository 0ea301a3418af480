//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the feeder runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use strum::{Display, EnumString};
use tracing::debug;

use crate::logging::LogFormat;

const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1:55555";

fn default_broker_address() -> String {
    DEFAULT_BROKER_ADDRESS.to_owned()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_poll() -> Duration {
    Duration::from_millis(200)
}

fn default_fatal_backoff() -> Duration {
    Duration::from_secs(3)
}

fn default_unexpected_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_liveness_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_datapoints() -> Vec<DataPointSpec> {
    vec![
        DataPointSpec::new("Vehicle.Speed", DataType::Float, ChangeType::Continuous),
        DataPointSpec::new("Vehicle.Acceleration", DataType::Float, ChangeType::Continuous),
    ]
}

/// Primary configuration object for the feeder runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeederConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default = "default_datapoints")]
    pub datapoints: Vec<DataPointSpec>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`FeederConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedFeederConfig {
    pub config: FeederConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl FeederConfig {
    pub const ENV_CONFIG_PATH: &str = "CARSIM_CONFIG";
    pub const ENV_BROKER_ADDRESS: &str = "VDB_ADDRESS";

    /// Load configuration from disk, respecting the `CARSIM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Falls back to the built-in defaults when neither the environment nor
    /// any candidate names an existing file. Environment overrides are applied
    /// in every case.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedFeederConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedFeederConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedFeederConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(LoadedFeederConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config = toml::from_str::<FeederConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `VDB_ADDRESS` on top of whatever the file specified.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var(Self::ENV_BROKER_ADDRESS) {
            let address = address.trim();
            if !address.is_empty() {
                debug!(address, "broker address overridden from environment");
                self.broker.address = address.to_owned();
            }
        }
    }

    /// Look up a data-point specification by name.
    pub fn datapoint(&self, name: &str) -> Option<&DataPointSpec> {
        self.datapoints.iter().find(|spec| spec.name == name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        if self.datapoints.is_empty() {
            return Err(anyhow!("configuration must declare at least one datapoint"));
        }
        let mut seen = HashSet::new();
        for spec in &self.datapoints {
            if spec.name.trim().is_empty() {
                return Err(anyhow!("datapoint names must not be empty"));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(anyhow!("datapoint '{}' is declared more than once", spec.name));
            }
        }
        self.supervisor.validate()?;
        Ok(())
    }
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            datapoints: default_datapoints(),
            supervisor: SupervisorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl std::str::FromStr for FeederConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: FeederConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Connection parameters for the data broker.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_address")]
    pub address: String,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_rpc_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub rpc_timeout: Duration,
    /// Cadence of the connectivity probe that drives state notifications.
    #[serde(default = "default_probe_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_interval: Duration,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(anyhow!("broker address must not be empty"));
        }
        let intervals = [
            ("connect_timeout", self.connect_timeout),
            ("rpc_timeout", self.rpc_timeout),
            ("probe_interval", self.probe_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(anyhow!("broker {} must be greater than zero", name));
            }
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            connect_timeout: default_connect_timeout(),
            rpc_timeout: default_rpc_timeout(),
            probe_interval: default_probe_interval(),
        }
    }
}

/// Wait intervals used by the connection supervisor loop.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Poll cadence while the channel is not connected.
    #[serde(default = "default_idle_poll")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_poll: Duration,
    /// Wait after a registration attempt failed with an RPC error.
    #[serde(default = "default_fatal_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub fatal_backoff: Duration,
    /// Wait after a registration attempt failed for any other reason.
    #[serde(default = "default_unexpected_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub unexpected_backoff: Duration,
    /// Cadence of the liveness no-op while registered.
    #[serde(default = "default_liveness_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub liveness_interval: Duration,
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("idle_poll", self.idle_poll),
            ("fatal_backoff", self.fatal_backoff),
            ("unexpected_backoff", self.unexpected_backoff),
            ("liveness_interval", self.liveness_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(anyhow!("supervisor {} must be greater than zero", name));
            }
        }
        Ok(())
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_poll: default_idle_poll(),
            fatal_backoff: default_fatal_backoff(),
            unexpected_backoff: default_unexpected_backoff(),
            liveness_interval: default_liveness_interval(),
        }
    }
}

/// Static description of a data-point registered with the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataPointSpec {
    pub name: String,
    pub data_type: DataType,
    pub change_type: ChangeType,
    #[serde(default)]
    pub description: String,
}

impl DataPointSpec {
    pub fn new(name: impl Into<String>, data_type: DataType, change_type: ChangeType) -> Self {
        Self {
            name: name.into(),
            data_type,
            change_type,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Value type of a data-point as understood by the broker.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum DataType {
    String,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Double,
}

/// How often a data-point is expected to change.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ChangeType {
    Static,
    OnChange,
    Continuous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
