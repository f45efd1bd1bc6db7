//! # Driver Configuration
//!
//! [`DriverOption`] carries everything the driver needs for one run: where the
//! master lives, which part of the cluster to target, how much memory each task
//! group asks for, the total bid budget and the files every agent must have.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional file (TOML, YAML or JSON, picked by extension), then environment
//! variables prefixed with `FLOW_`.
//!
//! ```rust,no_run
//! use flow_driver::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let option = ConfigManager::load(Some(std::path::Path::new("flow.toml")))?;
//! println!("bidding {} against {}", option.flow_bid, option.master);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FLOW_BID, DEFAULT_LISTEN_HOST,
    DEFAULT_MARKET_POLL_INTERVAL_MS, DEFAULT_MASTER, DEFAULT_REPORT_INTERVAL_MS,
    DEFAULT_TASK_MEMORY_MB, ENV_PREFIX,
};
use crate::market::ResourceRequirement;
use crate::resource::FileResource;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Run configuration, immutable once the driver starts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverOption {
    /// Master address (`host:port`)
    pub master: String,
    pub data_center: String,
    pub rack: String,
    pub task_memory_mb: u64,
    /// Total bid budget, split evenly across task groups
    pub flow_bid: f64,
    pub module: String,
    pub host: String,
    pub port: u16,
    pub required_files: Vec<FileResource>,
    pub report_interval_ms: u64,
    pub market_poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for DriverOption {
    fn default() -> Self {
        Self {
            master: DEFAULT_MASTER.to_string(),
            data_center: String::new(),
            rack: String::new(),
            task_memory_mb: DEFAULT_TASK_MEMORY_MB,
            flow_bid: DEFAULT_FLOW_BID,
            module: String::new(),
            host: DEFAULT_LISTEN_HOST.to_string(),
            port: 0,
            required_files: Vec::new(),
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            market_poll_interval_ms: DEFAULT_MARKET_POLL_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl DriverOption {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.master.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "master",
                "master address must not be empty",
            ));
        }
        if !self.flow_bid.is_finite() || self.flow_bid <= 0.0 {
            return Err(ConfigurationError::invalid_value(
                "flow_bid",
                format!("must be a positive number, got {}", self.flow_bid),
            ));
        }
        if self.task_memory_mb == 0 {
            return Err(ConfigurationError::invalid_value(
                "task_memory_mb",
                "must be greater than zero",
            ));
        }
        for (field, value) in [
            ("report_interval_ms", self.report_interval_ms),
            ("market_poll_interval_ms", self.market_poll_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn market_poll_interval(&self) -> Duration {
        Duration::from_millis(self.market_poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Cluster targeting handed to the scheduler
    pub fn resource_requirement(&self) -> ResourceRequirement {
        ResourceRequirement {
            data_center: self.data_center.clone(),
            rack: self.rack.clone(),
            module: self.module.clone(),
            memory_mb: self.task_memory_mb,
        }
    }
}

/// Loads [`DriverOption`] from defaults, an optional file and the environment
pub struct ConfigManager;

impl ConfigManager {
    pub fn load(path: Option<&Path>) -> Result<DriverOption, ConfigurationError> {
        let defaults = config::Config::try_from(&DriverOption::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            debug!("Loading driver configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        let option: DriverOption = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        option.validate()?;
        Ok(option)
    }
}
