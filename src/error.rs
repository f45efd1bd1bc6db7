use thiserror::Error;

use crate::config::ConfigurationError;
use crate::market::MarketError;
use crate::plan::PlanError;
use crate::scheduler::DispatchError;
use crate::status::StatusError;
use crate::transport::TransportError;

/// Crate-level error.
///
/// Only planning, configuration and driver-internal failures reach the caller
/// of [`crate::FlowDriver::run_flow`]. Task-group failures are recorded in the
/// status tree instead.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Market error: {0}")]
    Market(#[from] MarketError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Driver task failed: {0}")]
    DriverTask(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
