#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Flow Driver
//!
//! Driver and scheduler for distributed dataflow jobs.
//!
//! ## Overview
//!
//! A planner fuses a dataflow graph into step groups and task groups. This
//! crate takes the resulting [`ExecutionPlan`] and runs it on a cluster:
//! it bids for agent capacity on a resource market, dispatches every task group
//! to the agent it won, streams live execution status to the master and deletes
//! intermediate outputs when the run ends, fails or is interrupted.
//!
//! ## Module Organization
//!
//! - [`plan`] - Execution plan model and validation
//! - [`driver`] - Top-level orchestration of one run
//! - [`market`] - Bid/offer matching loop
//! - [`scheduler`] - Per-task-group dispatch and output deletion
//! - [`status`] - Concurrently written status tree and its text rendering
//! - [`reporter`] - Status streaming to the master
//! - [`cleanup`] - Run-once deletion of intermediate outputs
//! - [`barrier`] - Completion barrier released by drop guards
//! - [`protocol`] / [`transport`] - Cluster messages and their TCP transport
//! - [`local`] - In-process cluster for dry runs and tests
//! - [`config`], [`logging`], [`error`] - Configuration, structured logging, errors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flow_driver::{Collaborators, ConfigManager, ExecutionPlan, FlowDriver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! flow_driver::logging::init_structured_logging();
//!
//! let option = ConfigManager::load(None)?;
//! let plan = ExecutionPlan::load("plan.json")?;
//! let driver = FlowDriver::new(option.clone(), Collaborators::tcp(&option));
//!
//! let summary = driver.run_flow(plan).await?;
//! println!("{} of {} task groups completed", summary.completed(), summary.launched);
//! # Ok(())
//! # }
//! ```

pub mod barrier;
pub mod cleanup;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod local;
pub mod logging;
pub mod market;
pub mod plan;
pub mod protocol;
pub mod reporter;
pub mod resource;
pub mod scheduler;
pub mod status;
pub mod transport;

pub use cleanup::{Cleanup, CleanupReport};
pub use config::{ConfigManager, ConfigurationError, DriverOption};
pub use driver::{Collaborators, FlowDriver, RunSummary};
pub use error::{FlowError, Result};
pub use local::{AgentBehavior, LocalCluster};
pub use market::{Allocation, Market, MarketError, Offer, OfferSource, ResourceRequirement};
pub use plan::{ExecutionPlan, PlanError, Step, StepGroup, Task, TaskGroup};
pub use reporter::{ReportSummary, StatusReporter};
pub use resource::FileResource;
pub use scheduler::{CleanupOutcome, DispatchError, Scheduler, TaskGroupOutcome};
pub use status::{ExecutionState, FlowExecutionStatus, StatusTree};
