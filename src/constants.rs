//! # Driver Constants
//!
//! Defaults and operation names shared by the driver, the scheduler and the
//! status reporter. Configuration falls back to these values when a field is
//! not provided.

/// Master address used when none is configured
pub const DEFAULT_MASTER: &str = "localhost:45326";

/// Host the driver advertises to agents
pub const DEFAULT_LISTEN_HOST: &str = "localhost";

/// Interval between periodic status snapshots sent to the master
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 3_000;

/// Interval between market matching rounds
pub const DEFAULT_MARKET_POLL_INTERVAL_MS: u64 = 1_000;

/// Upper bound for establishing a TCP connection to the master or an agent
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Memory each task group asks the market for
pub const DEFAULT_TASK_MEMORY_MB: u64 = 64;

/// Total bid budget shared by all task groups of a flow
pub const DEFAULT_FLOW_BID: f64 = 1.0;

/// Prefix for environment variable overrides (`FLOW_MASTER`, `FLOW_FLOW_BID`, ...)
pub const ENV_PREFIX: &str = "FLOW";

/// Operation names used in structured log records
pub mod operations {
    pub const BID_SUBMITTED: &str = "bid.submitted";
    pub const BID_MATCHED: &str = "bid.matched";
    pub const FILES_SHIPPED: &str = "files.shipped";
    pub const TASK_GROUP_DISPATCHED: &str = "task_group.dispatched";
    pub const TASK_GROUP_COMPLETED: &str = "task_group.completed";
    pub const TASK_GROUP_FAILED: &str = "task_group.failed";
    pub const TASK_GROUP_CANCELLED: &str = "task_group.cancelled";
    pub const OUTPUT_DELETED: &str = "output.deleted";
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
}
