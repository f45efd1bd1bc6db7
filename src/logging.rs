//! # Structured Logging Module
//!
//! Environment-aware structured logging for the driver. Console output is
//! human readable by default; `FLOW_LOG_FORMAT=json` switches to JSON lines for
//! log shippers.

use std::sync::OnceLock;
use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("FLOW_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| get_log_level(&environment));
        let json = std::env::var("FLOW_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let console = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(filter))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(EnvFilter::new(filter))
                .boxed()
        };

        // A global subscriber may already be installed by an embedding process
        if tracing_subscriber::registry().with(console).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized, keeping it");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("FLOW_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for task group operations
pub fn log_task_group_operation(
    operation: &str,
    task_group_id: usize,
    agent: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_group_id = task_group_id,
        agent = agent,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_GROUP_OPERATION"
    );
}

/// Log structured data for step operations
pub fn log_step_operation(
    operation: &str,
    task_group_id: usize,
    step_id: usize,
    step_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        operation = %operation,
        task_group_id = task_group_id,
        step_id = step_id,
        step_name = step_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔧 STEP_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_logs_at_info() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
    }

    #[test]
    fn init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_task_group_operation("test.op", 1, Some("agent:1"), "ok", None);
        log_step_operation("test.step", 1, 2, Some("map"), "ok", Some("details"));
    }
}
