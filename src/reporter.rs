//! # Status Reporter
//!
//! Streams status snapshots to the master while the flow runs.
//!
//! The reporter has its own stop signal instead of the run's cancellation
//! token, so an interrupted run still gets its final snapshot out: on stop it
//! stamps the driver stop time, sends exactly one last snapshot and logs the
//! job status URL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::constants::DEFAULT_CONNECT_TIMEOUT_MS;
use crate::status::{FlowExecutionStatus, StatusTree};
use crate::transport::TransportError;

#[async_trait]
pub trait StatusStreamConnector: Send + Sync {
    async fn open(&self, job_id: u32) -> Result<Box<dyn StatusStream>, TransportError>;
}

#[async_trait]
pub trait StatusStream: Send {
    async fn send(&mut self, status: &FlowExecutionStatus) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// What the reporter managed to deliver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub connected: bool,
    pub periodic_sends: usize,
    pub failed_sends: usize,
    pub final_sent: bool,
}

pub fn job_status_url(master: &str, job_id: u32) -> String {
    format!("http://{master}/job/{job_id}")
}

pub struct StatusReporter {
    master: String,
    connector: Arc<dyn StatusStreamConnector>,
    tree: Arc<StatusTree>,
    interval: Duration,
    io_timeout: Duration,
}

impl StatusReporter {
    pub fn new(
        master: impl Into<String>,
        connector: Arc<dyn StatusStreamConnector>,
        tree: Arc<StatusTree>,
        interval: Duration,
    ) -> Self {
        Self {
            master: master.into(),
            connector,
            tree,
            interval,
            io_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    /// Upper bound for opening the stream and for each send
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    async fn send_snapshot(&self, stream: &mut dyn StatusStream) -> Result<(), TransportError> {
        tokio::time::timeout(self.io_timeout, stream.send(&self.tree.snapshot()))
            .await
            .map_err(|_| TransportError::Timeout {
                addr: self.master.clone(),
            })?
    }

    /// Stream snapshots until `stop` fires (or its sender is dropped), then
    /// flush once with the stop time set
    pub async fn report_status(&self, mut stop: oneshot::Receiver<()>) -> ReportSummary {
        let mut summary = ReportSummary::default();
        let job_id = self.tree.job_id();

        // A stream that is ready still gets the final snapshot after an early stop
        let opened = tokio::select! {
            biased;
            opened = tokio::time::timeout(self.io_timeout, self.connector.open(job_id)) => opened,
            _ = &mut stop => {
                warn!(job_id, "📡 REPORTER: Stopped before the status stream opened");
                return summary;
            }
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(
                    master = %self.master,
                    job_id,
                    error = %e,
                    "📡 REPORTER: Failed to open status stream, reporting disabled"
                );
                return summary;
            }
            Err(_) => {
                error!(
                    master = %self.master,
                    job_id,
                    timeout_ms = self.io_timeout.as_millis() as u64,
                    "📡 REPORTER: Status stream did not open in time, reporting disabled"
                );
                return summary;
            }
        };
        summary.connected = true;
        debug!(master = %self.master, job_id, "📡 REPORTER: Status stream opened");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    match self.send_snapshot(stream.as_mut()).await {
                        Ok(()) => summary.periodic_sends += 1,
                        Err(e) => {
                            summary.failed_sends += 1;
                            warn!(
                                job_id,
                                error = %e,
                                "📡 REPORTER: Status send failed, retrying next tick"
                            );
                        }
                    }
                }
            }
        }

        self.tree.mark_driver_stopped();
        match self.send_snapshot(stream.as_mut()).await {
            Ok(()) => {
                summary.final_sent = true;
                info!("Job Status URL {}", job_status_url(&self.master, job_id));
            }
            Err(e) => {
                summary.failed_sends += 1;
                error!(
                    job_id,
                    error = %e,
                    "📡 REPORTER: Failed to send final status for {}",
                    job_status_url(&self.master, job_id)
                );
            }
        }

        match tokio::time::timeout(self.io_timeout, stream.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(job_id, error = %e, "📡 REPORTER: Status stream close failed"),
            Err(_) => debug!(job_id, "📡 REPORTER: Status stream close timed out"),
        }
        summary
    }
}
