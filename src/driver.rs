//! # Flow Driver
//!
//! Top-level orchestration of one flow run.
//!
//! [`FlowDriver::run_flow_until`] validates the plan, builds the status tree,
//! and then runs the body of the flow in its own task:
//!
//! - one `execute_task_group` per task group, each holding a barrier guard
//! - the market's matching loop on a child of the run's cancellation token
//! - the status reporter with its own stop signal
//!
//! The body waits on the barrier, stops the reporter and collects outcomes.
//! Meanwhile the driver waits for either the body or the interrupt. An
//! interrupt prints the status tree to stderr, cancels the token and runs
//! cleanup right away. Cleanup is awaited again after the body on every path,
//! including a panicking body, and only ever deletes once.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::barrier::CompletionBarrier;
use crate::cleanup::{Cleanup, CleanupReport};
use crate::config::DriverOption;
use crate::error::{FlowError, Result};
use crate::local::LocalCluster;
use crate::market::{Market, MarketStatsSnapshot, OfferSource};
use crate::plan::{ExecutionPlan, TaskGroupId};
use crate::reporter::{job_status_url, ReportSummary, StatusReporter, StatusStreamConnector};
use crate::resource::FileResource;
use crate::scheduler::agent::AgentConnector;
use crate::scheduler::{Scheduler, SchedulerOption, TaskGroupOutcome};
use crate::status::{write_status_tree, FlowExecutionStatus, StatusTree, TaskGroupStatusHandle};
use crate::transport::TcpClusterClient;

/// External services the driver talks to
#[derive(Clone)]
pub struct Collaborators {
    pub offers: Arc<dyn OfferSource>,
    pub agents: Arc<dyn AgentConnector>,
    pub status_streams: Arc<dyn StatusStreamConnector>,
}

impl Collaborators {
    /// Master and agents over TCP
    pub fn tcp(option: &DriverOption) -> Self {
        let client = Arc::new(TcpClusterClient::new(
            option.master.clone(),
            option.connect_timeout(),
        ));
        Self {
            offers: client.clone(),
            agents: client.clone(),
            status_streams: client,
        }
    }

    /// Everything in-process
    pub fn local(cluster: &LocalCluster) -> Self {
        Self {
            offers: Arc::new(cluster.clone()),
            agents: Arc::new(cluster.clone()),
            status_streams: Arc::new(cluster.clone()),
        }
    }
}

/// What happened during one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub job_id: u32,
    pub interrupted: bool,
    /// Status tree as printed when the interrupt arrived
    pub interrupt_snapshot: Option<FlowExecutionStatus>,
    pub outcomes: Vec<(TaskGroupId, TaskGroupOutcome)>,
    pub cleanup: CleanupReport,
    /// `None` if the reporter task itself died
    pub report: Option<ReportSummary>,
    pub status: FlowExecutionStatus,
    pub launched: usize,
    pub barrier_releases: usize,
    pub dispatched: usize,
    pub market: MarketStatsSnapshot,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.count(|outcome| *outcome == TaskGroupOutcome::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskGroupOutcome::Failed { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskGroupOutcome::Cancelled { .. }))
    }

    pub fn succeeded(&self) -> bool {
        !self.interrupted && self.completed() == self.outcomes.len()
    }

    pub fn outcome(&self, task_group_id: TaskGroupId) -> Option<&TaskGroupOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == task_group_id)
            .map(|(_, outcome)| outcome)
    }

    fn count(&self, predicate: impl Fn(&TaskGroupOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| predicate(outcome)).count()
    }
}

struct FlowBody {
    scheduler: Arc<Scheduler>,
    plan: Arc<ExecutionPlan>,
    handles: Vec<TaskGroupStatusHandle>,
    token: CancellationToken,
    reporter: StatusReporter,
    bid: f64,
    files: Arc<[FileResource]>,
}

struct BodyResult {
    outcomes: Vec<(TaskGroupId, TaskGroupOutcome)>,
    report: Option<ReportSummary>,
    launched: usize,
    barrier_releases: usize,
}

impl FlowBody {
    async fn run(self) -> BodyResult {
        let FlowBody {
            scheduler,
            plan,
            handles,
            token,
            reporter,
            bid,
            files,
        } = self;

        let barrier = CompletionBarrier::new();

        let market_token = token.child_token();
        let market_task = tokio::spawn({
            let market = scheduler.market().clone();
            let market_token = market_token.clone();
            async move { market.fetcher_loop(market_token).await }
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let reporter_task = tokio::spawn(async move { reporter.report_status(stop_rx).await });

        let executions: Vec<(TaskGroupId, JoinHandle<TaskGroupOutcome>)> = handles
            .into_iter()
            .map(|handle| {
                let task_group_id = handle.task_group_id();
                let guard = barrier.arrive();
                let scheduler = scheduler.clone();
                let token = token.clone();
                let plan = plan.clone();
                let files = files.clone();
                let execution = tokio::spawn(async move {
                    scheduler
                        .execute_task_group(token, plan, handle, guard, bid, files)
                        .await
                });
                (task_group_id, execution)
            })
            .collect();
        let launched = executions.len();
        info!(launched, bid, "🚀 DRIVER: Task groups launched");

        barrier.wait().await;

        market_token.cancel();
        if let Err(e) = market_task.await {
            warn!(error = %e, "🚀 DRIVER: Market loop ended abnormally");
        }

        // The reporter may already be gone if its stream never opened
        let _ = stop_tx.send(());
        let report = match reporter_task.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(error = %e, "🚀 DRIVER: Status reporter ended abnormally");
                None
            }
        };

        let mut outcomes = Vec::with_capacity(launched);
        for (task_group_id, execution) in executions {
            let outcome = execution.await.unwrap_or_else(|e| TaskGroupOutcome::Failed {
                error: format!("task group execution ended abnormally: {e}"),
            });
            outcomes.push((task_group_id, outcome));
        }

        BodyResult {
            outcomes,
            report,
            launched,
            barrier_releases: barrier.release_count(),
        }
    }
}

pub struct FlowDriver {
    option: Arc<DriverOption>,
    collaborators: Collaborators,
    job_id: u32,
}

impl FlowDriver {
    pub fn new(option: DriverOption, collaborators: Collaborators) -> Self {
        Self {
            option: Arc::new(option),
            collaborators,
            job_id: new_job_id(),
        }
    }

    pub fn with_job_id(mut self, job_id: u32) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn job_id(&self) -> u32 {
        self.job_id
    }

    pub fn option(&self) -> &DriverOption {
        &self.option
    }

    pub fn job_status_url(&self) -> String {
        job_status_url(&self.option.master, self.job_id)
    }

    /// Run the flow with Ctrl-C as the interrupt
    pub async fn run_flow(&self, plan: ExecutionPlan) -> Result<RunSummary> {
        self.run_flow_until(plan, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(
                    error = %e,
                    "🚀 DRIVER: Cannot listen for Ctrl-C, running without interrupt"
                );
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the flow until every task group finished or `interrupt` resolves.
    ///
    /// Only planning and driver-internal failures are errors; task-group
    /// failures are reported in the returned summary and the status tree.
    pub async fn run_flow_until<I>(&self, plan: ExecutionPlan, interrupt: I) -> Result<RunSummary>
    where
        I: Future<Output = ()>,
    {
        self.option.validate()?;
        plan.validate()?;
        plan.log_execution_plan();

        let plan = Arc::new(plan);
        let tree = Arc::new(StatusTree::from_plan(self.job_id, &plan));
        let handles = tree.partition(&plan)?;
        tree.mark_driver_started();

        let market = Arc::new(Market::new(
            self.collaborators.offers.clone(),
            self.option.market_poll_interval(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            market,
            self.collaborators.agents.clone(),
            SchedulerOption {
                job_id: self.job_id,
                requirement: self.option.resource_requirement(),
                driver_host: self.option.host.clone(),
                driver_port: self.option.port,
                agent_timeout: self.option.connect_timeout(),
            },
        ));
        let cleanup = Cleanup::new(scheduler.clone(), plan.clone());
        let token = CancellationToken::new();

        info!(
            job_id = self.job_id,
            task_groups = plan.task_groups.len(),
            "🚀 DRIVER: Starting flow {}",
            plan.name
        );
        info!("Job Status URL {}", self.job_status_url());

        let body = FlowBody {
            scheduler: scheduler.clone(),
            plan: plan.clone(),
            handles,
            token: token.clone(),
            reporter: StatusReporter::new(
                self.option.master.clone(),
                self.collaborators.status_streams.clone(),
                tree.clone(),
                self.option.report_interval(),
            )
            .with_io_timeout(self.option.connect_timeout()),
            bid: self.option.flow_bid / plan.task_groups.len() as f64,
            files: self.option.required_files.clone().into(),
        };
        let mut body = tokio::spawn(body.run());

        tokio::pin!(interrupt);
        let (joined, interrupt_snapshot) = tokio::select! {
            joined = &mut body => (joined, None),
            _ = &mut interrupt => {
                warn!(job_id = self.job_id, "🚀 DRIVER: Interrupted, cancelling flow");
                let snapshot = tree.snapshot();
                if let Err(e) = write_status_tree(&mut std::io::stderr(), &snapshot) {
                    warn!(error = %e, "🚀 DRIVER: Failed to print status tree");
                }
                token.cancel();
                cleanup.run().await;
                (body.await, Some(snapshot))
            }
        };

        // Stragglers, if the body died early
        token.cancel();
        let cleanup_report = cleanup.run().await.clone();
        let body = joined.map_err(|e| {
            error!(error = %e, "🚀 DRIVER: Flow body ended abnormally");
            FlowError::DriverTask(e.to_string())
        })?;

        if tree.snapshot().driver.stop_time.is_none() {
            tree.mark_driver_stopped();
        }

        let summary = RunSummary {
            job_id: self.job_id,
            interrupted: interrupt_snapshot.is_some(),
            interrupt_snapshot,
            outcomes: body.outcomes,
            cleanup: cleanup_report,
            report: body.report,
            status: tree.snapshot(),
            launched: body.launched,
            barrier_releases: body.barrier_releases,
            dispatched: scheduler.dispatch_count(),
            market: scheduler.market().stats(),
        };

        info!(
            job_id = self.job_id,
            completed = summary.completed(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            interrupted = summary.interrupted,
            "🚀 DRIVER: Flow finished"
        );
        Ok(summary)
    }
}

fn new_job_id() -> u32 {
    // Master job ids are 32-bit
    Uuid::new_v4().as_u128() as u32
}
