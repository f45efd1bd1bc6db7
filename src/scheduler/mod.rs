//! # Scheduler
//!
//! Runs task groups end to end on remote agents.
//!
//! For each task group the scheduler bids on the [`Market`], connects to the
//! allocated agent, ships missing files, dispatches the fused tasks and follows
//! the agent's progress stream, mirroring every transition into the task
//! group's [`TaskGroupStatusHandle`]. Each dispatch is recorded so that
//! [`Scheduler::delete_output`] can later find the agent holding the output.
//!
//! Dispatch is single-attempt: a failed task group stays failed and the failure
//! is visible in the status tree.

pub mod agent;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::barrier::BarrierGuard;
use crate::constants::operations;
use crate::logging::{log_step_operation, log_task_group_operation};
use crate::market::{AgentLocation, Allocation, Market, MarketError, ResourceRequirement};
use crate::plan::{ExecutionPlan, StepId, TaskGroup, TaskGroupId};
use crate::protocol::{DeleteOutputRequest, ProgressEvent, TaskGroupRequest};
use crate::resource::FileResource;
use crate::status::{StatusError, TaskGroupStatusHandle};
use crate::transport::TransportError;

use self::agent::{AgentConnector, AgentSession};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("Market error: {0}")]
    Market(#[from] MarketError),

    #[error("Agent closed the progress stream before the task group finished")]
    StreamClosed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Step {step_id} failed: {message}")]
    StepFailed { step_id: StepId, message: String },

    #[error("Failed to read file {name}: {source}")]
    File {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Agent did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Task group {0} is not part of the plan")]
    UnknownTaskGroup(TaskGroupId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),
}

/// How one task-group execution ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskGroupOutcome {
    Completed,
    Failed { error: String },
    /// `dispatched` is false when cancellation arrived before an allocation
    Cancelled { dispatched: bool },
}

/// Result of one output deletion attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Deleted { agent: String },
    NothingDispatched,
    AlreadyDeleted,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOption {
    pub job_id: u32,
    pub requirement: ResourceRequirement,
    pub driver_host: String,
    pub driver_port: u16,
    /// Upper bound for abort and delete round trips
    pub agent_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputState {
    Dispatched,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone)]
struct DispatchRecord {
    location: AgentLocation,
    output: OutputState,
}

pub struct Scheduler {
    market: Arc<Market>,
    agents: Arc<dyn AgentConnector>,
    option: SchedulerOption,
    dispatched: DashMap<TaskGroupId, DispatchRecord>,
    dispatch_count: AtomicUsize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("option", &self.option)
            .field("dispatched", &self.dispatched.len())
            .finish()
    }
}

async fn until_cancelled<T, F>(token: &CancellationToken, work: F) -> Result<T, DispatchError>
where
    F: Future<Output = Result<T, DispatchError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DispatchError::Cancelled),
        result = work => result,
    }
}

impl Scheduler {
    pub fn new(
        market: Arc<Market>,
        agents: Arc<dyn AgentConnector>,
        option: SchedulerOption,
    ) -> Self {
        Self {
            market,
            agents,
            option,
            dispatched: DashMap::new(),
            dispatch_count: AtomicUsize::new(0),
        }
    }

    pub fn market(&self) -> &Arc<Market> {
        &self.market
    }

    /// Number of task groups an agent accepted for execution
    pub fn dispatch_count(&self) -> usize {
        self.dispatch_count.load(Ordering::SeqCst)
    }

    pub fn dispatched_agent(&self, task_group_id: TaskGroupId) -> Option<String> {
        self.dispatched
            .get(&task_group_id)
            .map(|record| record.location.server.clone())
    }

    /// Run one task group to completion, failure or cancellation. The barrier
    /// guard is released when this returns.
    #[instrument(skip_all, fields(task_group_id = status.task_group_id(), bid = bid))]
    pub async fn execute_task_group(
        &self,
        token: CancellationToken,
        plan: Arc<ExecutionPlan>,
        status: TaskGroupStatusHandle,
        guard: BarrierGuard,
        bid: f64,
        files: Arc<[FileResource]>,
    ) -> TaskGroupOutcome {
        let _guard = guard;
        let task_group_id = status.task_group_id();

        let Some(task_group) = plan.task_group(task_group_id) else {
            let error = DispatchError::UnknownTaskGroup(task_group_id).to_string();
            status.mark_failed(&error);
            return TaskGroupOutcome::Failed { error };
        };

        status.mark_waiting();
        let allocation = match self
            .market
            .bid(&token, task_group_id, bid, self.option.requirement.clone())
            .await
        {
            Ok(allocation) => allocation,
            Err(MarketError::Cancelled) => {
                debug!(task_group_id, "📅 SCHEDULER: Cancelled while waiting for resources");
                status.mark_cancelled("cancelled before allocation");
                log_task_group_operation(
                    operations::TASK_GROUP_CANCELLED,
                    task_group_id,
                    None,
                    "cancelled",
                    Some("waiting for allocation"),
                );
                return TaskGroupOutcome::Cancelled { dispatched: false };
            }
            Err(e) => {
                let error = e.to_string();
                warn!(task_group_id, error = %error, "📅 SCHEDULER: Bid failed");
                status.mark_failed(&error);
                return TaskGroupOutcome::Failed { error };
            }
        };

        // Recorded before connecting so cleanup reaches the agent even if the
        // dispatch dies halfway
        self.dispatched.insert(
            task_group_id,
            DispatchRecord {
                location: allocation.location.clone(),
                output: OutputState::Dispatched,
            },
        );
        status.mark_allocated(&allocation.location.server);

        match self
            .run_on_agent(&token, task_group, &status, &allocation, &files)
            .await
        {
            Ok(()) => {
                status.mark_completed();
                log_task_group_operation(
                    operations::TASK_GROUP_COMPLETED,
                    task_group_id,
                    Some(&allocation.location.server),
                    "completed",
                    None,
                );
                TaskGroupOutcome::Completed
            }
            Err(DispatchError::Cancelled) => {
                status.mark_cancelled("interrupted");
                log_task_group_operation(
                    operations::TASK_GROUP_CANCELLED,
                    task_group_id,
                    Some(&allocation.location.server),
                    "cancelled",
                    Some("interrupted during dispatch"),
                );
                TaskGroupOutcome::Cancelled { dispatched: true }
            }
            Err(e) => {
                let error = e.to_string();
                status.mark_failed(&error);
                log_task_group_operation(
                    operations::TASK_GROUP_FAILED,
                    task_group_id,
                    Some(&allocation.location.server),
                    "failed",
                    Some(&error),
                );
                TaskGroupOutcome::Failed { error }
            }
        }
    }

    async fn run_on_agent(
        &self,
        token: &CancellationToken,
        task_group: &TaskGroup,
        status: &TaskGroupStatusHandle,
        allocation: &Allocation,
        files: &[FileResource],
    ) -> Result<(), DispatchError> {
        let mut session = until_cancelled(token, self.agents.connect(&allocation.location)).await?;

        let result = self
            .dispatch(token, task_group, status, allocation, files, session.as_mut())
            .await;

        if matches!(result, Err(DispatchError::Cancelled)) {
            let abort = session.abort(task_group.id);
            match tokio::time::timeout(self.option.agent_timeout, abort).await {
                Ok(Ok(())) => debug!(task_group_id = task_group.id, "📅 SCHEDULER: Abort sent"),
                Ok(Err(e)) => warn!(
                    task_group_id = task_group.id,
                    error = %e,
                    "📅 SCHEDULER: Abort failed"
                ),
                Err(_) => warn!(task_group_id = task_group.id, "📅 SCHEDULER: Abort timed out"),
            }
        }
        result
    }

    async fn dispatch(
        &self,
        token: &CancellationToken,
        task_group: &TaskGroup,
        status: &TaskGroupStatusHandle,
        allocation: &Allocation,
        files: &[FileResource],
        session: &mut dyn AgentSession,
    ) -> Result<(), DispatchError> {
        let inventory = until_cancelled(token, session.file_inventory()).await?;

        let mut shipped = Vec::new();
        for file in files.iter().filter(|file| file.needs_shipping(&inventory)) {
            let contents = file.read_contents().await.map_err(|source| DispatchError::File {
                name: file.name.clone(),
                source,
            })?;
            until_cancelled(token, session.ship_file(&file.name, &file.version, contents)).await?;
            shipped.push(file.name.as_str());
        }
        if !shipped.is_empty() {
            let details = shipped.join(",");
            log_task_group_operation(
                operations::FILES_SHIPPED,
                task_group.id,
                Some(&allocation.location.server),
                "shipped",
                Some(&details),
            );
        }

        let request = TaskGroupRequest {
            job_id: self.option.job_id,
            task_group_id: task_group.id,
            step_group_id: task_group.step_group_id,
            tasks: task_group.tasks.clone(),
            memory_mb: allocation.memory_mb,
            required_files: files.iter().map(|file| file.name.clone()).collect(),
            driver_host: self.option.driver_host.clone(),
            driver_port: self.option.driver_port,
        };
        until_cancelled(token, session.execute(request)).await?;
        self.dispatch_count.fetch_add(1, Ordering::SeqCst);
        info!(
            task_group_id = task_group.id,
            agent = %allocation.location,
            tasks = task_group.tasks.len(),
            "📅 SCHEDULER: Task group dispatched"
        );
        log_task_group_operation(
            operations::TASK_GROUP_DISPATCHED,
            task_group.id,
            Some(&allocation.location.server),
            "running",
            None,
        );

        self.follow_progress(token, task_group, status, session).await
    }

    /// Mirror agent progress into the status tree. Steps must start and finish
    /// in declared order.
    async fn follow_progress(
        &self,
        token: &CancellationToken,
        task_group: &TaskGroup,
        status: &TaskGroupStatusHandle,
        session: &mut dyn AgentSession,
    ) -> Result<(), DispatchError> {
        let expected: Vec<StepId> = task_group.step_ids().collect();
        let mut next = 0;
        let mut running: Option<StepId> = None;

        loop {
            let event = until_cancelled(token, session.next_event())
                .await?
                .ok_or(DispatchError::StreamClosed)?;

            match event {
                ProgressEvent::StepStarted { step_id } => {
                    if running.is_some() || expected.get(next) != Some(&step_id) {
                        return Err(DispatchError::Protocol(format!(
                            "step {step_id} started out of order"
                        )));
                    }
                    status.mark_step_started(step_id)?;
                    running = Some(step_id);
                    log_step_operation(
                        operations::STEP_STARTED,
                        task_group.id,
                        step_id,
                        status.step_name(step_id).as_deref(),
                        "running",
                        None,
                    );
                }
                ProgressEvent::StepCompleted { step_id } => {
                    if running != Some(step_id) {
                        return Err(DispatchError::Protocol(format!(
                            "step {step_id} completed without starting"
                        )));
                    }
                    status.mark_step_completed(step_id)?;
                    running = None;
                    next += 1;
                    log_step_operation(
                        operations::STEP_COMPLETED,
                        task_group.id,
                        step_id,
                        status.step_name(step_id).as_deref(),
                        "completed",
                        None,
                    );
                }
                ProgressEvent::StepFailed { step_id, error } => {
                    if running.is_some_and(|current| current != step_id)
                        || expected.get(next) != Some(&step_id)
                    {
                        return Err(DispatchError::Protocol(format!(
                            "step {step_id} failed out of order"
                        )));
                    }
                    status.mark_step_failed(step_id, &error)?;
                    log_step_operation(
                        operations::STEP_FAILED,
                        task_group.id,
                        step_id,
                        status.step_name(step_id).as_deref(),
                        "failed",
                        Some(&error),
                    );
                    return Err(DispatchError::StepFailed {
                        step_id,
                        message: error,
                    });
                }
                ProgressEvent::GroupCompleted => {
                    if running.is_some() || next != expected.len() {
                        return Err(DispatchError::Protocol(format!(
                            "group completed after {next} of {} steps",
                            expected.len()
                        )));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Best-effort deletion of a task group's output on the agent that ran it.
    /// Never escalates errors; calling it again after success has no effect.
    pub async fn delete_output(
        &self,
        plan: &ExecutionPlan,
        task_group: &TaskGroup,
    ) -> CleanupOutcome {
        let location = {
            let Some(mut record) = self.dispatched.get_mut(&task_group.id) else {
                return CleanupOutcome::NothingDispatched;
            };
            match record.output {
                OutputState::Deleted | OutputState::Deleting => {
                    return CleanupOutcome::AlreadyDeleted
                }
                OutputState::Dispatched => {
                    record.output = OutputState::Deleting;
                    record.location.clone()
                }
            }
        };

        let request = DeleteOutputRequest {
            job_id: self.option.job_id,
            task_group_id: task_group.id,
            dataset_ids: plan.output_datasets(task_group),
        };
        let deletion = async {
            let mut session = self.agents.connect(&location).await?;
            session.delete_output(request).await
        };
        let result = match tokio::time::timeout(self.option.agent_timeout, deletion).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.option.agent_timeout)),
        };

        let (state, outcome) = match result {
            Ok(()) => {
                log_task_group_operation(
                    operations::OUTPUT_DELETED,
                    task_group.id,
                    Some(&location.server),
                    "deleted",
                    None,
                );
                (
                    OutputState::Deleted,
                    CleanupOutcome::Deleted {
                        agent: location.server.clone(),
                    },
                )
            }
            Err(e) => {
                warn!(
                    task_group_id = task_group.id,
                    agent = %location,
                    error = %e,
                    "📅 SCHEDULER: Failed to delete output, ignoring"
                );
                (
                    OutputState::Dispatched,
                    CleanupOutcome::Failed { error: e.to_string() },
                )
            }
        };

        if let Some(mut record) = self.dispatched.get_mut(&task_group.id) {
            record.output = state;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::CompletionBarrier;
    use crate::local::{AgentBehavior, LocalCluster};
    use crate::plan::{Step, StepGroup, Task};
    use crate::status::{ExecutionState, StatusTree};

    fn single_group_plan() -> ExecutionPlan {
        ExecutionPlan {
            name: "single".to_string(),
            steps: vec![
                Step { id: 0, name: "read".to_string(), output_dataset_id: 0 },
                Step { id: 1, name: "count".to_string(), output_dataset_id: 1 },
            ],
            step_groups: vec![StepGroup { id: 0, step_ids: vec![0, 1], parent_ids: vec![] }],
            task_groups: vec![TaskGroup {
                id: 0,
                step_group_id: 0,
                tasks: vec![
                    Task { step_id: 0, name: "read".to_string() },
                    Task { step_id: 1, name: "count".to_string() },
                ],
            }],
        }
    }

    struct Fixture {
        scheduler: Arc<Scheduler>,
        cluster: LocalCluster,
        plan: Arc<ExecutionPlan>,
        tree: Arc<StatusTree>,
        token: CancellationToken,
    }

    fn fixture(cluster: LocalCluster) -> Fixture {
        fixture_with_agents(cluster, None)
    }

    fn fixture_with_agents(
        cluster: LocalCluster,
        agents: Option<Arc<dyn AgentConnector>>,
    ) -> Fixture {
        let plan = Arc::new(single_group_plan());
        let cluster = cluster.with_plan(&plan);
        let market = Arc::new(Market::new(Arc::new(cluster.clone()), Duration::from_millis(5)));
        let agents = agents.unwrap_or_else(|| Arc::new(cluster.clone()));
        let scheduler = Arc::new(Scheduler::new(
            market,
            agents,
            SchedulerOption {
                job_id: 11,
                requirement: ResourceRequirement { memory_mb: 64, ..Default::default() },
                driver_host: "localhost".to_string(),
                driver_port: 0,
                agent_timeout: Duration::from_secs(1),
            },
        ));
        let tree = Arc::new(StatusTree::from_plan(11, &plan));
        Fixture { scheduler, cluster, plan, tree, token: CancellationToken::new() }
    }

    async fn run(fixture: &Fixture) -> TaskGroupOutcome {
        let fetcher = tokio::spawn({
            let market = fixture.scheduler.market().clone();
            let token = fixture.token.clone();
            async move { market.fetcher_loop(token).await }
        });
        let barrier = CompletionBarrier::new();
        let handle = fixture.tree.partition(&fixture.plan).unwrap().remove(0);
        let outcome = fixture
            .scheduler
            .execute_task_group(
                fixture.token.clone(),
                fixture.plan.clone(),
                handle,
                barrier.arrive(),
                2.0,
                Arc::from(Vec::new()),
            )
            .await;
        assert_eq!(barrier.release_count(), 1);
        fixture.token.cancel();
        fetcher.await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn completes_and_records_agent() {
        let fixture = fixture(LocalCluster::with_agents(1));
        assert_eq!(run(&fixture).await, TaskGroupOutcome::Completed);

        let snapshot = fixture.tree.snapshot();
        assert_eq!(snapshot.step_groups[0].state, ExecutionState::Completed);
        assert!(snapshot.steps.iter().all(|step| step.state == ExecutionState::Completed));
        assert_eq!(fixture.scheduler.dispatch_count(), 1);
        assert_eq!(fixture.scheduler.dispatched_agent(0).as_deref(), Some("local-agent-0:0"));
        assert_eq!(fixture.cluster.bids(), vec![(0, 2.0)]);
    }

    struct RefusingAgents;

    #[async_trait::async_trait]
    impl AgentConnector for RefusingAgents {
        async fn connect(
            &self,
            location: &AgentLocation,
        ) -> Result<Box<dyn AgentSession>, DispatchError> {
            Err(DispatchError::Agent(format!("{location} refused the connection")))
        }
    }

    #[tokio::test]
    async fn allocation_without_reaching_agent_is_not_counted() {
        let fixture =
            fixture_with_agents(LocalCluster::with_agents(1), Some(Arc::new(RefusingAgents)));

        let outcome = run(&fixture).await;
        assert!(matches!(outcome, TaskGroupOutcome::Failed { error } if error.contains("refused")));
        assert_eq!(fixture.scheduler.dispatch_count(), 0);
        // The allocation is still recorded so cleanup can reach the agent
        assert_eq!(fixture.scheduler.dispatched_agent(0).as_deref(), Some("local-agent-0:0"));
    }

    #[tokio::test]
    async fn step_failure_fails_group() {
        let cluster = LocalCluster::with_agents(1);
        cluster.set_behavior(0, AgentBehavior::FailAt { step_id: 1, error: "oom".to_string() });
        let fixture = fixture(cluster);

        let outcome = run(&fixture).await;
        assert!(matches!(outcome, TaskGroupOutcome::Failed { error } if error.contains("oom")));

        let snapshot = fixture.tree.snapshot();
        assert_eq!(snapshot.steps[0].state, ExecutionState::Completed);
        assert_eq!(snapshot.steps[1].state, ExecutionState::Failed);
        assert_eq!(snapshot.step_groups[0].state, ExecutionState::Failed);
    }

    #[tokio::test]
    async fn out_of_order_progress_is_a_protocol_violation() {
        let cluster = LocalCluster::with_agents(1);
        cluster.set_behavior(0, AgentBehavior::Scripted(vec![
            ProgressEvent::StepStarted { step_id: 1 },
            ProgressEvent::GroupCompleted,
        ]));
        let fixture = fixture(cluster);

        let outcome = run(&fixture).await;
        assert!(matches!(
            outcome,
            TaskGroupOutcome::Failed { error } if error.contains("out of order")
        ));
    }

    #[tokio::test]
    async fn cancel_while_waiting_never_dispatches() {
        let fixture = fixture(LocalCluster::with_offer_limit(0));
        let token = fixture.token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        assert_eq!(run(&fixture).await, TaskGroupOutcome::Cancelled { dispatched: false });
        assert_eq!(fixture.cluster.execute_count(), 0);
        assert_eq!(fixture.scheduler.dispatch_count(), 0);
        assert_eq!(fixture.tree.snapshot().step_groups[0].state, ExecutionState::Cancelled);
        assert_eq!(
            fixture.scheduler.delete_output(&fixture.plan, &fixture.plan.task_groups[0]).await,
            CleanupOutcome::NothingDispatched
        );
    }

    #[tokio::test]
    async fn cancel_during_dispatch_aborts() {
        let cluster = LocalCluster::with_agents(1);
        cluster.set_behavior(0, AgentBehavior::Hang);
        let fixture = fixture(cluster);
        let token = fixture.token.clone();
        let cluster = fixture.cluster.clone();
        tokio::spawn(async move {
            while cluster.execute_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            token.cancel();
        });

        assert_eq!(run(&fixture).await, TaskGroupOutcome::Cancelled { dispatched: true });
        assert_eq!(fixture.cluster.aborted(), vec![0]);
        assert_eq!(fixture.scheduler.dispatch_count(), 1);
        assert_eq!(fixture.tree.snapshot().step_groups[0].state, ExecutionState::Cancelled);
    }

    #[tokio::test]
    async fn delete_output_is_idempotent() {
        let fixture = fixture(LocalCluster::with_agents(1));
        run(&fixture).await;
        let task_group = &fixture.plan.task_groups[0];

        assert_eq!(
            fixture.scheduler.delete_output(&fixture.plan, task_group).await,
            CleanupOutcome::Deleted { agent: "local-agent-0:0".to_string() }
        );
        assert_eq!(
            fixture.scheduler.delete_output(&fixture.plan, task_group).await,
            CleanupOutcome::AlreadyDeleted
        );
        assert_eq!(fixture.cluster.deleted(), vec![(0, vec![0, 1])]);
    }

    #[tokio::test]
    async fn failed_delete_is_reported_and_retryable() {
        let fixture = fixture(LocalCluster::with_agents(1));
        run(&fixture).await;
        let task_group = &fixture.plan.task_groups[0];

        fixture.cluster.fail_deletes(true);
        let outcome = fixture.scheduler.delete_output(&fixture.plan, task_group).await;
        assert!(matches!(outcome, CleanupOutcome::Failed { .. }));

        fixture.cluster.fail_deletes(false);
        assert!(matches!(
            fixture.scheduler.delete_output(&fixture.plan, task_group).await,
            CleanupOutcome::Deleted { .. }
        ));
    }
}
