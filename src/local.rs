//! # In-Process Cluster
//!
//! [`LocalCluster`] stands in for the master and its agents inside the driver
//! process. It offers capacity to the market, runs task groups by replaying
//! their steps as progress events, and records everything it is asked to do.
//! The binary uses it for `--local` dry runs, and the test suites use it to
//! script agent behavior.
//!
//! A task group only completes once the datasets produced by its parent step
//! groups exist, so completion order follows the plan's dependencies even
//! though every task group is dispatched concurrently. When a task group fails
//! its outputs are lost, and any task group consuming them fails its first step.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::market::{AgentLocation, BidSummary, MarketError, Offer, OfferSource};
use crate::plan::{DatasetId, ExecutionPlan, StepId, TaskGroupId};
use crate::protocol::{DeleteOutputRequest, ProgressEvent, TaskGroupRequest};
use crate::reporter::{StatusStream, StatusStreamConnector};
use crate::scheduler::agent::{AgentConnector, AgentSession};
use crate::scheduler::DispatchError;
use crate::status::FlowExecutionStatus;
use crate::transport::TransportError;

const LOCAL_DATA_CENTER: &str = "local";
const LOCAL_RACK: &str = "local";
const LOCAL_AGENT_MEMORY_MB: u64 = 16 * 1024;

/// How a local agent runs a task group
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AgentBehavior {
    /// Run every step in order
    #[default]
    Succeed,
    /// Run steps in order until `step_id`, which fails with `error`
    FailAt { step_id: StepId, error: String },
    /// Accept the task group and never report progress
    Hang,
    /// Emit exactly these events
    Scripted(Vec<ProgressEvent>),
}

#[derive(Debug, Default)]
struct Dependencies {
    inputs: Vec<DatasetId>,
    outputs: Vec<DatasetId>,
}

#[derive(Debug, Default)]
struct Inner {
    agents: Vec<AgentLocation>,
    /// Remaining offers the cluster will hand out; `None` for unlimited
    offer_limit: Mutex<Option<usize>>,
    next_agent: AtomicUsize,
    step_delay: Mutex<Duration>,
    behaviors: Mutex<HashMap<TaskGroupId, AgentBehavior>>,
    dependencies: Mutex<HashMap<TaskGroupId, Dependencies>>,
    produced: Mutex<HashSet<DatasetId>>,
    lost: Mutex<HashSet<DatasetId>>,
    produced_changed: Notify,
    inventory: Mutex<HashMap<String, String>>,
    bids: Mutex<HashMap<TaskGroupId, f64>>,
    shipped: Mutex<Vec<String>>,
    executed: Mutex<Vec<TaskGroupId>>,
    completed: Mutex<Vec<TaskGroupId>>,
    aborted: Mutex<Vec<TaskGroupId>>,
    deleted: Mutex<Vec<(TaskGroupId, Vec<DatasetId>)>>,
    fail_deletes: AtomicBool,
    connects: AtomicUsize,
    statuses: Mutex<Vec<FlowExecutionStatus>>,
    refuse_status_stream: AtomicBool,
}

/// Cheaply cloneable handle to one in-process cluster
#[derive(Debug, Clone)]
pub struct LocalCluster {
    inner: Arc<Inner>,
}

impl LocalCluster {
    /// `count` agents with unlimited offers
    pub fn with_agents(count: usize) -> Self {
        let agents = (0..count.max(1))
            .map(|index| {
                AgentLocation::new(LOCAL_DATA_CENTER, LOCAL_RACK, format!("local-agent-{index}:0"))
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                agents,
                ..Default::default()
            }),
        }
    }

    /// One agent that hands out at most `limit` offers over the cluster's life
    pub fn with_offer_limit(limit: usize) -> Self {
        let cluster = Self::with_agents(1);
        *cluster.inner.offer_limit.lock() = Some(limit);
        cluster
    }

    /// Learn which datasets each task group consumes and produces
    pub fn with_plan(self, plan: &ExecutionPlan) -> Self {
        let mut dependencies = self.inner.dependencies.lock();
        for task_group in &plan.task_groups {
            let inputs = plan
                .step_group(task_group.step_group_id)
                .map(|group| {
                    group
                        .parent_ids
                        .iter()
                        .filter_map(|parent| plan.step_group(*parent))
                        .filter_map(|parent| plan.last_step(parent))
                        .map(|step| step.output_dataset_id)
                        .collect()
                })
                .unwrap_or_default();
            dependencies.insert(
                task_group.id,
                Dependencies {
                    inputs,
                    outputs: plan.output_datasets(task_group),
                },
            );
        }
        drop(dependencies);
        self
    }

    pub fn with_step_delay(self, delay: Duration) -> Self {
        *self.inner.step_delay.lock() = delay;
        self
    }

    pub fn set_behavior(&self, task_group_id: TaskGroupId, behavior: AgentBehavior) {
        self.inner.behaviors.lock().insert(task_group_id, behavior);
    }

    /// Pretend every agent already holds `name` at `version`
    pub fn add_inventory(&self, name: impl Into<String>, version: impl Into<String>) {
        self.inner.inventory.lock().insert(name.into(), version.into());
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.inner.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn refuse_status_stream(&self, refuse: bool) {
        self.inner.refuse_status_stream.store(refuse, Ordering::SeqCst);
    }

    /// Bid amount seen per task group, ordered by task group
    pub fn bids(&self) -> Vec<(TaskGroupId, f64)> {
        let mut bids: Vec<_> = self
            .inner
            .bids
            .lock()
            .iter()
            .map(|(id, amount)| (*id, *amount))
            .collect();
        bids.sort_by_key(|(id, _)| *id);
        bids
    }

    pub fn shipped(&self) -> Vec<String> {
        self.inner.shipped.lock().clone()
    }

    pub fn execute_count(&self) -> usize {
        self.inner.executed.lock().len()
    }

    pub fn executed(&self) -> Vec<TaskGroupId> {
        self.inner.executed.lock().clone()
    }

    /// Task groups in the order they finished
    pub fn completion_order(&self) -> Vec<TaskGroupId> {
        self.inner.completed.lock().clone()
    }

    pub fn aborted(&self) -> Vec<TaskGroupId> {
        self.inner.aborted.lock().clone()
    }

    pub fn deleted(&self) -> Vec<(TaskGroupId, Vec<DatasetId>)> {
        self.inner.deleted.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn statuses(&self) -> Vec<FlowExecutionStatus> {
        self.inner.statuses.lock().clone()
    }

    fn produce(&self, task_group_id: TaskGroupId, outputs: &[DatasetId]) {
        self.inner.produced.lock().extend(outputs.iter().copied());
        self.inner.completed.lock().push(task_group_id);
        self.inner.produced_changed.notify_waiters();
    }

    fn lose(&self, outputs: &[DatasetId]) {
        self.inner.lost.lock().extend(outputs.iter().copied());
        self.inner.produced_changed.notify_waiters();
    }

    /// Wait until every input exists, or return the first input that was lost
    async fn wait_for(&self, inputs: &[DatasetId]) -> Result<(), DatasetId> {
        loop {
            let notified = self.inner.produced_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lost_input = {
                let lost = self.inner.lost.lock();
                inputs.iter().copied().find(|dataset| lost.contains(dataset))
            };
            if let Some(dataset) = lost_input {
                return Err(dataset);
            }
            let ready = {
                let produced = self.inner.produced.lock();
                inputs.iter().all(|dataset| produced.contains(dataset))
            };
            if ready {
                return Ok(());
            }
            notified.await;
        }
    }
}

#[async_trait]
impl OfferSource for LocalCluster {
    async fn fetch_offers(&self, demand: &[BidSummary]) -> Result<Vec<Offer>, MarketError> {
        {
            let mut bids = self.inner.bids.lock();
            for bid in demand {
                bids.insert(bid.task_group_id, bid.amount);
            }
        }

        // Offers handed out are leased to this round's demand
        let mut wanted = demand.len();
        if let Some(remaining) = self.inner.offer_limit.lock().as_mut() {
            wanted = wanted.min(*remaining);
            *remaining -= wanted;
        }

        Ok((0..wanted)
            .map(|_| {
                let index = self.inner.next_agent.fetch_add(1, Ordering::Relaxed)
                    % self.inner.agents.len();
                Offer {
                    location: self.inner.agents[index].clone(),
                    memory_mb: LOCAL_AGENT_MEMORY_MB,
                    module: String::new(),
                }
            })
            .collect())
    }
}

#[async_trait]
impl AgentConnector for LocalCluster {
    async fn connect(
        &self,
        location: &AgentLocation,
    ) -> Result<Box<dyn AgentSession>, DispatchError> {
        if !self.inner.agents.contains(location) {
            return Err(DispatchError::Agent(format!("no local agent at {location}")));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalAgentSession {
            cluster: self.clone(),
            run: None,
        }))
    }
}

#[derive(Debug)]
struct LocalRun {
    task_group_id: TaskGroupId,
    inputs: Vec<DatasetId>,
    outputs: Vec<DatasetId>,
    inputs_ready: bool,
    first_step: Option<StepId>,
    hang: bool,
    script: VecDeque<ProgressEvent>,
}

#[derive(Debug)]
struct LocalAgentSession {
    cluster: LocalCluster,
    run: Option<LocalRun>,
}

fn script_for(behavior: AgentBehavior, request: &TaskGroupRequest) -> VecDeque<ProgressEvent> {
    let mut script = VecDeque::new();
    match behavior {
        AgentBehavior::Scripted(events) => script.extend(events),
        AgentBehavior::Hang => {}
        AgentBehavior::Succeed => {
            for task in &request.tasks {
                script.push_back(ProgressEvent::StepStarted { step_id: task.step_id });
                script.push_back(ProgressEvent::StepCompleted { step_id: task.step_id });
            }
            script.push_back(ProgressEvent::GroupCompleted);
        }
        AgentBehavior::FailAt { step_id, error } => {
            for task in &request.tasks {
                script.push_back(ProgressEvent::StepStarted { step_id: task.step_id });
                if task.step_id == step_id {
                    script.push_back(ProgressEvent::StepFailed {
                        step_id,
                        error: error.clone(),
                    });
                    return script;
                }
                script.push_back(ProgressEvent::StepCompleted { step_id: task.step_id });
            }
            script.push_back(ProgressEvent::GroupCompleted);
        }
    }
    script
}

#[async_trait]
impl AgentSession for LocalAgentSession {
    async fn file_inventory(&mut self) -> Result<HashMap<String, String>, DispatchError> {
        Ok(self.cluster.inner.inventory.lock().clone())
    }

    async fn ship_file(
        &mut self,
        name: &str,
        version: &str,
        _contents: Vec<u8>,
    ) -> Result<(), DispatchError> {
        self.cluster
            .inner
            .inventory
            .lock()
            .insert(name.to_string(), version.to_string());
        self.cluster.inner.shipped.lock().push(name.to_string());
        Ok(())
    }

    async fn execute(&mut self, request: TaskGroupRequest) -> Result<(), DispatchError> {
        let behavior = self
            .cluster
            .inner
            .behaviors
            .lock()
            .get(&request.task_group_id)
            .cloned()
            .unwrap_or_default();
        let (inputs, outputs) = self
            .cluster
            .inner
            .dependencies
            .lock()
            .get(&request.task_group_id)
            .map(|deps| (deps.inputs.clone(), deps.outputs.clone()))
            .unwrap_or_default();

        debug!(
            task_group_id = request.task_group_id,
            ?behavior,
            "🧪 LOCAL: Executing task group"
        );
        self.cluster.inner.executed.lock().push(request.task_group_id);
        self.run = Some(LocalRun {
            task_group_id: request.task_group_id,
            inputs,
            outputs,
            inputs_ready: false,
            first_step: request.tasks.first().map(|task| task.step_id),
            hang: behavior == AgentBehavior::Hang,
            script: script_for(behavior, &request),
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ProgressEvent>, DispatchError> {
        let cluster = self.cluster.clone();
        let Some(run) = self.run.as_mut() else {
            return Err(DispatchError::Protocol("no task group running".to_string()));
        };

        if !run.inputs_ready {
            if let Err(dataset) = cluster.wait_for(&run.inputs).await {
                run.script.clear();
                if let Some(step_id) = run.first_step {
                    run.script.push_back(ProgressEvent::StepStarted { step_id });
                    run.script.push_back(ProgressEvent::StepFailed {
                        step_id,
                        error: format!("input dataset d{dataset} was lost"),
                    });
                }
                run.hang = false;
            }
            run.inputs_ready = true;
        }
        if run.hang {
            std::future::pending::<()>().await;
        }

        let delay = *cluster.inner.step_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let event = run.script.pop_front();
        match &event {
            Some(ProgressEvent::GroupCompleted) => cluster.produce(run.task_group_id, &run.outputs),
            Some(ProgressEvent::StepFailed { .. }) => cluster.lose(&run.outputs),
            _ => {}
        }
        Ok(event)
    }

    async fn abort(&mut self, task_group_id: TaskGroupId) -> Result<(), DispatchError> {
        self.cluster.inner.aborted.lock().push(task_group_id);
        self.run = None;
        Ok(())
    }

    async fn delete_output(&mut self, request: DeleteOutputRequest) -> Result<(), DispatchError> {
        if self.cluster.inner.fail_deletes.load(Ordering::SeqCst) {
            return Err(DispatchError::Agent("delete refused".to_string()));
        }
        self.cluster
            .inner
            .deleted
            .lock()
            .push((request.task_group_id, request.dataset_ids));
        Ok(())
    }
}

#[async_trait]
impl StatusStreamConnector for LocalCluster {
    async fn open(&self, _job_id: u32) -> Result<Box<dyn StatusStream>, TransportError> {
        if self.inner.refuse_status_stream.load(Ordering::SeqCst) {
            return Err(TransportError::Remote("status stream refused".to_string()));
        }
        Ok(Box::new(LocalStatusStream {
            cluster: self.clone(),
        }))
    }
}

#[derive(Debug)]
struct LocalStatusStream {
    cluster: LocalCluster,
}

#[async_trait]
impl StatusStream for LocalStatusStream {
    async fn send(&mut self, status: &FlowExecutionStatus) -> Result<(), TransportError> {
        self.cluster.inner.statuses.lock().push(status.clone());
        Ok(())
    }
}
