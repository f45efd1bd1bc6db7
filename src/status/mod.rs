//! # Execution Status Tree
//!
//! Live, ID-indexed record of step group and step progress for one flow run.
//!
//! Every task-group execution writes to the status tree concurrently, and the
//! status reporter reads it. Writers are partitioned when the run starts:
//! [`StatusTree::partition`] hands each task group a [`TaskGroupStatusHandle`]
//! that can only address the step group and steps that group owns, so no two
//! executions ever touch the same record. Each record sits in its own slot, and
//! the reporter works from a cloned [`FlowExecutionStatus`] snapshot.

pub mod render;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::plan::{DatasetId, ExecutionPlan, StepGroupId, StepId, TaskGroupId};

pub use render::write_status_tree;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("Status tree has already been partitioned")]
    AlreadyPartitioned,

    #[error("Status record {kind} {id} is claimed by task groups {first} and {second}")]
    OverlappingOwnership {
        kind: &'static str,
        id: usize,
        first: TaskGroupId,
        second: TaskGroupId,
    },

    #[error("Task group {task_group} does not own step {step}")]
    NotOwned { task_group: TaskGroupId, step: StepId },
}

/// Lifecycle state of a step or step group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Pending,
    /// Bid submitted, waiting for a market match
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver lifecycle timestamps (unix seconds)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepGroupStatus {
    pub id: StepGroupId,
    pub step_ids: Vec<StepId>,
    pub parent_ids: Vec<StepGroupId>,
    pub task_group_id: Option<TaskGroupId>,
    pub state: ExecutionState,
    /// Agent the group was allocated to (`host:port`)
    pub agent: Option<String>,
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub id: StepId,
    pub name: String,
    pub output_dataset_id: DatasetId,
    pub task_group_id: Option<TaskGroupId>,
    pub state: ExecutionState,
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub error: Option<String>,
}

/// Point-in-time copy of the whole tree, as streamed to the master
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowExecutionStatus {
    pub id: u32,
    pub driver: DriverStatus,
    pub step_groups: Vec<StepGroupStatus>,
    pub steps: Vec<StepStatus>,
}

impl FlowExecutionStatus {
    pub fn step(&self, id: StepId) -> Option<&StepStatus> {
        self.steps.get(id)
    }

    pub fn step_group(&self, id: StepGroupId) -> Option<&StepGroupStatus> {
        self.step_groups.get(id)
    }

    /// Last step of a step group, whose output dataset feeds its children
    pub fn last_step(&self, group: &StepGroupStatus) -> Option<&StepStatus> {
        group.step_ids.last().and_then(|id| self.step(*id))
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// Shared status tree for one run
#[derive(Debug)]
pub struct StatusTree {
    id: u32,
    driver: RwLock<DriverStatus>,
    step_groups: Box<[RwLock<StepGroupStatus>]>,
    steps: Box<[RwLock<StepStatus>]>,
    partitioned: AtomicBool,
}

impl StatusTree {
    /// Create empty records mirroring the plan, addressed by plan ID
    pub fn from_plan(job_id: u32, plan: &ExecutionPlan) -> Self {
        let step_groups = plan
            .step_groups
            .iter()
            .map(|group| {
                RwLock::new(StepGroupStatus {
                    id: group.id,
                    step_ids: group.step_ids.clone(),
                    parent_ids: group.parent_ids.clone(),
                    task_group_id: None,
                    state: ExecutionState::Pending,
                    agent: None,
                    start_time: None,
                    stop_time: None,
                    error: None,
                })
            })
            .collect();
        let steps = plan
            .steps
            .iter()
            .map(|step| {
                RwLock::new(StepStatus {
                    id: step.id,
                    name: step.name.clone(),
                    output_dataset_id: step.output_dataset_id,
                    task_group_id: None,
                    state: ExecutionState::Pending,
                    start_time: None,
                    stop_time: None,
                    error: None,
                })
            })
            .collect();

        Self {
            id: job_id,
            driver: RwLock::new(DriverStatus::default()),
            step_groups,
            steps,
            partitioned: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> u32 {
        self.id
    }

    pub fn mark_driver_started(&self) {
        self.driver.write().start_time = Some(now());
    }

    pub fn mark_driver_stopped(&self) {
        self.driver.write().stop_time = Some(now());
    }

    pub fn snapshot(&self) -> FlowExecutionStatus {
        FlowExecutionStatus {
            id: self.id,
            driver: self.driver.read().clone(),
            step_groups: self.step_groups.iter().map(|slot| slot.read().clone()).collect(),
            steps: self.steps.iter().map(|slot| slot.read().clone()).collect(),
        }
    }

    /// Split write access between task groups. Each record is owned by at most
    /// one task group and the tree can be partitioned only once, so handles
    /// never alias.
    pub fn partition(
        self: &Arc<Self>,
        plan: &ExecutionPlan,
    ) -> Result<Vec<TaskGroupStatusHandle>, StatusError> {
        let mut group_owner: Vec<Option<TaskGroupId>> = vec![None; self.step_groups.len()];
        let mut step_owner: Vec<Option<TaskGroupId>> = vec![None; self.steps.len()];

        for task_group in &plan.task_groups {
            claim(&mut group_owner, "step group", task_group.step_group_id, task_group.id)?;
            for step in task_group.step_ids() {
                claim(&mut step_owner, "step", step, task_group.id)?;
            }
        }

        if self.partitioned.swap(true, Ordering::SeqCst) {
            return Err(StatusError::AlreadyPartitioned);
        }

        for (slot, owner) in self.step_groups.iter().zip(&group_owner) {
            slot.write().task_group_id = *owner;
        }
        for (slot, owner) in self.steps.iter().zip(&step_owner) {
            slot.write().task_group_id = *owner;
        }

        Ok(plan
            .task_groups
            .iter()
            .map(|task_group| TaskGroupStatusHandle {
                tree: Arc::clone(self),
                task_group_id: task_group.id,
                step_group_id: task_group.step_group_id,
                step_ids: task_group.step_ids().collect(),
            })
            .collect())
    }
}

fn claim(
    owners: &mut [Option<TaskGroupId>],
    kind: &'static str,
    id: usize,
    task_group: TaskGroupId,
) -> Result<(), StatusError> {
    // Out-of-range ids are rejected by plan validation
    let Some(owner) = owners.get_mut(id) else {
        return Ok(());
    };
    match owner {
        Some(first) if *first != task_group => Err(StatusError::OverlappingOwnership {
            kind,
            id,
            first: *first,
            second: task_group,
        }),
        _ => {
            *owner = Some(task_group);
            Ok(())
        }
    }
}

/// Exclusive writer for the records of one task group
#[derive(Debug)]
pub struct TaskGroupStatusHandle {
    tree: Arc<StatusTree>,
    task_group_id: TaskGroupId,
    step_group_id: StepGroupId,
    step_ids: Vec<StepId>,
}

impl TaskGroupStatusHandle {
    pub fn task_group_id(&self) -> TaskGroupId {
        self.task_group_id
    }

    pub fn step_group_id(&self) -> StepGroupId {
        self.step_group_id
    }

    /// Steps of this group in declared order
    pub fn step_ids(&self) -> &[StepId] {
        &self.step_ids
    }

    pub fn state(&self) -> ExecutionState {
        self.group().read().state
    }

    pub fn step_state(&self, step: StepId) -> Result<ExecutionState, StatusError> {
        Ok(self.owned_step(step)?.read().state)
    }

    pub fn step_name(&self, step: StepId) -> Option<String> {
        self.owned_step(step).ok().map(|slot| slot.read().name.clone())
    }

    pub fn mark_waiting(&self) {
        self.group().write().state = ExecutionState::Waiting;
    }

    pub fn mark_allocated(&self, agent: &str) {
        let mut group = self.group().write();
        group.agent = Some(agent.to_string());
        group.state = ExecutionState::Running;
        group.start_time = Some(now());
    }

    pub fn mark_step_started(&self, step: StepId) -> Result<(), StatusError> {
        let mut record = self.owned_step(step)?.write();
        record.state = ExecutionState::Running;
        record.start_time = Some(now());
        Ok(())
    }

    pub fn mark_step_completed(&self, step: StepId) -> Result<(), StatusError> {
        let mut record = self.owned_step(step)?.write();
        record.state = ExecutionState::Completed;
        record.stop_time = Some(now());
        Ok(())
    }

    pub fn mark_step_failed(&self, step: StepId, error: &str) -> Result<(), StatusError> {
        let mut record = self.owned_step(step)?.write();
        record.state = ExecutionState::Failed;
        record.stop_time = Some(now());
        record.error = Some(error.to_string());
        Ok(())
    }

    pub fn mark_completed(&self) {
        self.finish(ExecutionState::Completed, None);
    }

    /// Mark the group failed; a step still running fails with it
    pub fn mark_failed(&self, error: &str) {
        self.settle_running_steps(ExecutionState::Failed);
        self.finish(ExecutionState::Failed, Some(error));
    }

    /// Mark the group and any step still running as cancelled
    pub fn mark_cancelled(&self, reason: &str) {
        self.settle_running_steps(ExecutionState::Cancelled);
        self.finish(ExecutionState::Cancelled, Some(reason));
    }

    fn settle_running_steps(&self, state: ExecutionState) {
        for &step in &self.step_ids {
            if let Some(slot) = self.tree.steps.get(step) {
                let mut record = slot.write();
                if record.state == ExecutionState::Running {
                    record.state = state;
                    record.stop_time = Some(now());
                }
            }
        }
    }

    fn finish(&self, state: ExecutionState, error: Option<&str>) {
        let mut group = self.group().write();
        group.state = state;
        group.stop_time = Some(now());
        group.error = error.map(str::to_string);
    }

    fn group(&self) -> &RwLock<StepGroupStatus> {
        &self.tree.step_groups[self.step_group_id]
    }

    fn owned_step(&self, step: StepId) -> Result<&RwLock<StepStatus>, StatusError> {
        if !self.step_ids.contains(&step) {
            return Err(StatusError::NotOwned {
                task_group: self.task_group_id,
                step,
            });
        }
        self.tree.steps.get(step).ok_or(StatusError::NotOwned {
            task_group: self.task_group_id,
            step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Step, StepGroup, Task, TaskGroup};

    fn two_group_plan() -> ExecutionPlan {
        ExecutionPlan {
            name: "pair".to_string(),
            steps: vec![
                Step { id: 0, name: "read".to_string(), output_dataset_id: 0 },
                Step { id: 1, name: "map".to_string(), output_dataset_id: 1 },
                Step { id: 2, name: "reduce".to_string(), output_dataset_id: 2 },
            ],
            step_groups: vec![
                StepGroup { id: 0, step_ids: vec![0, 1], parent_ids: vec![] },
                StepGroup { id: 1, step_ids: vec![2], parent_ids: vec![0] },
            ],
            task_groups: vec![
                TaskGroup {
                    id: 0,
                    step_group_id: 0,
                    tasks: vec![
                        Task { step_id: 0, name: "read".to_string() },
                        Task { step_id: 1, name: "map".to_string() },
                    ],
                },
                TaskGroup {
                    id: 1,
                    step_group_id: 1,
                    tasks: vec![Task { step_id: 2, name: "reduce".to_string() }],
                },
            ],
        }
    }

    #[test]
    fn tree_mirrors_plan_ids() {
        let plan = two_group_plan();
        let tree = StatusTree::from_plan(7, &plan);
        let snapshot = tree.snapshot();
        assert_eq!(snapshot.id, 7);
        assert_eq!(snapshot.step_groups.len(), 2);
        assert_eq!(snapshot.steps[2].name, "reduce");
        assert!(snapshot.steps.iter().all(|s| s.state == ExecutionState::Pending));
    }

    #[test]
    fn partition_assigns_exclusive_owners() {
        let plan = two_group_plan();
        let tree = Arc::new(StatusTree::from_plan(1, &plan));
        let handles = tree.partition(&plan).unwrap();

        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].step_ids(), &[0, 1]);
        let snapshot = tree.snapshot();
        assert_eq!(snapshot.steps[1].task_group_id, Some(0));
        assert_eq!(snapshot.steps[2].task_group_id, Some(1));
        assert_eq!(snapshot.step_groups[1].task_group_id, Some(1));
    }

    #[test]
    fn partition_happens_once() {
        let plan = two_group_plan();
        let tree = Arc::new(StatusTree::from_plan(1, &plan));
        let _handles = tree.partition(&plan).unwrap();
        assert_eq!(tree.partition(&plan).unwrap_err(), StatusError::AlreadyPartitioned);
    }

    #[test]
    fn partition_rejects_overlap() {
        let mut plan = two_group_plan();
        plan.task_groups[1].tasks.push(Task { step_id: 1, name: "map".to_string() });
        let tree = Arc::new(StatusTree::from_plan(1, &plan));
        let err = tree.partition(&plan).unwrap_err();
        assert_eq!(
            err,
            StatusError::OverlappingOwnership { kind: "step", id: 1, first: 0, second: 1 }
        );
    }

    #[test]
    fn handle_cannot_write_foreign_steps() {
        let plan = two_group_plan();
        let tree = Arc::new(StatusTree::from_plan(1, &plan));
        let handles = tree.partition(&plan).unwrap();

        let err = handles[1].mark_step_started(0).unwrap_err();
        assert_eq!(err, StatusError::NotOwned { task_group: 1, step: 0 });
        assert_eq!(tree.snapshot().steps[0].state, ExecutionState::Pending);
    }

    #[test]
    fn lifecycle_updates_records() {
        let plan = two_group_plan();
        let tree = Arc::new(StatusTree::from_plan(1, &plan));
        let handles = tree.partition(&plan).unwrap();
        let handle = &handles[0];

        handle.mark_waiting();
        assert_eq!(handle.state(), ExecutionState::Waiting);

        handle.mark_allocated("agent-1:8000");
        handle.mark_step_started(0).unwrap();
        handle.mark_step_completed(0).unwrap();
        handle.mark_step_started(1).unwrap();
        handle.mark_step_failed(1, "oom").unwrap();
        handle.mark_failed("step 1 failed: oom");

        let snapshot = tree.snapshot();
        let group = &snapshot.step_groups[0];
        assert_eq!(group.state, ExecutionState::Failed);
        assert_eq!(group.agent.as_deref(), Some("agent-1:8000"));
        assert!(group.start_time.is_some() && group.stop_time.is_some());
        assert_eq!(snapshot.steps[0].state, ExecutionState::Completed);
        assert_eq!(snapshot.steps[1].error.as_deref(), Some("oom"));
    }

    #[test]
    fn cancel_marks_running_steps() {
        let plan = two_group_plan();
        let tree = Arc::new(StatusTree::from_plan(1, &plan));
        let handles = tree.partition(&plan).unwrap();
        handles[0].mark_step_started(0).unwrap();
        handles[0].mark_cancelled("interrupted");

        let snapshot = tree.snapshot();
        assert_eq!(snapshot.steps[0].state, ExecutionState::Cancelled);
        assert_eq!(snapshot.steps[1].state, ExecutionState::Pending);
        assert_eq!(snapshot.step_groups[0].state, ExecutionState::Cancelled);
    }

    #[test]
    fn concurrent_writers_touch_only_their_records() {
        let plan = two_group_plan();
        let tree = Arc::new(StatusTree::from_plan(1, &plan));
        let handles = tree.partition(&plan).unwrap();

        let threads: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        for &step in handle.step_ids().to_vec().iter() {
                            handle.mark_step_started(step).unwrap();
                            handle.mark_step_completed(step).unwrap();
                        }
                    }
                    handle.mark_completed();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let snapshot = tree.snapshot();
        assert!(snapshot.step_groups.iter().all(|g| g.state == ExecutionState::Completed));
        assert!(snapshot.steps.iter().all(|s| s.state == ExecutionState::Completed));
    }

    #[test]
    fn driver_timestamps() {
        let tree = StatusTree::from_plan(3, &two_group_plan());
        assert_eq!(tree.snapshot().driver, DriverStatus::default());
        tree.mark_driver_started();
        tree.mark_driver_stopped();
        let driver = tree.snapshot().driver;
        assert!(driver.start_time.is_some());
        assert!(driver.stop_time >= driver.start_time);
    }
}
