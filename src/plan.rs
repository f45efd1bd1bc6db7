//! # Execution Plan
//!
//! The planner fuses a dataflow graph into [`StepGroup`]s (steps that run in one
//! place to avoid intermediate disk writes) and [`TaskGroup`]s (the physical
//! units the scheduler dispatches). The driver consumes the result as a
//! read-only [`ExecutionPlan`].
//!
//! Entity IDs are dense: the step with ID `n` lives at `steps[n]`, and the same
//! holds for step groups and task groups. The status tree relies on this to
//! address records by ID without reallocating.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub type StepId = usize;
pub type StepGroupId = usize;
pub type TaskGroupId = usize;
pub type DatasetId = usize;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan has no task groups")]
    NoTaskGroups,

    #[error("{kind} at index {index} has id {id}; ids must equal their position")]
    IdMismatch {
        kind: &'static str,
        index: usize,
        id: usize,
    },

    #[error("Step group {step_group} references unknown step {step}")]
    UnknownStep { step_group: StepGroupId, step: StepId },

    #[error("Step group {step_group} references unknown parent {parent}")]
    UnknownParent {
        step_group: StepGroupId,
        parent: StepGroupId,
    },

    #[error("Step {step} belongs to more than one step group")]
    StepInMultipleGroups { step: StepId },

    #[error("Step group {step_group} is part of a dependency cycle")]
    Cycle { step_group: StepGroupId },

    #[error("Task group {task_group} references unknown step group {step_group}")]
    UnknownStepGroup {
        task_group: TaskGroupId,
        step_group: StepGroupId,
    },

    #[error("Step group {step_group} is claimed by more than one task group")]
    StepGroupClaimedTwice { step_group: StepGroupId },

    #[error("Task group {task_group} has no tasks")]
    EmptyTaskGroup { task_group: TaskGroupId },

    #[error("Task group {task_group} tasks do not match the steps of step group {step_group}")]
    TaskStepMismatch {
        task_group: TaskGroupId,
        step_group: StepGroupId,
    },

    #[error("Failed to read plan: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse plan: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One named atomic operation producing one output dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub output_dataset_id: DatasetId,
}

/// Fused steps that run in one physical location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepGroup {
    pub id: StepGroupId,
    /// Steps in execution order
    pub step_ids: Vec<StepId>,
    #[serde(default)]
    pub parent_ids: Vec<StepGroupId>,
}

/// One unit of opaque work run by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub step_id: StepId,
    pub name: String,
}

/// The physical dispatch unit derived from a step group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub step_group_id: StepGroupId,
    pub tasks: Vec<Task>,
}

impl TaskGroup {
    pub fn step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
        self.tasks.iter().map(|task| task.step_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub name: String,
    pub steps: Vec<Step>,
    pub step_groups: Vec<StepGroup>,
    pub task_groups: Vec<TaskGroup>,
}

impl ExecutionPlan {
    /// Read a JSON plan from disk and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let raw = std::fs::read_to_string(path)?;
        let plan: ExecutionPlan = serde_json::from_str(&raw)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn step_group(&self, id: StepGroupId) -> Option<&StepGroup> {
        self.step_groups.get(id)
    }

    pub fn task_group(&self, id: TaskGroupId) -> Option<&TaskGroup> {
        self.task_groups.get(id)
    }

    /// Last step of a step group; its output feeds the group's children
    pub fn last_step(&self, step_group: &StepGroup) -> Option<&Step> {
        step_group.step_ids.last().and_then(|id| self.step(*id))
    }

    /// Output datasets produced by a task group's steps
    pub fn output_datasets(&self, task_group: &TaskGroup) -> Vec<DatasetId> {
        task_group
            .step_ids()
            .filter_map(|id| self.step(id))
            .map(|step| step.output_dataset_id)
            .collect()
    }

    /// Check structural invariants. Planning errors are fatal before any dispatch.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.task_groups.is_empty() {
            return Err(PlanError::NoTaskGroups);
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.id != index {
                return Err(PlanError::IdMismatch { kind: "step", index, id: step.id });
            }
        }

        let mut step_owner: HashMap<StepId, StepGroupId> = HashMap::new();
        for (index, group) in self.step_groups.iter().enumerate() {
            if group.id != index {
                return Err(PlanError::IdMismatch { kind: "step group", index, id: group.id });
            }
            for &step in &group.step_ids {
                if step >= self.steps.len() {
                    return Err(PlanError::UnknownStep { step_group: group.id, step });
                }
                if step_owner.insert(step, group.id).is_some() {
                    return Err(PlanError::StepInMultipleGroups { step });
                }
            }
            for &parent in &group.parent_ids {
                if parent >= self.step_groups.len() {
                    return Err(PlanError::UnknownParent { step_group: group.id, parent });
                }
            }
        }

        check_acyclic(&self.step_groups)?;

        let mut claimed = vec![false; self.step_groups.len()];
        for (index, task_group) in self.task_groups.iter().enumerate() {
            if task_group.id != index {
                return Err(PlanError::IdMismatch { kind: "task group", index, id: task_group.id });
            }
            let step_group = self.step_group(task_group.step_group_id).ok_or(
                PlanError::UnknownStepGroup {
                    task_group: task_group.id,
                    step_group: task_group.step_group_id,
                },
            )?;
            if std::mem::replace(&mut claimed[step_group.id], true) {
                return Err(PlanError::StepGroupClaimedTwice { step_group: step_group.id });
            }
            if task_group.tasks.is_empty() {
                return Err(PlanError::EmptyTaskGroup { task_group: task_group.id });
            }
            if !task_group.step_ids().eq(step_group.step_ids.iter().copied()) {
                return Err(PlanError::TaskStepMismatch {
                    task_group: task_group.id,
                    step_group: step_group.id,
                });
            }
        }

        Ok(())
    }

    /// Step groups by topological layer: roots first, every group strictly
    /// after all of its parents
    pub fn layers(&self) -> Vec<Vec<StepGroupId>> {
        topological_layers(self.step_groups.len(), |id| {
            self.step_groups[id].parent_ids.as_slice()
        })
    }

    pub fn log_execution_plan(&self) {
        info!(
            plan = %self.name,
            steps = self.steps.len(),
            step_groups = self.step_groups.len(),
            task_groups = self.task_groups.len(),
            "🗺️ DRIVER: Execution plan"
        );
        for (layer, ids) in self.layers().iter().enumerate() {
            for &id in ids {
                let group = &self.step_groups[id];
                let steps: Vec<&str> = group
                    .step_ids
                    .iter()
                    .filter_map(|step| self.step(*step))
                    .map(|step| step.name.as_str())
                    .collect();
                info!(
                    layer = layer,
                    step_group = id,
                    parents = ?group.parent_ids,
                    steps = ?steps,
                    "  step group"
                );
            }
        }
    }
}

fn check_acyclic(groups: &[StepGroup]) -> Result<(), PlanError> {
    let (_, cyclic) = kahn_layers(groups.len(), |id| groups[id].parent_ids.as_slice());
    match cyclic.first() {
        Some(&step_group) => Err(PlanError::Cycle { step_group }),
        None => Ok(()),
    }
}

/// Layer step groups given a parent lookup. A group's layer is the length of
/// the longest parent chain above it. Groups on a cycle are left out.
pub fn topological_layers<'a, F>(count: usize, parents: F) -> Vec<Vec<usize>>
where
    F: Fn(usize) -> &'a [usize],
{
    kahn_layers(count, parents).0
}

/// Iterative Kahn pass, one frontier per layer. Returns the layers and the
/// ids that never reached zero in-degree, ascending.
fn kahn_layers<'a, F>(count: usize, parents: F) -> (Vec<Vec<usize>>, Vec<usize>)
where
    F: Fn(usize) -> &'a [usize],
{
    let mut in_degree = vec![0usize; count];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (id, degree) in in_degree.iter_mut().enumerate() {
        for &parent in parents(id).iter().filter(|&&parent| parent < count) {
            *degree += 1;
            children[parent].push(id);
        }
    }

    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut frontier: Vec<usize> = (0..count).filter(|&id| in_degree[id] == 0).collect();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for &id in &frontier {
            for &child in &children[id] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    next.push(child);
                }
            }
        }
        next.sort_unstable();
        layers.push(std::mem::replace(&mut frontier, next));
    }

    let cyclic = (0..count).filter(|&id| in_degree[id] > 0).collect();
    (layers, cyclic)
}
