//! Run-once, best-effort deletion of intermediate outputs.
//!
//! The driver calls [`Cleanup::run`] on the interrupt path and again after the
//! run body finishes on every exit path. Only the first call deletes anything;
//! every later call waits for that pass and returns the same report.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::plan::{ExecutionPlan, TaskGroupId};
use crate::scheduler::{CleanupOutcome, Scheduler};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub outcomes: Vec<(TaskGroupId, CleanupOutcome)>,
}

impl CleanupReport {
    /// Task groups for which a deletion was attempted
    pub fn invoked(&self) -> usize {
        self.outcomes.len()
    }

    pub fn deleted(&self) -> usize {
        self.count(|outcome| matches!(outcome, CleanupOutcome::Deleted { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, CleanupOutcome::Failed { .. }))
    }

    pub fn nothing_dispatched(&self) -> usize {
        self.count(|outcome| *outcome == CleanupOutcome::NothingDispatched)
    }

    pub fn outcome(&self, task_group_id: TaskGroupId) -> Option<&CleanupOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == task_group_id)
            .map(|(_, outcome)| outcome)
    }

    fn count(&self, predicate: impl Fn(&CleanupOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| predicate(outcome)).count()
    }
}

#[derive(Debug)]
pub struct Cleanup {
    scheduler: Arc<Scheduler>,
    plan: Arc<ExecutionPlan>,
    report: OnceCell<CleanupReport>,
}

impl Cleanup {
    pub fn new(scheduler: Arc<Scheduler>, plan: Arc<ExecutionPlan>) -> Self {
        Self {
            scheduler,
            plan,
            report: OnceCell::new(),
        }
    }

    pub fn has_run(&self) -> bool {
        self.report.initialized()
    }

    /// Delete the output of every task group, at most once per run
    pub async fn run(&self) -> &CleanupReport {
        self.report
            .get_or_init(|| async move {
                info!(
                    task_groups = self.plan.task_groups.len(),
                    "🧹 CLEANUP: Deleting task group outputs"
                );
                let outcomes = join_all(self.plan.task_groups.iter().map(|task_group| async move {
                    let outcome = self.scheduler.delete_output(&self.plan, task_group).await;
                    (task_group.id, outcome)
                }))
                .await;

                let report = CleanupReport { outcomes };
                info!(
                    deleted = report.deleted(),
                    failed = report.failed(),
                    nothing_dispatched = report.nothing_dispatched(),
                    "🧹 CLEANUP: Finished"
                );
                report
            })
            .await
    }
}
