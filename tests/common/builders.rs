use std::time::Duration;

use flow_driver::{
    Collaborators, DriverOption, ExecutionPlan, FlowDriver, LocalCluster, Step, StepGroup, Task,
    TaskGroup,
};

/// Build a plan where step group `i` has `steps_per_group` steps and the
/// parents listed in `parents[i]`. Task group `i` runs step group `i`.
pub fn plan_with_parents(
    name: &str,
    parents: &[Vec<usize>],
    steps_per_group: usize,
) -> ExecutionPlan {
    let mut plan = ExecutionPlan {
        name: name.to_string(),
        ..Default::default()
    };

    for (group_id, group_parents) in parents.iter().enumerate() {
        let step_ids: Vec<usize> = (0..steps_per_group)
            .map(|offset| group_id * steps_per_group + offset)
            .collect();
        for &step_id in &step_ids {
            plan.steps.push(Step {
                id: step_id,
                name: format!("g{group_id}s{step_id}"),
                output_dataset_id: step_id,
            });
        }
        plan.step_groups.push(StepGroup {
            id: group_id,
            step_ids: step_ids.clone(),
            parent_ids: group_parents.clone(),
        });
        plan.task_groups.push(TaskGroup {
            id: group_id,
            step_group_id: group_id,
            tasks: step_ids
                .iter()
                .map(|&step_id| Task {
                    step_id,
                    name: format!("g{group_id}s{step_id}"),
                })
                .collect(),
        });
    }
    plan
}

/// A -> B -> C
pub fn chain_plan() -> ExecutionPlan {
    plan_with_parents("chain", &[vec![], vec![0], vec![1]], 1)
}

/// Two independent roots, the third group consumes the first root
pub fn fork_plan() -> ExecutionPlan {
    plan_with_parents("fork", &[vec![], vec![], vec![0]], 2)
}

/// Options with short intervals so tests run in milliseconds
pub fn fast_option(flow_bid: f64) -> DriverOption {
    DriverOption {
        master: "test-master:45326".to_string(),
        flow_bid,
        market_poll_interval_ms: 10,
        report_interval_ms: 25,
        connect_timeout_ms: 1_000,
        ..Default::default()
    }
}

pub fn local_driver(option: DriverOption, cluster: &LocalCluster) -> FlowDriver {
    FlowDriver::new(option, Collaborators::local(cluster)).with_job_id(4242)
}

/// Resolve once `condition` holds, then wait `settle` more
pub async fn once(condition: impl Fn() -> bool, settle: Duration) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(settle).await;
}
