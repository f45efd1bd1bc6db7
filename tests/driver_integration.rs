//! End-to-end runs of the driver against an in-process cluster.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use flow_driver::reporter::{StatusStream, StatusStreamConnector};
use flow_driver::transport::TransportError;
use flow_driver::{
    AgentBehavior, CleanupOutcome, Collaborators, ExecutionState, FileResource, FlowDriver,
    FlowError, LocalCluster, TaskGroupOutcome,
};

/// A master that accepts the status stream request and never answers
struct SilentMaster;

#[async_trait]
impl StatusStreamConnector for SilentMaster {
    async fn open(&self, _job_id: u32) -> Result<Box<dyn StatusStream>, TransportError> {
        std::future::pending().await
    }
}

fn silent_master_driver(cluster: &LocalCluster) -> FlowDriver {
    let mut option = fast_option(3.0);
    option.connect_timeout_ms = 60_000;
    let collaborators = Collaborators {
        status_streams: Arc::new(SilentMaster),
        ..Collaborators::local(cluster)
    };
    FlowDriver::new(option, collaborators)
}

#[tokio::test]
async fn chain_runs_in_dependency_order_and_cleans_up() {
    let plan = chain_plan();
    let cluster = LocalCluster::with_agents(2)
        .with_plan(&plan)
        .with_step_delay(Duration::from_millis(1));

    let mut library = tempfile::NamedTempFile::new().unwrap();
    library.write_all(b"compiled flow functions").unwrap();
    let shipped_file = FileResource::from_path(library.path()).unwrap();
    let preinstalled = FileResource::new("preinstalled.so", "/nonexistent/preinstalled.so", "v1");
    cluster.add_inventory("preinstalled.so", "v1");

    let mut option = fast_option(9.0);
    option.required_files = vec![shipped_file.clone(), preinstalled];

    let summary = local_driver(option, &cluster)
        .run_flow_until(plan, std::future::pending())
        .await
        .unwrap();

    assert!(summary.succeeded());
    assert_eq!(summary.job_id, 4242);
    assert_eq!(summary.completed(), 3);
    assert_eq!(summary.launched, 3);
    assert_eq!(summary.barrier_releases, 3);
    assert_eq!(summary.dispatched, 3);
    assert_eq!(cluster.bids(), vec![(0, 3.0), (1, 3.0), (2, 3.0)]);
    assert_eq!(cluster.completion_order(), vec![0, 1, 2]);

    let shipped = cluster.shipped();
    assert!(shipped.contains(&shipped_file.name));
    assert!(!shipped.iter().any(|name| name == "preinstalled.so"));

    assert_eq!(summary.cleanup.invoked(), 3);
    assert_eq!(summary.cleanup.deleted(), 3);
    let mut deleted = cluster.deleted();
    deleted.sort();
    assert_eq!(deleted, vec![(0, vec![0]), (1, vec![1]), (2, vec![2])]);

    assert!(summary.status.driver.start_time.is_some());
    assert!(summary.status.driver.stop_time.is_some());
    assert!(summary
        .status
        .step_groups
        .iter()
        .all(|group| group.state == ExecutionState::Completed));

    let report = summary.report.unwrap();
    assert!(report.connected);
    assert!(report.final_sent);
    let last_sent = cluster.statuses().pop().unwrap();
    assert_eq!(last_sent.id, 4242);
    assert!(last_sent.driver.stop_time.is_some());
    assert!(last_sent.steps.iter().all(|step| step.state == ExecutionState::Completed));
}

#[tokio::test]
async fn interrupt_before_any_offer_cancels_everything() {
    let plan = chain_plan();
    let cluster = LocalCluster::with_offer_limit(0).with_plan(&plan);

    let summary = local_driver(fast_option(3.0), &cluster)
        .run_flow_until(plan, tokio::time::sleep(Duration::from_millis(50)))
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert!(!summary.succeeded());
    assert_eq!(cluster.execute_count(), 0);
    assert_eq!(cluster.bids().len(), 3);
    assert_eq!(summary.cancelled(), 3);
    for (_, outcome) in &summary.outcomes {
        assert_eq!(*outcome, TaskGroupOutcome::Cancelled { dispatched: false });
    }

    let snapshot = summary.interrupt_snapshot.as_ref().unwrap();
    assert!(snapshot
        .step_groups
        .iter()
        .all(|group| group.state == ExecutionState::Waiting));

    assert_eq!(summary.cleanup.invoked(), 3);
    assert_eq!(summary.cleanup.nothing_dispatched(), 3);
    assert!(cluster.deleted().is_empty());
    assert_eq!(summary.barrier_releases, 3);
}

#[tokio::test]
async fn interrupt_aborts_running_group_and_deletes_only_its_output() {
    let plan = chain_plan();
    let cluster = LocalCluster::with_offer_limit(1).with_plan(&plan);
    for task_group in 0..3 {
        cluster.set_behavior(task_group, AgentBehavior::Hang);
    }

    let watched = cluster.clone();
    let interrupt = once(move || watched.execute_count() == 1, Duration::from_millis(30));

    let summary = local_driver(fast_option(3.0), &cluster)
        .run_flow_until(plan, interrupt)
        .await
        .unwrap();

    assert!(summary.interrupted);
    let snapshot = summary.interrupt_snapshot.as_ref().unwrap();
    let waiting = snapshot
        .step_groups
        .iter()
        .filter(|group| group.state == ExecutionState::Waiting)
        .count();
    let running = snapshot
        .step_groups
        .iter()
        .filter(|group| group.state == ExecutionState::Running)
        .count();
    assert_eq!((waiting, running), (2, 1));

    let executed = cluster.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(cluster.aborted(), executed);
    assert_eq!(
        summary.outcome(executed[0]),
        Some(&TaskGroupOutcome::Cancelled { dispatched: true })
    );

    assert_eq!(summary.cleanup.deleted(), 1);
    assert_eq!(summary.cleanup.nothing_dispatched(), 2);
    assert!(matches!(
        summary.cleanup.outcome(executed[0]),
        Some(CleanupOutcome::Deleted { .. })
    ));
    assert_eq!(cluster.deleted().len(), 1);
    assert!(summary
        .status
        .step_groups
        .iter()
        .all(|group| group.state == ExecutionState::Cancelled));
}

#[tokio::test]
async fn failed_group_does_not_stop_independent_groups() {
    let plan = fork_plan();
    let cluster = LocalCluster::with_agents(3).with_plan(&plan);
    cluster.set_behavior(
        1,
        AgentBehavior::FailAt {
            step_id: 3,
            error: "disk full".to_string(),
        },
    );

    let summary = local_driver(fast_option(3.0), &cluster)
        .run_flow_until(plan, std::future::pending())
        .await
        .unwrap();

    assert!(!summary.interrupted);
    assert!(!summary.succeeded());
    assert_eq!(summary.outcome(0), Some(&TaskGroupOutcome::Completed));
    assert_eq!(summary.outcome(2), Some(&TaskGroupOutcome::Completed));
    assert!(matches!(summary.outcome(1), Some(TaskGroupOutcome::Failed { .. })));

    let status = &summary.status;
    assert_eq!(status.step(2).unwrap().state, ExecutionState::Completed);
    assert_eq!(status.step(3).unwrap().state, ExecutionState::Failed);
    assert_eq!(status.step(3).unwrap().error.as_deref(), Some("disk full"));
    assert_eq!(status.step_group(1).unwrap().state, ExecutionState::Failed);

    let order = cluster.completion_order();
    let position = |id| order.iter().position(|done| *done == id).unwrap();
    assert!(position(0) < position(2));

    // The failed group still reached an agent, so its output is deleted too
    assert_eq!(summary.cleanup.deleted(), 3);
}

#[tokio::test]
async fn lost_input_fails_every_consumer_downstream() {
    let plan = chain_plan();
    let cluster = LocalCluster::with_agents(2).with_plan(&plan);
    cluster.set_behavior(
        0,
        AgentBehavior::FailAt {
            step_id: 0,
            error: "segfault".to_string(),
        },
    );

    let summary = local_driver(fast_option(3.0), &cluster)
        .run_flow_until(plan, std::future::pending())
        .await
        .unwrap();

    assert_eq!(summary.failed(), 3);
    assert!(cluster.completion_order().is_empty());
    let error = summary.status.step(1).unwrap().error.clone().unwrap();
    assert!(error.contains("d0"), "unexpected error: {error}");
    let error = summary.status.step(2).unwrap().error.clone().unwrap();
    assert!(error.contains("d1"), "unexpected error: {error}");
    assert_eq!(summary.barrier_releases, 3);
}

#[tokio::test]
async fn refused_status_stream_does_not_block_the_run() {
    let plan = chain_plan();
    let cluster = LocalCluster::with_agents(1).with_plan(&plan);
    cluster.refuse_status_stream(true);

    let summary = local_driver(fast_option(3.0), &cluster)
        .run_flow_until(plan, std::future::pending())
        .await
        .unwrap();

    assert!(summary.succeeded());
    let report = summary.report.unwrap();
    assert!(!report.connected);
    assert!(!report.final_sent);
    assert!(cluster.statuses().is_empty());
    assert!(summary.status.driver.stop_time.is_some());
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_anything_runs() {
    let plan = plan_with_parents("cycle", &[vec![1], vec![0]], 1);
    let cluster = LocalCluster::with_agents(1).with_plan(&plan);

    let err = local_driver(fast_option(3.0), &cluster)
        .run_flow_until(plan, std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Plan(_)));
    assert!(cluster.bids().is_empty());
    assert_eq!(cluster.connect_count(), 0);
    assert!(cluster.statuses().is_empty());
}

#[tokio::test]
async fn invalid_option_is_a_configuration_error() {
    let plan = chain_plan();
    let cluster = LocalCluster::with_agents(1).with_plan(&plan);

    let err = local_driver(fast_option(0.0), &cluster)
        .run_flow_until(plan, std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Configuration(_)));
}

#[tokio::test]
async fn silent_master_does_not_hold_up_completion() {
    let plan = chain_plan();
    let cluster = LocalCluster::with_agents(2).with_plan(&plan);

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        silent_master_driver(&cluster).run_flow_until(plan, std::future::pending()),
    )
    .await
    .expect("run must finish while the status stream is still opening")
    .unwrap();

    assert!(summary.succeeded());
    assert_eq!(cluster.completion_order(), vec![0, 1, 2]);
    assert!(!summary.report.unwrap().connected);
    assert_eq!(summary.cleanup.deleted(), 3);
    assert_eq!(cluster.deleted().len(), 3);
    assert!(summary.status.driver.stop_time.is_some());
}

#[tokio::test]
async fn silent_master_does_not_hold_up_interrupt() {
    let plan = chain_plan();
    let cluster = LocalCluster::with_agents(2).with_plan(&plan);
    for task_group in 0..3 {
        cluster.set_behavior(task_group, AgentBehavior::Hang);
    }

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        silent_master_driver(&cluster)
            .run_flow_until(plan, tokio::time::sleep(Duration::from_millis(100))),
    )
    .await
    .expect("interrupted run must finish while the status stream is still opening")
    .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.cancelled(), 3);
    assert!(!summary.report.unwrap().connected);
    assert_eq!(summary.cleanup.invoked(), 3);
}
