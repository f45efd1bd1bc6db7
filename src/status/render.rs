//! Text rendering of a status snapshot.
//!
//! Step groups are printed layer by layer, roots first. Each group lists the
//! datasets it consumes from its parents (the output of the parent's last step)
//! and then its steps in execution order.

use std::io::{self, Write};

use chrono::{DateTime, Utc};

use super::{ExecutionState, FlowExecutionStatus, StepGroupStatus};
use crate::plan::topological_layers;

pub fn write_status_tree(out: &mut impl Write, status: &FlowExecutionStatus) -> io::Result<()> {
    writeln!(
        out,
        "job {} started {} stopped {}",
        status.id,
        format_time(status.driver.start_time),
        format_time(status.driver.stop_time)
    )?;

    let layers = topological_layers(status.step_groups.len(), |id| {
        status.step_groups[id].parent_ids.as_slice()
    });

    for (depth, layer) in layers.iter().enumerate() {
        writeln!(out, "layer {depth}")?;
        for &id in layer {
            write_step_group(out, status, &status.step_groups[id])?;
        }
    }

    let (done, total) = progress(status);
    writeln!(out, "{done}/{total} step groups finished")
}

fn write_step_group(
    out: &mut impl Write,
    status: &FlowExecutionStatus,
    group: &StepGroupStatus,
) -> io::Result<()> {
    write!(out, "  {} step group {} [{}]", marker(group.state), group.id, group.state)?;
    if let Some(task_group) = group.task_group_id {
        write!(out, " task group {task_group}")?;
    }
    if let Some(agent) = &group.agent {
        write!(out, " on {agent}")?;
    }
    writeln!(out)?;

    if let Some(error) = &group.error {
        writeln!(out, "      error: {error}")?;
    }

    for &parent in &group.parent_ids {
        let dataset = status
            .step_group(parent)
            .and_then(|parent| status.last_step(parent))
            .map(|step| format!("d{}", step.output_dataset_id))
            .unwrap_or_else(|| "d?".to_string());
        writeln!(out, "      <- {dataset} from step group {parent}")?;
    }

    for &step_id in &group.step_ids {
        match status.step(step_id) {
            Some(step) => {
                write!(
                    out,
                    "    {} {} {} [{}] -> d{}",
                    marker(step.state),
                    step.id,
                    step.name,
                    step.state,
                    step.output_dataset_id
                )?;
                if let Some(error) = &step.error {
                    write!(out, " ({error})")?;
                }
                writeln!(out)?;
            }
            None => writeln!(out, "    ? {step_id} <unknown step>")?,
        }
    }
    Ok(())
}

fn progress(status: &FlowExecutionStatus) -> (usize, usize) {
    let done = status
        .step_groups
        .iter()
        .filter(|group| group.state.is_terminal())
        .count();
    (done, status.step_groups.len())
}

fn marker(state: ExecutionState) -> &'static str {
    match state {
        ExecutionState::Pending => " ",
        ExecutionState::Waiting => ".",
        ExecutionState::Running => ">",
        ExecutionState::Completed => "+",
        ExecutionState::Failed => "x",
        ExecutionState::Cancelled => "-",
    }
}

fn format_time(timestamp: Option<i64>) -> String {
    timestamp
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}
