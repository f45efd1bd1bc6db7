//! # Flow Driver CLI
//!
//! Runs an execution plan against a cluster master, or validates a plan and
//! configuration without dispatching anything.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};

use flow_driver::logging::init_structured_logging;
use flow_driver::status::write_status_tree;
use flow_driver::{
    Collaborators, ConfigManager, DriverOption, ExecutionPlan, FlowDriver, LocalCluster,
    RunSummary,
};

#[derive(Parser)]
#[command(name = "flow-driver")]
#[command(about = "Drive a distributed dataflow job")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "FLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Master address, overrides configuration
    #[arg(short, long)]
    master: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan until it finishes or Ctrl-C
    Run {
        /// Execution plan (JSON)
        plan: PathBuf,

        /// Total bid budget, overrides configuration
        #[arg(long)]
        flow_bid: Option<f64>,

        /// Run against an in-process cluster instead of the master
        #[arg(long)]
        local: bool,

        /// Agents in the in-process cluster
        #[arg(long, default_value_t = 2)]
        local_agents: usize,

        #[arg(long, value_enum, default_value_t = SummaryFormat::Text)]
        summary: SummaryFormat,
    },

    /// Validate configuration and plan, then print the plan layers
    Validate {
        plan: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SummaryFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    init_structured_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("❌ {e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut option = ConfigManager::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(master) = cli.master {
        option.master = master;
    }

    match cli.command {
        Commands::Validate { plan } => validate(&option, &plan),
        Commands::Run {
            plan,
            flow_bid,
            local,
            local_agents,
            summary,
        } => {
            if let Some(flow_bid) = flow_bid {
                option.flow_bid = flow_bid;
            }
            option.validate().context("validating configuration")?;
            let plan = ExecutionPlan::load(&plan)
                .with_context(|| format!("loading plan {}", plan.display()))?;

            let collaborators = if local {
                info!(agents = local_agents, "🧪 Running against an in-process cluster");
                Collaborators::local(&LocalCluster::with_agents(local_agents).with_plan(&plan))
            } else {
                Collaborators::tcp(&option)
            };

            let driver = FlowDriver::new(option, collaborators);
            let result = driver.run_flow(plan).await?;
            print_summary(&result, summary)?;

            if !result.succeeded() {
                anyhow::bail!(
                    "flow did not complete: {} failed, {} cancelled",
                    result.failed(),
                    result.cancelled()
                );
            }
            Ok(())
        }
    }
}

fn validate(option: &DriverOption, path: &Path) -> anyhow::Result<()> {
    option.validate().context("validating configuration")?;
    let plan = ExecutionPlan::load(path)
        .with_context(|| format!("loading plan {}", path.display()))?;

    println!("✅ Configuration valid (master {})", option.master);
    println!(
        "✅ Plan '{}' valid: {} steps, {} step groups, {} task groups",
        plan.name,
        plan.steps.len(),
        plan.step_groups.len(),
        plan.task_groups.len()
    );
    for (depth, layer) in plan.layers().iter().enumerate() {
        println!("   layer {depth}: step groups {layer:?}");
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, format: SummaryFormat) -> anyhow::Result<()> {
    match format {
        SummaryFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        SummaryFormat::Text => {
            write_status_tree(&mut std::io::stdout(), &summary.status)?;
            println!(
                "job {}: {} completed, {} failed, {} cancelled, {} outputs deleted",
                summary.job_id,
                summary.completed(),
                summary.failed(),
                summary.cancelled(),
                summary.cleanup.deleted()
            );
        }
    }
    Ok(())
}
