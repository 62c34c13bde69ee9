//! sx - run file-based workflow tasks.
//!
//! Usage:
//!   sx run <workflow.yaml>       Run every task in the file
//!   sx validate <workflow.yaml>  Validate the file without running anything
//!   sx show-audit <data-file>    Print the provenance record of a data file

use clap::{Parser, Subcommand};
use sciexec::{
    AuditInfo, EventBus, InformationPacket, WorkflowBuilder, YamlLoader, FATAL_EXIT_CODE,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// sx - run file-based workflow tasks
#[derive(Parser)]
#[command(name = "sx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task in a workflow file
    Run {
        /// Path to the workflow YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Validate a workflow file without running it
    Validate {
        /// Path to the workflow YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Print the provenance record of a data file
    ShowAudit {
        /// Path to the data file (not the .audit.json sidecar)
        #[arg(value_name = "PATH")]
        path: String,

        /// Print the record as JSON instead of a tree
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => run_workflow(file).await,
        Commands::Validate { file } => validate_workflow(file),
        Commands::ShowAudit { path, json } => show_audit(path, json),
    }
}

/// Run a workflow, exiting with the fatal status if any task fails.
async fn run_workflow(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading workflow from: {}", file.display());

    let events = Arc::new(EventBus::logging());
    let workflow = match YamlLoader::load_workflow(&file)
        .and_then(|config| WorkflowBuilder::new(events).build(&config))
    {
        Ok(workflow) => workflow,
        Err(e) => {
            error!("Could not build workflow: {}", e);
            std::process::exit(FATAL_EXIT_CODE);
        }
    };

    info!("Running {} task(s)", workflow.len());
    let report = workflow.run_or_exit().await;
    info!(
        "Workflow finished in {:?}: {} executed, {} skipped",
        report.duration,
        report.executed_count(),
        report.skipped_count()
    );
    Ok(())
}

/// Validate a workflow file without running it.
fn validate_workflow(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating workflow: {}", file.display());

    match YamlLoader::load_workflow(&file) {
        Ok(config) => {
            let plan = config.plan()?;
            info!("Workflow is valid, {} task(s):", config.tasks.len());
            for idx in plan.order {
                let task = &config.tasks[idx];
                info!(
                    "  - {} ({})",
                    task.name,
                    task.effective_mode(&config.defaults)
                );
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print the provenance sidecar of a data file.
fn show_audit(path: String, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let packet = InformationPacket::from_existing(path.as_str())?;
    let Some(audit) = packet.audit_info() else {
        return Err(format!("no provenance record found at {}", packet.audit_path()).into());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(audit)?);
    } else {
        print_audit(&path, audit, 0);
    }
    Ok(())
}

fn print_audit(path: &str, audit: &AuditInfo, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}{}", indent, path);
    if audit.is_empty() {
        println!("{}  (source file)", indent);
        return;
    }
    if let Some(name) = &audit.task_name {
        println!("{}  task:     {}", indent, name);
    }
    println!("{}  command:  {}", indent, audit.command);
    for (key, value) in &audit.params {
        println!("{}  param:    {} = {}", indent, key, value);
    }
    println!("{}  duration: {} ms", indent, audit.execution_time_millis);
    for (upstream_path, upstream) in &audit.upstream {
        print_audit(upstream_path, upstream, depth + 1);
    }
}
