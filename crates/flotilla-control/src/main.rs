//! Flotilla control binary.
//!
//! Runs a single control plane operation and prints the result as JSON.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use flotilla_control::{
    BlueprintId, ControlConfig, DeploymentId, ExecutionId, ExecutionRequest, ExecutionStatus,
    ListFilter, Orchestrator, Parameters,
};

#[derive(Parser)]
#[command(name = "flotilla-control")]
#[command(about = "Manage blueprints, deployments and workflow executions")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "FLOTILLA_CONTROL_CONFIG", default_value = "control.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Blueprint operations
    #[command(subcommand)]
    Blueprints(BlueprintCommand),

    /// Deployment operations
    #[command(subcommand)]
    Deployments(DeploymentCommand),

    /// Execution operations
    #[command(subcommand)]
    Executions(ExecutionCommand),
}

#[derive(Subcommand)]
enum BlueprintCommand {
    /// Compile and store a blueprint
    Publish {
        /// Blueprint identifier
        id: String,
        /// Location of the blueprint document
        location: String,
    },
    /// Delete a blueprint without deployments
    Delete { id: String },
    /// Show a blueprint
    Get { id: String },
    /// List blueprints
    List,
}

#[derive(Subcommand)]
enum DeploymentCommand {
    /// Create a deployment from a blueprint
    Create {
        /// Blueprint to deploy
        blueprint_id: String,
        /// Deployment identifier
        id: String,
        /// Deployment inputs as a JSON object
        #[arg(long, value_parser = parse_parameters, default_value = "{}")]
        inputs: Parameters,
    },
    /// Delete a deployment
    Delete {
        id: String,
        /// Delete even if node instances are still live
        #[arg(long)]
        ignore_live_nodes: bool,
    },
    /// Show a deployment
    Get { id: String },
    /// List deployments
    List {
        /// Only deployments of this blueprint
        #[arg(long)]
        blueprint: Option<String>,
    },
    /// Evaluate deployment outputs
    Outputs { id: String },
    /// List a deployment's nodes
    Nodes { id: String },
    /// List a deployment's node instances
    Instances { id: String },
}

#[derive(Subcommand)]
enum ExecutionCommand {
    /// Start a workflow
    Start(StartArgs),
    /// Request cancellation of an execution
    Cancel {
        id: String,
        /// Force cancellation
        #[arg(long)]
        force: bool,
    },
    /// Record a status reported by a worker
    UpdateStatus {
        id: String,
        status: ExecutionStatus,
        /// Error message to record
        #[arg(long, default_value = "")]
        error: String,
    },
    /// Show an execution
    Get { id: String },
    /// List executions
    List {
        /// Only executions of this deployment
        #[arg(long)]
        deployment: Option<String>,
    },
}

#[derive(Args)]
struct StartArgs {
    /// Deployment to run the workflow on
    deployment_id: String,
    /// Workflow name
    workflow_id: String,
    /// Workflow parameters as a JSON object
    #[arg(long, value_parser = parse_parameters, default_value = "{}")]
    parameters: Parameters,
    /// Accept parameters the workflow does not declare
    #[arg(long)]
    allow_custom_parameters: bool,
    /// Run even if other executions are running
    #[arg(long)]
    force: bool,
}

fn parse_parameters(raw: &str) -> Result<Parameters, String> {
    serde_json::from_str(raw).map_err(|e| format!("expected a JSON object: {e}"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_blueprint(orchestrator: &Orchestrator, command: BlueprintCommand) -> anyhow::Result<()> {
    let deployments = orchestrator.deployments();
    match command {
        BlueprintCommand::Publish { id, location } => {
            print_json(&deployments.publish_blueprint(BlueprintId::new(id), &location).await?)
        }
        BlueprintCommand::Delete { id } => {
            print_json(&deployments.delete_blueprint(&BlueprintId::new(id)).await?)
        }
        BlueprintCommand::Get { id } => {
            print_json(&deployments.get_blueprint(&BlueprintId::new(id)).await?)
        }
        BlueprintCommand::List => print_json(&deployments.list_blueprints(&ListFilter::new()).await?),
    }
}

async fn run_deployment(
    orchestrator: &Orchestrator,
    command: DeploymentCommand,
) -> anyhow::Result<()> {
    let deployments = orchestrator.deployments();
    match command {
        DeploymentCommand::Create {
            blueprint_id,
            id,
            inputs,
        } => print_json(
            &deployments
                .create_deployment(&BlueprintId::new(blueprint_id), DeploymentId::new(id), &inputs)
                .await?,
        ),
        DeploymentCommand::Delete {
            id,
            ignore_live_nodes,
        } => print_json(
            &deployments
                .delete_deployment(&DeploymentId::new(id), ignore_live_nodes)
                .await?,
        ),
        DeploymentCommand::Get { id } => {
            print_json(&deployments.get_deployment(&DeploymentId::new(id)).await?)
        }
        DeploymentCommand::List { blueprint } => {
            let mut filter = ListFilter::new();
            if let Some(blueprint) = blueprint {
                filter = filter.with_blueprint(BlueprintId::new(blueprint));
            }
            print_json(&deployments.list_deployments(&filter).await?)
        }
        DeploymentCommand::Outputs { id } => {
            print_json(&deployments.evaluate_outputs(&DeploymentId::new(id)).await?)
        }
        DeploymentCommand::Nodes { id } => {
            let filter = ListFilter::new().with_deployment(DeploymentId::new(id));
            print_json(&deployments.list_nodes(&filter).await?)
        }
        DeploymentCommand::Instances { id } => {
            let filter = ListFilter::new().with_deployment(DeploymentId::new(id));
            print_json(&deployments.list_node_instances(&filter).await?)
        }
    }
}

async fn run_execution(orchestrator: &Orchestrator, command: ExecutionCommand) -> anyhow::Result<()> {
    let executions = orchestrator.executions();
    match command {
        ExecutionCommand::Start(args) => {
            let request = ExecutionRequest::new(DeploymentId::new(args.deployment_id), args.workflow_id)
                .with_parameters(args.parameters)
                .allow_custom_parameters(args.allow_custom_parameters)
                .force(args.force);
            print_json(&executions.start_execution(request).await?)
        }
        ExecutionCommand::Cancel { id, force } => {
            print_json(&executions.cancel_execution(&ExecutionId::new(id), force).await?)
        }
        ExecutionCommand::UpdateStatus { id, status, error } => print_json(
            &executions
                .update_execution_status(&ExecutionId::new(id), status, &error)
                .await?,
        ),
        ExecutionCommand::Get { id } => {
            print_json(&executions.get_execution(&ExecutionId::new(id)).await?)
        }
        ExecutionCommand::List { deployment } => {
            let mut filter = ListFilter::new();
            if let Some(deployment) = deployment {
                filter = filter.with_deployment(DeploymentId::new(deployment));
            }
            print_json(&executions.list_executions(&filter).await?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("flotilla_control=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = ControlConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    debug!(store = ?config.store.backend, broker = %config.broker.url, "configuration loaded");

    let orchestrator = Orchestrator::from_config(&config)
        .await
        .context("failed to start control plane")?;

    match cli.command {
        Commands::Blueprints(command) => run_blueprint(&orchestrator, command).await,
        Commands::Deployments(command) => run_deployment(&orchestrator, command).await,
        Commands::Executions(command) => run_execution(&orchestrator, command).await,
    }
}
