//! Flotilla control plane
//!
//! This crate manages the lifecycle of blueprints, deployments and workflow
//! executions. Long-running work is delegated to remote workers through a task
//! broker; this crate records what was asked for, dispatches it, and enforces
//! the rules about what may run when.
//!
//! # Architecture
//!
//! - **Deployments**: [`DeploymentManager`] publishes blueprints, materialises
//!   them into deployments with their nodes and node instances, and deletes
//!   them once nothing is running
//! - **Environments**: [`EnvironmentOrchestrator`] creates and deletes the
//!   per-deployment runtime environment through system workflows
//! - **Executions**: [`ExecutionManager`] starts, cancels and tracks workflow
//!   executions against the [`ExecutionStatus`] state machine
//! - **Storage**: [`ResourceStore`] backends, which may lag on list queries;
//!   [`consistency::wait_for_count`] bridges the gap
//!
//! # Execution states
//!
//! Executions start `PENDING` and end in one of `TERMINATED`, `FAILED` or
//! `CANCELLED`. The permitted transitions are listed in [`state`].
//!
//! # Example
//!
//! ```ignore
//! use flotilla_control::{ControlConfig, ExecutionRequest, Orchestrator};
//!
//! let orchestrator = Orchestrator::from_config(&ControlConfig::load()?).await?;
//!
//! orchestrator
//!     .deployments()
//!     .publish_blueprint("web".into(), "blueprints/web.json")
//!     .await?;
//! orchestrator
//!     .deployments()
//!     .create_deployment(&"web".into(), "web-prod".into(), &Default::default())
//!     .await?;
//!
//! let execution = orchestrator
//!     .executions()
//!     .start_execution(ExecutionRequest::new("web-prod".into(), "install"))
//!     .await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod consistency;
pub mod deployment;
pub mod environment;
pub mod error;
pub mod execution;
pub mod orchestrator;
pub mod parameters;
pub mod plan;
pub mod state;
pub mod store;
pub mod tasks;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::DeploymentManager;
pub use environment::EnvironmentOrchestrator;
pub use error::{ControlError, ControlResult, ErrorKind};
pub use execution::{ExecutionManager, ExecutionRequest};
pub use orchestrator::Orchestrator;
pub use plan::{DeploymentPlan, DocumentPlanCompiler, PlanCompiler, PlanDocument};
pub use state::ExecutionStatus;
pub use store::{ListFilter, MemoryStore, PostgresStore, ResourceStore};
pub use tasks::{BrokerClient, MockDispatcher, TaskDispatcher};
pub use types::{
    Blueprint, BlueprintId, Deployment, DeploymentId, Execution, ExecutionId, Node, NodeInstance,
    Parameters,
};
