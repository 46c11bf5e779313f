//! Blueprint and deployment lifecycle management.
//!
//! This module turns published blueprints into deployments (nodes, node
//! instances and a remote environment) and tears them down again once nothing
//! is running on them.

mod manager;

pub use manager::DeploymentManager;
