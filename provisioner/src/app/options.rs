//! Application run options

use std::time::Duration;

use crate::models::deployment::DeploymentDescriptor;
use crate::storage::layout::StorageLayout;

/// One unit of work for the runner
#[derive(Debug, Clone)]
pub enum DeploymentJob {
    /// Provision a new target
    Start(DeploymentDescriptor),

    /// Continue a persisted deployment by id
    Resume(String),
}

impl DeploymentJob {
    /// Short label for logs and the summary
    pub fn label(&self) -> String {
        match self {
            DeploymentJob::Start(descriptor) => descriptor.server.hostname.clone(),
            DeploymentJob::Resume(id) => id.clone(),
        }
    }
}

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Deployments to run
    pub jobs: Vec<DeploymentJob>,

    /// Deployments running at the same time (default 4)
    pub max_concurrent: usize,

    /// How long cancelled deployments get to persist their state
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            jobs: Vec::new(),
            max_concurrent: 4,
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
