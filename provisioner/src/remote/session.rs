//! Remote session abstraction

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ProvisionError;
use crate::models::deployment::ServerDescriptor;
use crate::remote::stream::OutputSink;

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Text to inspect when the command failed: stderr, or stdout when the
    /// command wrote nothing to stderr.
    pub fn failure_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// One authenticated connection to a target host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command, streaming each output line to `sink` while it runs
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        sink: Arc<dyn OutputSink>,
    ) -> Result<CommandOutput, ProvisionError>;

    /// Copy a local file to `remote_path` on the host
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), ProvisionError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self) -> Result<(), ProvisionError>;
}

/// Opens sessions for the controller
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Arc<dyn RemoteSession>, ProvisionError>;
}
