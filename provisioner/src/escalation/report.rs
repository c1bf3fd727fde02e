//! Failure report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::patterns::Classification;
use crate::journal::LogEntry;
use crate::models::deployment::{Deployment, DeploymentMode, ServerDescriptor};

/// Target host as it appears in reports. Carries no credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedServer {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub domain: String,
}

impl From<&ServerDescriptor> for ReportedServer {
    fn from(server: &ServerDescriptor) -> Self {
        Self {
            hostname: server.hostname.clone(),
            port: server.port,
            username: server.username.clone(),
            domain: server.domain.clone(),
        }
    }
}

/// Everything a human needs to pick up a failed deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub deployment_id: String,
    pub failed_step: String,
    pub error: String,

    #[serde(default)]
    pub classification: Option<Classification>,

    pub server: ReportedServer,
    pub mode: DeploymentMode,

    /// Attempts made on the failed step
    pub attempts: u32,

    /// Failed attempts across the whole run
    pub error_count: u32,

    pub steps_completed: usize,
    pub total_steps: usize,
    pub warnings: Vec<String>,
    pub log_tail: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(
        deployment: &Deployment,
        failed_step: &str,
        error: &str,
        classification: Option<Classification>,
        attempts: u32,
        log_tail: Vec<LogEntry>,
    ) -> Self {
        Self {
            deployment_id: deployment.id.clone(),
            failed_step: failed_step.to_string(),
            error: error.to_string(),
            classification,
            server: ReportedServer::from(&deployment.server),
            mode: deployment.mode,
            attempts,
            error_count: deployment.error_count,
            steps_completed: deployment.current_step,
            total_steps: deployment.total_steps,
            warnings: deployment.warnings.clone(),
            log_tail,
            created_at: Utc::now(),
        }
    }

    /// Remediation branch name for this deployment
    pub fn fix_branch(&self) -> String {
        format!("fix/deploy-{}", self.deployment_id)
    }

    pub fn title(&self) -> String {
        format!(
            "Deployment {} failed at {} on {}",
            self.deployment_id, self.failed_step, self.server.hostname
        )
    }

    /// Markdown body for trackers that render it
    pub fn to_markdown(&self) -> String {
        let mut body = String::new();
        body.push_str(&format!("## {}\n\n", self.title()));
        body.push_str(&format!("- **Deployment**: `{}`\n", self.deployment_id));
        body.push_str(&format!("- **Failed step**: `{}`\n", self.failed_step));
        body.push_str(&format!(
            "- **Server**: `{}@{}:{}` ({})\n",
            self.server.username, self.server.hostname, self.server.port, self.server.domain
        ));
        body.push_str(&format!("- **Mode**: {:?}\n", self.mode));
        body.push_str(&format!(
            "- **Progress**: {}/{} steps, {} attempts on the failed step, {} errors total\n",
            self.steps_completed, self.total_steps, self.attempts, self.error_count
        ));
        if let Some(classification) = &self.classification {
            body.push_str(&format!("- **Classification**: {}\n", classification));
        }

        body.push_str("\n### Error\n\n```\n");
        body.push_str(self.error.trim_end());
        body.push_str("\n```\n");

        if !self.warnings.is_empty() {
            body.push_str("\n### Warnings\n\n");
            for warning in &self.warnings {
                body.push_str(&format!("- {}\n", warning));
            }
        }

        if !self.log_tail.is_empty() {
            body.push_str(&format!("\n### Last {} log entries\n\n```\n", self.log_tail.len()));
            for entry in &self.log_tail {
                body.push_str(&format!("{}\n", entry));
            }
            body.push_str("```\n");
        }
        body
    }
}
