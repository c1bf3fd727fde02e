//! Result of a pipeline run

use serde::{Deserialize, Serialize};

use crate::classify::patterns::Classification;
use crate::models::deployment::{Deployment, DeploymentStatus, EscalationRecord, VerificationFlags};

/// How a run ended, as reported to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,

    /// Every step succeeded but verification did not
    PartialSuccess,

    Failed,
    Cancelled,
    Paused,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::PartialSuccess => "partial_success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Paused => "paused",
        }
    }

    /// Process exit code for the binary
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failed => 1,
            RunOutcome::PartialSuccess => 2,
            RunOutcome::Cancelled => 3,
            RunOutcome::Paused => 4,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-facing summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub deployment_id: String,
    pub outcome: RunOutcome,
    pub status: DeploymentStatus,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub error_count: u32,
    pub verification: VerificationFlags,

    #[serde(default)]
    pub failed_step: Option<String>,

    #[serde(default)]
    pub classification: Option<Classification>,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub escalation: Option<EscalationRecord>,
}

impl RunSummary {
    pub fn new(deployment: &Deployment, outcome: RunOutcome) -> Self {
        Self {
            deployment_id: deployment.id.clone(),
            outcome,
            status: deployment.status,
            steps_completed: deployment.current_step.min(deployment.total_steps),
            total_steps: deployment.total_steps,
            error_count: deployment.error_count,
            verification: deployment.verification,
            failed_step: None,
            classification: None,
            last_error: deployment.last_error.clone(),
            escalation: deployment.escalation.clone(),
        }
    }

    pub fn with_failure(mut self, step: &str, classification: Option<Classification>) -> Self {
        self.failed_step = Some(step.to_string());
        self.classification = classification;
        self
    }
}
