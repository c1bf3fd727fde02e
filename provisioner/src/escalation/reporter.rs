//! Failure escalation
//!
//! Filing is best-effort. Tracker errors are logged against the deployment
//! and never change the status the run already reached.

use std::sync::Arc;

use crate::escalation::report::FailureReport;
use crate::escalation::tracker::Tracker;
use crate::journal::Journal;
use crate::models::deployment::{DeploymentStatus, EscalationRecord};
use crate::storage::settings::EscalationSettings;

/// Hands failure reports to the tracker
#[derive(Clone)]
pub struct EscalationReporter {
    tracker: Arc<dyn Tracker>,
    settings: EscalationSettings,
}

impl EscalationReporter {
    pub fn new(tracker: Arc<dyn Tracker>, settings: EscalationSettings) -> Self {
        Self { tracker, settings }
    }

    pub fn settings(&self) -> &EscalationSettings {
        &self.settings
    }

    /// Whether a failure of `step` also warrants a remediation change
    pub fn is_critical(&self, step: &str) -> bool {
        self.settings.critical_steps.iter().any(|s| s == step)
    }

    /// File an issue, plus a remediation request for critical steps
    pub async fn escalate(&self, report: &FailureReport, journal: &Journal) -> EscalationRecord {
        let step = Some(report.failed_step.as_str());
        let mut record = EscalationRecord::default();

        if !self.settings.enabled {
            journal.info(step, "Escalation disabled, no report filed").await;
            return record;
        }

        journal
            .warn(step, format!("Escalating failure of step {}", report.failed_step))
            .await;

        match self.tracker.create_failure_issue(report).await {
            Ok(Some(id)) => {
                journal.info(step, format!("Filed failure issue {}", id)).await;
                record.issue_id = Some(id);
            }
            Ok(None) => journal.info(step, "Tracker did not create an issue").await,
            Err(e) => journal.error(step, format!("Failed to file issue: {}", e)).await,
        }

        if self.is_critical(&report.failed_step) {
            let branch = report.fix_branch();
            match self.tracker.create_failure_pr(report, &branch).await {
                Ok(Some(id)) => {
                    journal
                        .info(step, format!("Requested remediation {} on {}", id, branch))
                        .await;
                    record.pr_id = Some(id);
                }
                Ok(None) => journal.info(step, "Tracker did not create a remediation request").await,
                Err(e) => {
                    journal
                        .error(step, format!("Failed to request remediation: {}", e))
                        .await
                }
            }
        }

        record
    }

    /// Publish a terminal status; failures are only logged
    pub async fn post_status(&self, status: DeploymentStatus, url: Option<&str>, journal: &Journal) {
        if let Err(e) = self.tracker.post_status(status, url).await {
            journal
                .warn(None, format!("Failed to post status {}: {}", status, e))
                .await;
        }
    }
}
