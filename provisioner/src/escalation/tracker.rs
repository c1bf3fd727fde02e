//! Issue tracker collaborators

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::ProvisionError;
use crate::escalation::report::FailureReport;
use crate::filesys::dir::Dir;
use crate::models::deployment::DeploymentStatus;

/// Where failure reports are filed
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Open an issue; `None` when the tracker did not create one
    async fn create_failure_issue(&self, report: &FailureReport) -> Result<Option<String>, ProvisionError>;

    /// Request a remediation change on `branch`
    async fn create_failure_pr(
        &self,
        report: &FailureReport,
        branch: &str,
    ) -> Result<Option<String>, ProvisionError>;

    /// Publish the final status of a deployment
    async fn post_status(&self, status: DeploymentStatus, url: Option<&str>) -> Result<(), ProvisionError>;
}

/// Logs what would have been filed and creates nothing
#[derive(Debug, Clone, Default)]
pub struct LogOnlyTracker;

#[async_trait]
impl Tracker for LogOnlyTracker {
    async fn create_failure_issue(&self, report: &FailureReport) -> Result<Option<String>, ProvisionError> {
        warn!("No tracker configured, not filing issue: {}", report.title());
        Ok(None)
    }

    async fn create_failure_pr(
        &self,
        report: &FailureReport,
        branch: &str,
    ) -> Result<Option<String>, ProvisionError> {
        warn!(
            "No tracker configured, not requesting remediation on {} for {}",
            branch, report.deployment_id
        );
        Ok(None)
    }

    async fn post_status(&self, status: DeploymentStatus, url: Option<&str>) -> Result<(), ProvisionError> {
        info!("Deployment status: {} ({})", status, url.unwrap_or("-"));
        Ok(())
    }
}

/// Writes each report as a JSON and a markdown document in a directory.
///
/// The returned id is the document's file stem.
#[derive(Debug, Clone)]
pub struct FileTracker {
    dir: Dir,
}

impl FileTracker {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    async fn write(&self, stem: &str, report: &FailureReport, preamble: &str) -> Result<String, ProvisionError> {
        self.dir.create().await?;
        self.dir.file(&format!("{}.json", stem)).write_json_atomic(report).await?;

        let markdown = format!("{}{}", preamble, report.to_markdown());
        self.dir
            .file(&format!("{}.md", stem))
            .write_atomic(markdown.as_bytes())
            .await?;

        info!("Wrote failure report {}", self.dir.path().join(stem).display());
        Ok(stem.to_string())
    }
}

#[async_trait]
impl Tracker for FileTracker {
    async fn create_failure_issue(&self, report: &FailureReport) -> Result<Option<String>, ProvisionError> {
        let stem = format!("issue-{}", report.deployment_id);
        self.write(&stem, report, "").await.map(Some)
    }

    async fn create_failure_pr(
        &self,
        report: &FailureReport,
        branch: &str,
    ) -> Result<Option<String>, ProvisionError> {
        let stem = format!("pr-{}", report.deployment_id);
        let preamble = format!("Remediation branch: `{}`\n\n", branch);
        self.write(&stem, report, &preamble).await.map(Some)
    }

    async fn post_status(&self, status: DeploymentStatus, url: Option<&str>) -> Result<(), ProvisionError> {
        info!("Deployment status: {} ({})", status, url.unwrap_or("-"));
        Ok(())
    }
}
