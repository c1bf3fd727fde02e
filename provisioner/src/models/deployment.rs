//! Deployment models

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ProvisionError;

/// Where the session finds its authentication material.
///
/// Only a reference is ever stored; the secret itself is resolved at connect
/// time and never persisted or reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Private key file passed to the ssh client
    IdentityFile { path: PathBuf },

    /// Password read from the named environment variable
    PasswordEnv { var: String },

    /// Whatever the local ssh agent / default keys provide
    Agent,
}

impl Default for CredentialRef {
    fn default() -> Self {
        CredentialRef::Agent
    }
}

/// Target host description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub hostname: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub credential: CredentialRef,

    /// Public domain the application is served on
    pub domain: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl ServerDescriptor {
    /// Reject values that cannot be placed safely in remote commands or ssh
    /// arguments.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if !is_hostname(&self.domain) {
            return Err(ProvisionError::ValidationError(format!(
                "Invalid domain: {:?}",
                self.domain
            )));
        }
        if !is_hostname(&self.hostname) && self.hostname.parse::<std::net::IpAddr>().is_err() {
            return Err(ProvisionError::ValidationError(format!(
                "Invalid hostname: {:?}",
                self.hostname
            )));
        }
        let username_ok = !self.username.is_empty()
            && !self.username.starts_with('-')
            && self
                .username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !username_ok {
            return Err(ProvisionError::ValidationError(format!(
                "Invalid username: {:?}",
                self.username
            )));
        }
        Ok(())
    }
}

/// DNS name: dot-separated labels of letters, digits and inner hyphens
fn is_hostname(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Deployment mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Standard,
    Containerized,
}

/// Input describing one provisioning run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    #[serde(flatten)]
    pub server: ServerDescriptor,

    #[serde(default)]
    pub mode: DeploymentMode,

    #[serde(default = "default_true")]
    pub auto_recovery: bool,
}

impl DeploymentDescriptor {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        self.server.validate()
    }
}

fn default_true() -> bool {
    true
}

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Success,
    Failed,
    Paused,
    Cancelled,
}

impl DeploymentStatus {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Transitions only move forward, except `failed -> running` and
    /// `paused -> running` which resume a run.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Failed, Running)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Paused => "paused",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-pipeline verification results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFlags {
    pub services_healthy: bool,
    pub domain_accessible: bool,
    pub critical_checks_passed: bool,
}

impl VerificationFlags {
    /// Record the three check results.
    ///
    /// `critical_checks_passed` is forced false unless both other flags hold.
    pub fn record(&mut self, services_healthy: bool, domain_accessible: bool, endpoints_ok: bool) {
        self.services_healthy = services_healthy;
        self.domain_accessible = domain_accessible;
        self.critical_checks_passed = services_healthy && domain_accessible && endpoints_ok;
    }
}

/// References to what the escalation reporter filed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub issue_id: Option<String>,
    pub pr_id: Option<String>,
}

/// One provisioning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub status: DeploymentStatus,

    /// Index of the next step to run
    pub current_step: usize,

    /// Name of the step at `current_step`, used to relocate it on resume
    #[serde(default)]
    pub current_step_name: Option<String>,

    pub total_steps: usize,
    pub server: ServerDescriptor,

    #[serde(default)]
    pub mode: DeploymentMode,

    #[serde(default = "default_true")]
    pub auto_recovery: bool,

    #[serde(default)]
    pub error_count: u32,

    #[serde(default)]
    pub warnings: Vec<String>,

    #[serde(default)]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub verification: VerificationFlags,

    #[serde(default)]
    pub escalation: Option<EscalationRecord>,
}

impl Deployment {
    /// Create a pending deployment for a descriptor
    pub fn new(descriptor: &DeploymentDescriptor, total_steps: usize, now: DateTime<Utc>) -> Self {
        Self {
            id: deployment_id(&descriptor.server.hostname, now),
            status: DeploymentStatus::Pending,
            current_step: 0,
            current_step_name: None,
            total_steps,
            server: descriptor.server.clone(),
            mode: descriptor.mode,
            auto_recovery: descriptor.auto_recovery,
            error_count: 0,
            warnings: Vec::new(),
            last_error: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            verification: VerificationFlags::default(),
            escalation: None,
        }
    }

    /// Move to a new status, enforcing the allowed transitions
    pub fn transition(&mut self, next: DeploymentStatus) -> Result<(), ProvisionError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(ProvisionError::StateError(format!(
                "Invalid status transition: {} -> {}",
                self.status, next
            )));
        }

        match next {
            DeploymentStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                self.ended_at = None;
            }
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::Cancelled => {
                self.ended_at = Some(Utc::now());
            }
            DeploymentStatus::Pending | DeploymentStatus::Paused => {}
        }

        self.status = next;
        Ok(())
    }

    /// Point the deployment at step `index`
    pub fn set_current_step(&mut self, index: usize, name: Option<&str>) -> Result<(), ProvisionError> {
        if index > self.total_steps {
            return Err(ProvisionError::StateError(format!(
                "Step index {} out of range (total {})",
                index, self.total_steps
            )));
        }
        self.current_step = index;
        self.current_step_name = name.map(str::to_string);
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn is_complete(&self) -> bool {
        self.current_step >= self.total_steps
    }
}

/// Build a deployment id from the target host and creation time
pub fn deployment_id(hostname: &str, created_at: DateTime<Utc>) -> String {
    let host: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{}-{}", host.trim_matches('-'), created_at.format("%Y%m%d%H%M%S"))
}
