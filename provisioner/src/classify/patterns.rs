//! Known failure signatures

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::ProvisionError;
use crate::recovery::actions::RecoveryAction;

/// How bad a classified failure is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One entry of the pattern table
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub regex: Regex,
    pub severity: Severity,
    pub action: RecoveryAction,
    pub description: String,

    /// Upper bound on attempts for a step failing with this pattern
    pub max_retry_hint: u32,
}

impl ErrorPattern {
    /// Compile a case-insensitive, multi-line pattern
    pub fn new(
        pattern: &str,
        severity: Severity,
        action: RecoveryAction,
        description: &str,
        max_retry_hint: u32,
    ) -> Result<Self, ProvisionError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .map_err(|e| ProvisionError::ConfigError(format!("Invalid pattern {:?}: {}", pattern, e)))?;

        Ok(Self {
            regex,
            severity,
            action,
            description: description.to_string(),
            max_retry_hint,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn summary(&self) -> Classification {
        Classification {
            description: self.description.clone(),
            severity: self.severity,
            action: self.action,
        }
    }
}

/// Serializable view of a matched pattern, used in reports and logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub description: String,
    pub severity: Severity,
    pub action: RecoveryAction,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:?}, recovery: {})",
            self.description, self.severity, self.action
        )
    }
}

/// Source table: (regex, severity, action, description, max retry hint)
const DEFAULT_TABLE: &[(&str, Severity, RecoveryAction, &str, u32)] = &[
    (
        r"address already in use|bind\(\) to \S+ failed|port \d+ is already (in use|allocated)",
        Severity::High,
        RecoveryAction::KillConflictingProcesses,
        "Port already in use",
        3,
    ),
    (
        r"could not get lock|unable to acquire the dpkg frontend lock|dpkg was interrupted",
        Severity::Medium,
        RecoveryAction::ReleasePackageLocks,
        "Package manager lock held",
        3,
    ),
    (
        r"unmet dependencies|held broken packages|dpkg: error processing",
        Severity::High,
        RecoveryAction::RepairBrokenPackages,
        "Broken package state",
        2,
    ),
    (
        r"no space left on device",
        Severity::Critical,
        RecoveryAction::FreeDiskSpace,
        "Disk full",
        2,
    ),
    (
        r"could not connect to server|connection refused.*5432|password authentication failed for user|database \S+ does not exist",
        Severity::High,
        RecoveryAction::RestartDatabase,
        "Database unreachable",
        3,
    ),
    (
        r"nginx: \[emerg\]|nginx: configuration file \S+ test failed",
        Severity::High,
        RecoveryAction::ResetNginxConfig,
        "Invalid nginx configuration",
        2,
    ),
    (
        r"npm err!|err_pnpm_|cannot find module|module not found",
        Severity::Medium,
        RecoveryAction::ReinstallDependencies,
        "Missing application dependencies",
        2,
    ),
    (
        r"cannot connect to the docker daemon|is the docker daemon running",
        Severity::High,
        RecoveryAction::RestartDocker,
        "Docker daemon unavailable",
        2,
    ),
    (
        r"permission denied|eacces",
        Severity::Medium,
        RecoveryAction::FixPermissions,
        "Permission denied",
        2,
    ),
    (
        r"temporary failure in name resolution|could not resolve host|network is unreachable",
        Severity::Medium,
        RecoveryAction::RestoreNetwork,
        "Network or DNS failure",
        3,
    ),
    (
        r"javascript heap out of memory|cannot allocate memory|out of memory|killed process \d+",
        Severity::High,
        RecoveryAction::AddSwap,
        "Out of memory",
        2,
    ),
    (
        r"start request repeated too quickly|main process exited, code=exited|failed to start \S+\.service",
        Severity::High,
        RecoveryAction::RestartBackend,
        "Service failed to start",
        2,
    ),
];

/// Build the fixed pattern table
pub fn default_patterns() -> Result<Vec<ErrorPattern>, ProvisionError> {
    DEFAULT_TABLE
        .iter()
        .map(|(pattern, severity, action, description, hint)| {
            ErrorPattern::new(pattern, *severity, *action, description, *hint)
        })
        .collect()
}
