//! Settings file management
//!
//! Every field has a documented default; a settings file only needs to name
//! what it overrides. Settings are loaded once at startup and passed down as
//! plain structs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Write JSON instead of text to stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Application being deployed
    #[serde(default)]
    pub app: AppSettings,

    /// Remote session configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// Step pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Post-pipeline verification configuration
    #[serde(default)]
    pub verification: VerificationSettings,

    /// Escalation configuration
    #[serde(default)]
    pub escalation: EscalationSettings,
}

/// What gets deployed and where
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Git repository holding the application
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Branch to deploy (default main)
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Checkout location on the host (default /opt/app)
    #[serde(default = "default_app_dir")]
    pub app_dir: String,

    /// Port the backend listens on behind nginx (default 3000)
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    /// Local environment file uploaded as `<app_dir>/.env`
    #[serde(default)]
    pub env_file: Option<PathBuf>,

    /// Contact address for certificate registration
    #[serde(default)]
    pub admin_email: Option<String>,
}

fn default_repository() -> String {
    "https://github.com/example/app.git".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_app_dir() -> String {
    "/opt/app".to_string()
}

fn default_backend_port() -> u16 {
    3000
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            branch: default_branch(),
            app_dir: default_app_dir(),
            backend_port: default_backend_port(),
            env_file: None,
            admin_email: None,
        }
    }
}

/// Remote session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Bound on establishing the connection (default 15s)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bound on a single remote command (default 600s)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// How long to keep reading output after the exit status arrives (default 5s)
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Directory holding the multiplexing control sockets
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,

    /// How long an idle control master survives (default 600s)
    #[serde(default = "default_control_persist_secs")]
    pub control_persist_secs: u64,

    /// Refuse unknown host keys instead of accepting new ones
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_control_dir() -> PathBuf {
    std::env::temp_dir().join("provisioner-ssh")
}

fn default_control_persist_secs() -> u64 {
    600
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            control_dir: default_control_dir(),
            control_persist_secs: default_control_persist_secs(),
            strict_host_key_checking: false,
        }
    }
}

/// Step pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Retries allowed after the first failed attempt of a step (default 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between a failed attempt and the next one, in milliseconds (default 5000)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

impl PipelineSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// An application endpoint checked after the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCheck {
    /// Path on the target domain, e.g. `/api/health`
    pub path: String,

    /// Expected HTTP status (default 200)
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Optional substring the body must contain
    #[serde(default)]
    pub contains: Option<String>,
}

fn default_expected_status() -> u16 {
    200
}

/// Post-pipeline verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSettings {
    /// Services that must report active
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    /// Scheme used for the domain checks (default https)
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Also resolve the domain through DNS and request it from this machine
    #[serde(default)]
    pub external_check: bool,

    /// Endpoints that must answer as expected
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointCheck>,

    /// Per-request timeout for the domain and endpoint checks (default 15s)
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
}

fn default_services() -> Vec<String> {
    vec!["nginx".to_string(), "postgresql".to_string(), "app-backend".to_string()]
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_endpoints() -> Vec<EndpointCheck> {
    vec![
        EndpointCheck {
            path: "/".to_string(),
            expected_status: 200,
            contains: None,
        },
        EndpointCheck {
            path: "/api/health".to_string(),
            expected_status: 200,
            contains: None,
        },
    ]
}

fn default_check_timeout_secs() -> u64 {
    15
}

impl VerificationSettings {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            services: default_services(),
            scheme: default_scheme(),
            external_check: false,
            endpoints: default_endpoints(),
            check_timeout_secs: default_check_timeout_secs(),
        }
    }
}

/// Escalation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSettings {
    /// File reports at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log entries embedded in a report (default 50)
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Steps whose failure also opens a remediation change-request
    #[serde(default = "default_critical_steps")]
    pub critical_steps: Vec<String>,

    /// Write reports to the reports directory instead of only logging them
    #[serde(default = "default_true")]
    pub write_reports: bool,
}

fn default_true() -> bool {
    true
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_critical_steps() -> Vec<String> {
    ["connect", "configure_backend", "setup_nginx", "final_verification"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_tail_lines: default_log_tail_lines(),
            critical_steps: default_critical_steps(),
            write_reports: true,
        }
    }
}
