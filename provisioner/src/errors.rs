//! Error types for the provisioner

use thiserror::Error;

/// Main error type for the provisioner
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Escalation error: {0}")]
    EscalationError(String),

    #[error("Deployment cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// Errors raised while establishing or holding the remote session.
    ///
    /// These are fatal to a run and never retried by the pipeline.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            ProvisionError::ConnectionError(_) | ProvisionError::AuthError(_)
        )
    }
}

impl From<anyhow::Error> for ProvisionError {
    fn from(err: anyhow::Error) -> Self {
        ProvisionError::Internal(err.to_string())
    }
}
