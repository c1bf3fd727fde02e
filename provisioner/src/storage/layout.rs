//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::ProvisionError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the engine's working directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Settings file
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// One JSON document per deployment id
    pub fn state_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployments"))
    }

    /// Structured log stream and engine logs
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Failure reports written by the file tracker
    pub fn reports_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("reports"))
    }

    /// Append-only structured log stream shared by all deployments
    pub fn journal_file(&self) -> File {
        self.logs_dir().file("deployments.jsonl")
    }

    /// Create the directories
    pub async fn setup(&self) -> Result<(), ProvisionError> {
        self.state_dir().create().await?;
        self.logs_dir().create().await?;
        self.reports_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        let base_dir = std::env::var_os("PROVISIONER_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".provisioner")))
            .unwrap_or_else(|| PathBuf::from(".provisioner"));

        Self::new(base_dir)
    }
}
