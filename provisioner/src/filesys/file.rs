//! File operations

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::ProvisionError;

/// Distinguishes temp files of concurrent writes within this process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub async fn read_string(&self) -> Result<String, ProvisionError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, ProvisionError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Write JSON through a sibling temp file so readers never see a torn document
    pub async fn write_json_atomic<T: Serialize>(&self, value: &T) -> Result<(), ProvisionError> {
        let contents = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&contents).await
    }

    /// Atomic write using a temporary file
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), ProvisionError> {
        let temp_path = self.write_temp(contents).await?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Create the file with `value` as JSON unless it already exists.
    ///
    /// Returns false when another writer owns the path. The document becomes
    /// visible complete or not at all.
    pub async fn create_json_exclusive<T: Serialize>(&self, value: &T) -> Result<bool, ProvisionError> {
        let contents = serde_json::to_vec_pretty(value)?;
        let temp_path = self.write_temp(&contents).await?;

        let linked = fs::hard_link(&temp_path, &self.path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `contents` to a sibling temp file no other write shares
    async fn write_temp(&self, contents: &[u8]) -> Result<PathBuf, ProvisionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self.path.with_file_name(format!(
            ".{}.{}-{}.tmp",
            name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        Ok(temp_path)
    }

    /// Append one line with a single write.
    ///
    /// The file is opened in append mode so concurrent writers interleave
    /// whole lines, never fragments.
    pub async fn append_line(&self, line: &str) -> Result<(), ProvisionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), ProvisionError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}
