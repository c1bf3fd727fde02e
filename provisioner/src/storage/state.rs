//! Deployment state store
//!
//! One JSON document per deployment id, rewritten atomically after every
//! step transition. Records are never removed by the engine.

use tracing::debug;

use crate::errors::ProvisionError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::Deployment;

/// Ids tried by [`DeploymentStore::create`] before giving up
const MAX_ID_SUFFIX: usize = 100;

/// Durable deployment records
#[derive(Debug, Clone)]
pub struct DeploymentStore {
    dir: Dir,
}

impl DeploymentStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    fn file(&self, id: &str) -> Result<File, ProvisionError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(ProvisionError::ValidationError(format!(
                "Invalid deployment id: {:?}",
                id
            )));
        }
        Ok(self.dir.file(&format!("{}.json", id)))
    }

    /// Persist the full record
    pub async fn save(&self, deployment: &Deployment) -> Result<(), ProvisionError> {
        let file = self.file(&deployment.id)?;
        file.write_json_atomic(deployment).await?;
        debug!(
            "Persisted deployment {} (status: {}, step {}/{})",
            deployment.id, deployment.status, deployment.current_step, deployment.total_steps
        );
        Ok(())
    }

    /// Persist a new record under an id no other record holds.
    ///
    /// When the derived id is taken, `-2`, `-3`, ... are appended until a
    /// free one is claimed; `deployment.id` is updated to the claimed id.
    pub async fn create(&self, deployment: &mut Deployment) -> Result<(), ProvisionError> {
        let base = deployment.id.clone();

        for n in 1..=MAX_ID_SUFFIX {
            if n > 1 {
                deployment.id = format!("{}-{}", base, n);
            }
            if self.file(&deployment.id)?.create_json_exclusive(deployment).await? {
                debug!("Created deployment record {}", deployment.id);
                return Ok(());
            }
        }

        deployment.id = base;
        Err(ProvisionError::StateError(format!(
            "No free deployment id for {} after {} attempts",
            deployment.id, MAX_ID_SUFFIX
        )))
    }

    /// Load a record by id
    pub async fn load(&self, id: &str) -> Result<Deployment, ProvisionError> {
        let file = self.file(id)?;
        if !file.exists().await {
            return Err(ProvisionError::NotFound(format!("Deployment {}", id)));
        }
        file.read_json().await
    }

    /// All persisted records, ordered by id
    pub async fn list(&self) -> Result<Vec<Deployment>, ProvisionError> {
        let mut deployments = Vec::new();
        for path in self.dir.list_files_with_extension("json").await? {
            match File::new(&path).read_json::<Deployment>().await {
                Ok(deployment) => deployments.push(deployment),
                Err(e) => debug!("Skipping unreadable state file {}: {}", path.display(), e),
            }
        }
        Ok(deployments)
    }

    /// Remove a record. Only ever called on operator request.
    pub async fn remove(&self, id: &str) -> Result<(), ProvisionError> {
        self.file(id)?.delete().await
    }
}
