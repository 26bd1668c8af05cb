//! Volume CRUD with name-dedup

use bollard::volume::CreateVolumeOptions;
use tracing::{debug, info};

use super::{is_not_found, DockerError, DockerResult, DockerService};

impl DockerService {
    /// Create a named volume; creating an existing name is a no-op daemon-side.
    pub async fn ensure_volume(&self, name: &str) -> DockerResult<String> {
        match self.client().inspect_volume(name).await {
            Ok(existing) => {
                debug!("Volume {} already exists", name);
                return Ok(existing.name);
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(DockerError::Docker(e)),
        }

        let options = CreateVolumeOptions {
            name,
            ..Default::default()
        };
        let created = self.client().create_volume(options).await?;
        info!("Created volume {}", name);
        Ok(created.name)
    }

    /// Whether a volume with this name still exists.
    pub async fn volume_exists(&self, name: &str) -> DockerResult<bool> {
        match self.client().inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(DockerError::Docker(e)),
        }
    }

    /// Remove a volume; missing volumes are fine.
    pub async fn remove_volume(&self, name: &str) -> DockerResult<()> {
        match self.client().remove_volume(name, None).await {
            Ok(_) => {
                info!("Removed volume {}", name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(DockerError::Docker(e)),
        }
    }
}
