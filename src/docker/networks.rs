//! Network CRUD with name-dedup

use bollard::network::CreateNetworkOptions;
use tracing::{debug, info};

use super::{is_not_found, DockerError, DockerResult, DockerService};

impl DockerService {
    /// Create a network by name, reusing an existing one with that name.
    pub async fn ensure_network(&self, name: &str) -> DockerResult<String> {
        match self.client().inspect_network::<String>(name, None).await {
            Ok(existing) => {
                debug!("Network {} already exists", name);
                return Ok(existing.id.unwrap_or_else(|| name.to_string()));
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(DockerError::Docker(e)),
        }

        let options = CreateNetworkOptions {
            name,
            check_duplicate: true,
            ..Default::default()
        };
        let created = self.client().create_network(options).await?;
        info!("Created network {}", name);
        Ok(created.id)
    }

    /// Whether a network with this id or name still exists.
    pub async fn network_exists(&self, id: &str) -> DockerResult<bool> {
        match self.client().inspect_network::<String>(id, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(DockerError::Docker(e)),
        }
    }

    /// Remove a network; missing networks are fine.
    pub async fn remove_network(&self, id: &str) -> DockerResult<()> {
        match self.client().remove_network(id).await {
            Ok(_) => {
                info!("Removed network {}", id);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(DockerError::Docker(e)),
        }
    }
}
