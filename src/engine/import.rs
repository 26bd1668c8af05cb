//! Import existing daemon objects into state

use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::module::ResourceType;
use crate::state::{ResourceState, State};
use crate::system::Progress;

use super::Engine;

/// One `{address, id}` row from an import mapping file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportMapping {
    pub address: String,
    pub id: String,
}

/// Resource name for an address like `resources.api` or plain `api`.
fn name_for_address(address: &str) -> &str {
    address.rsplit('.').next().unwrap_or(address)
}

impl Engine {
    /// Probe each mapping, infer its resource type, and insert it into
    /// state with outputs synthesized from inspection.
    pub async fn import(
        &self,
        prior_state: Option<State>,
        mappings: &[ImportMapping],
        progress: Progress,
        cancel: CancellationToken,
    ) -> EngineResult<State> {
        let mut state = prior_state.unwrap_or_default();

        for mapping in mappings {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let name = name_for_address(&mapping.address);
            progress.emit(&format!("importing {}", name));

            let resource_state = if mapping.address.contains("network") {
                ResourceState {
                    resource_type: ResourceType::Network,
                    id: mapping.id.clone(),
                    properties: json!({}),
                    outputs: json!({"id": mapping.id, "name": name}),
                    destroy_cmd: None,
                    extra: Map::new(),
                }
            } else if mapping.address.contains("volume") {
                ResourceState {
                    resource_type: ResourceType::Volume,
                    id: mapping.id.clone(),
                    properties: json!({}),
                    outputs: json!({"id": mapping.id, "name": name}),
                    destroy_cmd: None,
                    extra: Map::new(),
                }
            } else {
                // Fall back to a container probe.
                let inspected = self
                    .docker
                    .inspect_container_info(&mapping.id)
                    .await
                    .map_err(|_| EngineError::UnknownImport(mapping.address.clone()))?;

                // "3000/tcp" keys become ordered {container, host} entries.
                let mut port_pairs: Vec<(u16, u16)> = inspected
                    .ports
                    .iter()
                    .filter_map(|(key, host)| {
                        key.split('/')
                            .next()
                            .and_then(|p| p.parse::<u16>().ok())
                            .map(|container| (container, *host))
                    })
                    .collect();
                port_pairs.sort_unstable();

                for (container, host) in &port_pairs {
                    self.ports.register(&inspected.name, *container, *host);
                }

                let ports: Vec<_> = port_pairs
                    .iter()
                    .map(|(container, host)| json!({"container": container, "host": host}))
                    .collect();

                ResourceState {
                    resource_type: ResourceType::Container,
                    id: inspected.id.clone(),
                    properties: json!({}),
                    outputs: json!({
                        "container_id": inspected.id,
                        "name": inspected.name,
                        "ports": ports,
                    }),
                    destroy_cmd: None,
                    extra: Map::new(),
                }
            };

            info!(
                "Imported {} as {} ({})",
                mapping.id, name, resource_state.resource_type
            );
            state.resources.insert(name.to_string(), resource_state);
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_for_address() {
        assert_eq!(name_for_address("resources.api"), "api");
        assert_eq!(name_for_address("api"), "api");
        assert_eq!(name_for_address("module.web.network.frontend"), "frontend");
    }
}
