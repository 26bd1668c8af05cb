//! Network applicator

use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::EngineResult;
use crate::module::ResourceType;
use crate::state::ResourceState;

use super::{string_prop, ApplyContext};

pub(crate) async fn apply(
    ctx: &ApplyContext<'_>,
    name: &str,
    props: &Value,
    prior: Option<&ResourceState>,
) -> EngineResult<ResourceState> {
    let network_name = string_prop(props, "name").unwrap_or_else(|| name.to_string());

    if let Some(prior) = prior {
        if ctx.docker.network_exists(&prior.id).await? {
            info!("Reusing network {} for {}", prior.id, name);
            return Ok(prior.clone());
        }
    }

    ctx.progress.emit(&format!("creating network {}", network_name));
    let id = ctx.docker.ensure_network(&network_name).await?;

    Ok(ResourceState {
        resource_type: ResourceType::Network,
        id: id.clone(),
        properties: props.clone(),
        outputs: json!({"id": id, "name": network_name}),
        destroy_cmd: None,
        extra: Map::new(),
    })
}
