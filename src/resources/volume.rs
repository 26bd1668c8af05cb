//! Volume applicator

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
    let volume_name = string_prop(props, "name").unwrap_or_else(|| name.to_string());

    if let Some(prior) = prior {
        if ctx.docker.volume_exists(&prior.id).await? {
            info!("Reusing volume {} for {}", prior.id, name);
            return Ok(prior.clone());
        }
    }

    ctx.progress.emit(&format!("creating volume {}", volume_name));
    let id = ctx.docker.ensure_volume(&volume_name).await?;

    Ok(ResourceState {
        resource_type: ResourceType::Volume,
        id: id.clone(),
        properties: props.clone(),
        outputs: json!({"id": id, "name": volume_name}),
        destroy_cmd: None,
        extra: Map::new(),
    })
}
