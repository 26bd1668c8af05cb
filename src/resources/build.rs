//! Build applicator

use std::path::PathBuf;

use serde_json::{json, Map, Value};

use crate::docker::BuildOptions;
use crate::error::EngineResult;
use crate::module::ResourceType;
use crate::state::ResourceState;

use super::{invalid, prop, string_list, string_map, string_prop, ApplyContext};

pub(crate) async fn apply(
    ctx: &ApplyContext<'_>,
    name: &str,
    props: &Value,
) -> EngineResult<ResourceState> {
    let context = string_prop(props, "context")
        .ok_or_else(|| invalid(name, "build requires a context"))?;
    let context = {
        let path = PathBuf::from(&context);
        if path.is_absolute() {
            path
        } else {
            ctx.module_dir.join(path)
        }
    };

    // `cache: false` becomes no_cache.
    let cache = match prop(props, "cache") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s != "false",
        _ => true,
    };

    let opts = BuildOptions {
        context,
        dockerfile: string_prop(props, "dockerfile"),
        tags: string_list(props, "tags"),
        args: string_map(props, "args"),
        target: string_prop(props, "target"),
        no_cache: !cache,
        timeout: ctx.config.build_timeout,
        verbose: ctx.config.debug,
    };

    let outcome = ctx
        .docker
        .build_image(&opts, ctx.sinks, ctx.progress, ctx.cancel)
        .await?;

    let primary_tag = outcome
        .tags
        .first()
        .cloned()
        .unwrap_or_else(|| outcome.image_id.clone());

    Ok(ResourceState {
        resource_type: ResourceType::Build,
        id: outcome.image_id.clone(),
        properties: props.clone(),
        outputs: json!({
            "image_id": outcome.image_id,
            "tag": primary_tag,
            "tags": outcome.tags,
            "size": outcome.size,
        }),
        destroy_cmd: None,
        extra: Map::new(),
    })
}
