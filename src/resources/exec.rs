//! Exec applicator: one-shot tasks in a container or on the host

use std::path::PathBuf;

use serde_json::{json, Map, Value};

use crate::docker::OneShotOpts;
use crate::error::EngineResult;
use crate::module::ResourceType;
use crate::process::run_host_command;
use crate::state::ResourceState;

use super::{bool_prop, command_prop, invalid, string_map, string_prop, ApplyContext};

pub(crate) async fn apply(
    ctx: &ApplyContext<'_>,
    name: &str,
    props: &Value,
) -> EngineResult<ResourceState> {
    let command =
        command_prop(props, "command").ok_or_else(|| invalid(name, "exec requires a command"))?;

    let mut environment = ctx.base_env.clone();
    environment.extend(string_map(props, "environment"));

    let working_dir = string_prop(props, "working_dir").map(|dir| {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            path
        } else {
            ctx.work_dir
                .clone()
                .unwrap_or_else(|| ctx.module_dir.clone())
                .join(path)
        }
    });

    let output = match string_prop(props, "image") {
        // Containerized: a single-use container on the requested network.
        Some(image) => {
            ctx.progress.emit(&format!("running task {} in {}", name, image));
            let opts = OneShotOpts {
                image,
                command,
                environment,
                network: string_prop(props, "network"),
                working_dir: string_prop(props, "working_dir"),
            };
            ctx.docker
                .run_one_shot(&opts, ctx.sinks, ctx.progress, ctx.cancel)
                .await?
        }
        // Host mode; container-network URLs may need the localhost rewrite.
        None => {
            if bool_prop(props, "resolve_to_localhost") {
                environment = ctx.ports.rewrite_env(&environment);
            }
            ctx.progress.emit(&format!("running task {}", name));
            run_host_command(&command, working_dir.as_deref(), &environment).await?
        }
    };

    Ok(ResourceState {
        resource_type: ResourceType::Exec,
        id: name.to_string(),
        properties: props.clone(),
        outputs: json!({"output": output}),
        destroy_cmd: None,
        extra: Map::new(),
    })
}
