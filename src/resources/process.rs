//! Process applicator

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::module::ResourceType;
use crate::process::{free_port, ProcessSpec, ReadinessCheck};
use crate::state::ResourceState;

use super::{
    bool_prop, command_prop, duration_prop, invalid, prop, string_map, string_prop, ApplyContext,
};

const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Sentinel endpoint meaning "no service exposed"; skips readiness entirely.
const NO_SERVICE_SENTINEL: &str = "localhost:0";

/// Placeholder resolved against the process's own environment.
const SELF_PORT_PLACEHOLDER: &str = "${self.environment.PORT}";

pub(crate) async fn apply(
    ctx: &ApplyContext<'_>,
    name: &str,
    props: &Value,
    prior: Option<&ResourceState>,
) -> EngineResult<ResourceState> {
    let process_name = string_prop(props, "name").unwrap_or_else(|| name.to_string());

    if let Some(prior) = prior {
        if ctx.processes.is_alive(&prior.id) {
            info!("Process {} still alive, reusing", prior.id);
            return Ok(prior.clone());
        }
    }

    let command =
        command_prop(props, "command").ok_or_else(|| invalid(name, "process requires a command"))?;

    let mut environment = ctx.base_env.clone();
    environment.extend(string_map(props, "environment"));

    // PORT=auto: grab a free port before the subprocess starts so the
    // readiness endpoint can point at it.
    if environment.get("PORT").map(String::as_str) == Some("auto") {
        let port = free_port()?;
        debug!("Assigned PORT={} to process {}", port, process_name);
        environment.insert("PORT".to_string(), port.to_string());
    }

    if bool_prop(props, "resolve_to_localhost") {
        environment = ctx.ports.rewrite_env(&environment);
    }

    let readiness = match prop(props, "readiness") {
        Some(block) => {
            let mut endpoint = string_prop(block, "endpoint")
                .ok_or_else(|| invalid(name, "readiness requires an endpoint"))?;
            if let Some(port) = environment.get("PORT") {
                endpoint = endpoint.replace(SELF_PORT_PLACEHOLDER, port);
            }
            // `localhost:0` marks a process with nothing to probe.
            if endpoint.contains(NO_SERVICE_SENTINEL) {
                debug!("Skipping readiness for {}: no service exposed", process_name);
                None
            } else {
                Some(ReadinessCheck {
                    kind: string_prop(block, "type").unwrap_or_else(|| "http".to_string()),
                    endpoint,
                    interval: duration_prop(block, "interval", DEFAULT_READINESS_INTERVAL),
                    timeout: duration_prop(block, "timeout", DEFAULT_READINESS_TIMEOUT),
                })
            }
        }
        None => None,
    };

    let working_dir = string_prop(props, "working_dir")
        .map(PathBuf::from)
        .map(|path| {
            if path.is_absolute() {
                path
            } else {
                ctx.work_dir
                    .clone()
                    .unwrap_or_else(|| ctx.module_dir.clone())
                    .join(path)
            }
        })
        .or_else(|| ctx.work_dir.clone());

    ctx.progress.emit(&format!("starting process {}", process_name));
    let spec = ProcessSpec {
        name: process_name.clone(),
        command,
        working_dir,
        environment: environment.clone(),
        readiness,
    };
    let info = ctx.processes.start(spec, ctx.sinks, ctx.cancel).await?;

    let env_json: Map<String, Value> = environment
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    Ok(ResourceState {
        resource_type: ResourceType::Process,
        id: process_name.clone(),
        properties: props.clone(),
        outputs: json!({
            "pid": info.pid,
            "name": process_name,
            "environment": env_json,
        }),
        destroy_cmd: None,
        extra: Map::new(),
    })
}
