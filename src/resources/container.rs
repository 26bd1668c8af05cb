//! Container applicator: reuse, adoption, creation, output shaping

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::docker::{
    rewrite_localhost, ContainerOpts, HealthcheckOpts, PortSpec, VolumeSpec,
};
use crate::error::EngineResult;
use crate::module::ResourceType;
use crate::state::ResourceState;

use super::{
    bool_prop, command_prop, duration_prop, invalid, prop, string_list, string_map, string_prop,
    u64_value, ApplyContext,
};

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_RETRIES: u64 = 30;

pub(crate) async fn apply(
    ctx: &ApplyContext<'_>,
    name: &str,
    props: &Value,
    prior: Option<&ResourceState>,
) -> EngineResult<ResourceState> {
    let opts = parse_opts(name, props)?;

    // Prior state: reuse the running container when its config still matches.
    if let Some(prior) = prior {
        if ctx.docker.is_container_running(&prior.id).await?
            && ctx.docker.container_matches_config(&prior.id, &opts).await?
        {
            info!("Reusing container {} for {}", prior.id, name);
            register_ports_from_outputs(ctx, &opts.name, &prior.outputs);
            return Ok(prior.clone());
        }
        debug!("Prior container for {} drifted, removing", name);
        ctx.docker.remove_container(&prior.id).await?;
    } else if let Some(existing) = ctx.docker.get_container_by_name(&opts.name).await? {
        // No state, but a container with our name exists: adopt it when it
        // matches, otherwise clear the way.
        if ctx.docker.is_container_running(&existing).await?
            && ctx.docker.container_matches_config(&existing, &opts).await?
        {
            info!("Adopting running container {} as {}", existing, name);
            let inspected = ctx.docker.inspect_container_info(&existing).await?;
            let outputs = build_outputs(ctx, &opts, &inspected.id, &inspected.ports);
            let id = inspected.id.clone();
            return Ok(state_for(props, id, outputs));
        }
        debug!("Unmanaged container named {} does not match, removing", opts.name);
        ctx.docker.remove_container(&existing).await?;
    }

    ctx.progress.emit(&format!("starting container {}", opts.name));
    let outcome = ctx
        .docker
        .run_container(&opts, ctx.sinks, ctx.progress, ctx.cancel)
        .await?;

    let ports = if opts.wait {
        // One-shot containers have exited; no host ports to read back.
        HashMap::new()
    } else {
        match ctx.docker.inspect_container_info(&outcome.id).await {
            Ok(inspected) => inspected.ports,
            Err(e) => {
                // A container we cannot inspect is not a resource we can
                // manage; clean up before surfacing.
                let _ = ctx.docker.remove_container(&outcome.id).await;
                return Err(e.into());
            }
        }
    };

    let outputs = build_outputs(ctx, &opts, &outcome.id, &ports);
    Ok(state_for(props, outcome.id, outputs))
}

fn state_for(props: &Value, id: String, outputs: Value) -> ResourceState {
    ResourceState {
        resource_type: ResourceType::Container,
        id,
        properties: props.clone(),
        outputs,
        destroy_cmd: None,
        extra: Map::new(),
    }
}

/// Outputs contract: `ports` is an ordered array mirroring the declaration,
/// with `host` filled from inspect. Downstream expressions address it by
/// index.
fn build_outputs(
    ctx: &ApplyContext<'_>,
    opts: &ContainerOpts,
    id: &str,
    inspected_ports: &HashMap<String, u16>,
) -> Value {
    let ports: Vec<Value> = opts
        .ports
        .iter()
        .map(|declared| {
            let host = inspected_ports
                .get(&format!("{}/tcp", declared.container))
                .copied()
                .unwrap_or(declared.host);
            ctx.ports.register(&opts.name, declared.container, host);
            json!({"container": declared.container, "host": host})
        })
        .collect();

    let environment: Map<String, Value> = opts
        .environment
        .iter()
        .map(|(k, v)| {
            let value = if opts.resolve_localhost {
                rewrite_localhost(v)
            } else {
                v.clone()
            };
            (k.clone(), Value::String(value))
        })
        .collect();

    json!({
        "container_id": id,
        "name": opts.name,
        "environment": environment,
        "ports": ports,
    })
}

/// Re-register ports from a reused resource's recorded outputs.
fn register_ports_from_outputs(ctx: &ApplyContext<'_>, container_name: &str, outputs: &Value) {
    let Some(Value::Array(ports)) = outputs.get("ports") else {
        return;
    };
    for entry in ports {
        let container = entry.get("container").and_then(u64_value);
        let host = entry.get("host").and_then(u64_value);
        if let (Some(container), Some(host)) = (container, host) {
            ctx.ports
                .register(container_name, container as u16, host as u16);
        }
    }
}

fn parse_opts(name: &str, props: &Value) -> EngineResult<ContainerOpts> {
    let image = string_prop(props, "image")
        .ok_or_else(|| invalid(name, "container requires an image"))?;

    let mut ports = Vec::new();
    if let Some(Value::Array(entries)) = prop(props, "ports") {
        for entry in entries {
            let container = entry
                .get("container")
                .and_then(u64_value)
                .ok_or_else(|| invalid(name, "port mapping requires a container port"))?;
            // `host: 0` and `host: "auto"` both ask for an ephemeral port.
            let host = match entry.get("host") {
                Some(Value::String(s)) if s == "auto" => 0,
                Some(value) => u64_value(value)
                    .ok_or_else(|| invalid(name, "port mapping host must be a number or \"auto\""))?,
                None => 0,
            };
            ports.push(PortSpec {
                container: container as u16,
                host: host as u16,
            });
        }
    }

    let mut volumes = Vec::new();
    if let Some(Value::Array(entries)) = prop(props, "volumes") {
        for entry in entries {
            let path = entry
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid(name, "volume mount requires a path"))?;
            volumes.push(VolumeSpec {
                name: entry
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                source: entry
                    .get("source")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                path: path.to_string(),
            });
        }
    }

    let healthcheck = match prop(props, "healthcheck") {
        Some(hc) => {
            let command = command_prop(hc, "command")
                .ok_or_else(|| invalid(name, "healthcheck requires a command"))?;
            Some(HealthcheckOpts {
                command,
                interval: duration_prop(hc, "interval", DEFAULT_HEALTH_INTERVAL),
                timeout: duration_prop(hc, "timeout", DEFAULT_HEALTH_TIMEOUT),
                retries: prop(hc, "retries")
                    .and_then(u64_value)
                    .unwrap_or(DEFAULT_HEALTH_RETRIES) as u32,
                start_period: duration_prop(hc, "start_period", Duration::ZERO),
            })
        }
        None => None,
    };

    let entrypoint = match prop(props, "entrypoint") {
        Some(Value::Array(_)) => Some(string_list(props, "entrypoint")),
        Some(Value::String(s)) => Some(vec![s.clone()]),
        _ => None,
    };

    Ok(ContainerOpts {
        name: string_prop(props, "name").unwrap_or_else(|| name.to_string()),
        image,
        command: command_prop(props, "command"),
        entrypoint,
        environment: string_map(props, "environment"),
        ports,
        volumes,
        network: string_prop(props, "network"),
        restart: string_prop(props, "restart"),
        log_driver: string_prop(props, "log_driver"),
        log_options: string_map(props, "log_options"),
        healthcheck,
        extra_hosts: string_list(props, "extra_hosts"),
        resolve_localhost: bool_prop(props, "resolve_localhost"),
        wait: bool_prop(props, "wait"),
        working_dir: string_prop(props, "working_dir"),
    })
}
