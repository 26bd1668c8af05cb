//! Resource applicators
//!
//! One module per resource type. Each applicator receives the resolved
//! property tree plus any prior state for its name and returns the new
//! [`ResourceState`]; the orchestrator owns ordering and state insertion.

mod build;
mod container;
mod crypto;
mod exec;
mod network;
mod process;
mod volume;

pub use crypto::CryptoError;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{parse_duration, EngineConfig};
use crate::docker::DockerService;
use crate::error::{EngineError, EngineResult};
use crate::module::ResourceType;
use crate::ports::PortRegistry;
use crate::process::ProcessManager;
use crate::state::ResourceState;
use crate::system::{OutputChannels, Progress};

/// Collaborators every applicator works against
pub(crate) struct ApplyContext<'a> {
    pub docker: &'a DockerService,
    pub processes: &'a ProcessManager,
    pub ports: &'a PortRegistry,
    pub sinks: &'a OutputChannels,
    pub progress: &'a Progress,
    pub cancel: &'a CancellationToken,
    pub config: &'a EngineConfig,
    /// Directory the module was loaded from; relative paths resolve here.
    pub module_dir: PathBuf,
    /// Working directory for host-side commands, when the caller set one.
    pub work_dir: Option<PathBuf>,
    /// Ambient environment overlaid under every process/exec environment.
    pub base_env: &'a BTreeMap<String, String>,
}

/// Dispatch to the applicator for `resource_type`.
pub(crate) async fn apply_resource(
    ctx: &ApplyContext<'_>,
    resource_type: ResourceType,
    name: &str,
    properties: &Value,
    prior: Option<&ResourceState>,
) -> EngineResult<ResourceState> {
    match resource_type {
        ResourceType::Container => container::apply(ctx, name, properties, prior).await,
        ResourceType::Network => network::apply(ctx, name, properties, prior).await,
        ResourceType::Volume => volume::apply(ctx, name, properties, prior).await,
        ResourceType::Build => build::apply(ctx, name, properties).await,
        ResourceType::Process => process::apply(ctx, name, properties, prior).await,
        ResourceType::Exec => exec::apply(ctx, name, properties).await,
        ResourceType::CryptoRsa | ResourceType::CryptoEcdsa | ResourceType::CryptoSymmetric => {
            crypto::apply(resource_type, name, properties)
        }
    }
}

/// Type-specific teardown, used by destroy and rollback.
pub(crate) async fn teardown_resource(
    ctx: &ApplyContext<'_>,
    state: &ResourceState,
) -> EngineResult<()> {
    match state.resource_type {
        ResourceType::Container => ctx.docker.remove_container(&state.id).await?,
        ResourceType::Network => ctx.docker.remove_network(&state.id).await?,
        ResourceType::Volume => ctx.docker.remove_volume(&state.id).await?,
        // Images stay on disk unless removable without force.
        ResourceType::Build => {
            let _ = ctx.docker.remove_image(&state.id).await;
        }
        ResourceType::Process => {
            ctx.processes
                .stop(&state.id, Duration::from_secs(10))
                .await?
        }
        ResourceType::Exec
        | ResourceType::CryptoRsa
        | ResourceType::CryptoEcdsa
        | ResourceType::CryptoSymmetric => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Property tree helpers
// ---------------------------------------------------------------------------

pub(crate) fn invalid(resource: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidProperties {
        resource: resource.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn prop<'a>(props: &'a Value, key: &str) -> Option<&'a Value> {
    match props.get(key) {
        Some(Value::Null) | None => None,
        Some(value) => Some(value),
    }
}

/// Scalar property as a string; numbers and bools are stringified.
pub(crate) fn string_prop(props: &Value, key: &str) -> Option<String> {
    prop(props, key).and_then(value_as_string)
}

pub(crate) fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Truthy property: `true` or the string `"true"`.
pub(crate) fn bool_prop(props: &Value, key: &str) -> bool {
    match prop(props, key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

/// Numeric property tolerant of string digits.
pub(crate) fn u64_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A command property: a list is taken verbatim, a bare string is wrapped
/// for the shell.
pub(crate) fn command_prop(props: &Value, key: &str) -> Option<Vec<String>> {
    match prop(props, key)? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(value_as_string)
                .collect(),
        ),
        Value::String(s) => Some(vec!["sh".to_string(), "-c".to_string(), s.clone()]),
        _ => None,
    }
}

/// A map property with every leaf stringified.
pub(crate) fn string_map(props: &Value, key: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(Value::Object(map)) = prop(props, key) {
        for (k, v) in map {
            if let Some(s) = value_as_string(v) {
                out.insert(k.clone(), s);
            }
        }
    }
    out
}

/// A list-of-strings property.
pub(crate) fn string_list(props: &Value, key: &str) -> Vec<String> {
    match prop(props, key) {
        Some(Value::Array(items)) => items.iter().filter_map(value_as_string).collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// A duration property: `"30s"`-style strings or bare seconds.
pub(crate) fn duration_prop(props: &Value, key: &str, default: Duration) -> Duration {
    match prop(props, key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Duration::from_secs)
            .unwrap_or(default),
        Some(Value::String(s)) => parse_duration(s).unwrap_or(default),
        _ => default,
    }
}
