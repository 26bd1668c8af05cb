//! The ordered apply loop

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::expr::{evaluate, stringify, EvalContext};
use crate::module::{load_module, resolve_inputs, DestroySpec, ResourceDefinition};
use crate::resources::{apply_resource, ApplyContext};
use crate::state::{DestroyCommand, State};

use super::{ApplyOptions, ApplyOutcome, Engine};

/// `when` truthiness: `true` or the string `"true"`; everything else skips.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        _ => false,
    }
}

impl Engine {
    /// Apply a module: iterate resources in declaration order, thread the
    /// evaluation context, and persist each resource's state the moment its
    /// applicator returns. Any failure rolls back what was applied.
    pub async fn apply(
        &self,
        opts: ApplyOptions,
        cancel: CancellationToken,
    ) -> EngineResult<ApplyOutcome> {
        let module = load_module(&opts.module_source)?;
        let inputs = resolve_inputs(&module, &opts.inputs)?;

        let mut state = opts.prior_state.unwrap_or_default();
        state.module_path = opts.module_source.display().to_string();
        state.inputs = inputs;
        state.outputs = Map::new();

        let module_dir = if opts.module_source.is_dir() {
            opts.module_source.clone()
        } else {
            opts.module_source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        };

        let actx = ApplyContext {
            docker: &self.docker,
            processes: &self.processes,
            ports: &self.ports,
            sinks: &self.sinks,
            progress: &opts.progress,
            cancel: &cancel,
            config: &self.config,
            module_dir,
            work_dir: opts.work_dir.clone(),
            base_env: &opts.environment,
        };

        info!(
            "Applying module {} ({} resources)",
            state.module_path,
            module.resources.len()
        );

        for (name, def) in &module.resources {
            if cancel.is_cancelled() {
                self.rollback(&mut state, &actx).await;
                return Err(EngineError::Cancelled);
            }

            if let Err(e) = self.apply_one(&actx, &mut state, name, def).await {
                warn!("Resource {} failed: {}", name, e);
                self.rollback(&mut state, &actx).await;
                return Err(e.for_resource(name));
            }
        }

        // Outputs are evaluated exactly once, against the final context.
        for (name, def) in &module.outputs {
            let value = {
                let ctx = EvalContext {
                    inputs: &state.inputs,
                    resources: &state.resources,
                };
                evaluate(&def.value, &ctx)
            };
            match value {
                Ok(value) => {
                    state.outputs.insert(name.clone(), value);
                }
                Err(e) => {
                    warn!("Output {} failed to evaluate: {}", name, e);
                    self.rollback(&mut state, &actx).await;
                    return Err(e.into());
                }
            }
        }

        Ok(ApplyOutcome {
            outputs: state.outputs.clone(),
            state,
        })
    }

    async fn apply_one(
        &self,
        actx: &ApplyContext<'_>,
        state: &mut State,
        name: &str,
        def: &ResourceDefinition,
    ) -> EngineResult<()> {
        if let Some(when) = &def.when {
            let value = {
                let ctx = EvalContext {
                    inputs: &state.inputs,
                    resources: &state.resources,
                };
                evaluate(&Value::String(when.clone()), &ctx)?
            };
            if !truthy(&value) {
                info!("Skipping resource {} (when is falsy)", name);
                actx.progress.emit(&format!("skipping {}", name));
                return Ok(());
            }
        }

        let resolved = {
            let ctx = EvalContext {
                inputs: &state.inputs,
                resources: &state.resources,
            };
            evaluate(&def.properties, &ctx)?
        };

        let prior = state.resources.get(name).cloned();
        let mut resource_state =
            apply_resource(actx, def.resource_type, name, &resolved, prior.as_ref()).await?;

        // Resolve the teardown command now, against the current context, so
        // destroy can run later without the module.
        if let Some(spec) = &def.destroy {
            let ctx = EvalContext {
                inputs: &state.inputs,
                resources: &state.resources,
            };
            resource_state.destroy_cmd = Some(resolve_destroy_spec(spec, &ctx)?);
        }

        state.resources.insert(name.to_string(), resource_state);
        Ok(())
    }

    /// Destroy already-applied resources in reverse order, best-effort.
    pub(crate) async fn rollback(&self, state: &mut State, actx: &ApplyContext<'_>) {
        if state.resources.is_empty() {
            return;
        }
        info!("Rolling back {} applied resources", state.resources.len());

        let names: Vec<String> = state.resources.keys().cloned().collect();
        for name in names.iter().rev() {
            let Some(resource_state) = state.resources.get(name).cloned() else {
                continue;
            };
            if let Err(e) = self.destroy_one(actx, name, &resource_state).await {
                warn!("Rollback of {} failed: {}", name, e);
                self.sinks
                    .stderr
                    .push_line(&format!("rollback of {} failed: {}", name, e));
            }
            state.resources.shift_remove(name);
        }
    }
}

/// Substitute every expression in a destroy block into literal strings.
fn resolve_destroy_spec(spec: &DestroySpec, ctx: &EvalContext<'_>) -> EngineResult<DestroyCommand> {
    let mut command = Vec::with_capacity(spec.command.len());
    for part in &spec.command {
        command.push(stringify(&evaluate(part, ctx)?));
    }

    let resolve_opt = |value: &Option<Value>| -> EngineResult<Option<String>> {
        match value {
            Some(v) => {
                let resolved = evaluate(v, ctx)?;
                Ok(if resolved.is_null() {
                    None
                } else {
                    Some(stringify(&resolved))
                })
            }
            None => Ok(None),
        }
    };

    let environment = match &spec.environment {
        Some(env) => {
            let mut resolved = std::collections::BTreeMap::new();
            for (key, value) in env {
                resolved.insert(key.clone(), stringify(&evaluate(value, ctx)?));
            }
            Some(resolved)
        }
        None => None,
    };

    Ok(DestroyCommand {
        command,
        image: resolve_opt(&spec.image)?,
        network: resolve_opt(&spec.network)?,
        working_dir: resolve_opt(&spec.working_dir)?,
        environment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::docker::DockerService;
    use crate::system::Progress;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::io::Write as _;
    use std::time::Duration;

    fn engine() -> Engine {
        // Connecting is lazy; none of these modules touch the daemon.
        Engine::new(
            DockerService::new().unwrap(),
            EngineConfig::default(),
        )
    }

    fn write_module(content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("module.yml")).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        dir
    }

    fn options(dir: &tempfile::TempDir, inputs: Map<String, Value>) -> ApplyOptions {
        ApplyOptions {
            module_source: dir.path().to_path_buf(),
            inputs,
            prior_state: None,
            work_dir: None,
            environment: BTreeMap::new(),
            progress: Progress::none(),
        }
    }

    #[tokio::test]
    async fn test_apply_orders_gates_and_evaluates_outputs() {
        let dir = write_module(
            r#"
plugin: cldctl
inputs:
  greeting:
    type: string
    default: hello
  enable_extra:
    type: bool
    default: false
resources:
  say:
    type: exec
    properties:
      command: ["sh", "-c", "printf '%s' '${inputs.greeting}'"]
  relay:
    type: exec
    properties:
      command: ["sh", "-c", "printf 'relayed %s' \"${resources.say.output}\""]
  skipped:
    type: exec
    when: ${inputs.enable_extra}
    properties:
      command: ["sh", "-c", "exit 1"]
  session:
    type: crypto/symmetric
    properties:
      bits: 128
outputs:
  relayed:
    value: ${resources.relay.output}
  key_len:
    value: ${resources.session.bits}
"#,
        );

        let engine = engine();
        let outcome = engine
            .apply(options(&dir, Map::new()), CancellationToken::new())
            .await
            .unwrap();

        // The gated resource is absent; everything else is present in
        // declaration order.
        let names: Vec<&str> = outcome.state.resources.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["say", "relay", "session"]);

        assert_eq!(outcome.outputs["relayed"], json!("relayed hello"));
        assert_eq!(outcome.outputs["key_len"], json!(128));

        let say = &outcome.state.resources["say"];
        assert_eq!(say.outputs["output"], json!("hello"));
    }

    #[tokio::test]
    async fn test_apply_failure_rolls_back_and_decorates() {
        let dir = write_module(
            r#"
resources:
  fine:
    type: exec
    properties:
      command: ["sh", "-c", "true"]
  broken:
    type: exec
    properties:
      command: ["sh", "-c", "echo kaboom >&2; exit 7"]
  unreached:
    type: exec
    properties:
      command: ["sh", "-c", "true"]
"#,
        );

        let engine = engine();
        let err = engine
            .apply(options(&dir, Map::new()), CancellationToken::new())
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.starts_with("resource broken:"), "got: {message}");
        assert!(message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_apply_requires_declared_inputs() {
        let dir = write_module(
            r#"
inputs:
  image:
    type: string
    required: true
resources: {}
"#,
        );

        let engine = engine();
        let err = engine
            .apply(options(&dir, Map::new()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[tokio::test]
    async fn test_destroy_command_is_resolved_into_state() {
        let dir = write_module(
            r#"
inputs:
  target:
    type: string
    default: /tmp/scratch
resources:
  task:
    type: exec
    properties:
      command: ["sh", "-c", "true"]
    destroy:
      command: ["sh", "-c", "echo cleaning ${inputs.target}"]
      working_dir: /tmp
"#,
        );

        let engine = engine();
        let outcome = engine
            .apply(options(&dir, Map::new()), CancellationToken::new())
            .await
            .unwrap();

        let destroy_cmd = outcome.state.resources["task"].destroy_cmd.as_ref().unwrap();
        assert_eq!(
            destroy_cmd.command,
            vec!["sh", "-c", "echo cleaning /tmp/scratch"]
        );
        assert_eq!(destroy_cmd.working_dir.as_deref(), Some("/tmp"));
        assert_eq!(destroy_cmd.image, None);

        // Destroy runs the command (exec has no native teardown) and empties
        // the state.
        let remaining = engine
            .destroy(outcome.state, Progress::none(), CancellationToken::new())
            .await
            .unwrap();
        assert!(remaining.resources.is_empty());
    }

    #[tokio::test]
    async fn test_apply_and_destroy_process_resource() {
        let dir = write_module(
            r#"
resources:
  sleeper:
    type: process
    properties:
      command: ["sleep", "30"]
"#,
        );

        let engine = engine();
        let outcome = engine
            .apply(options(&dir, Map::new()), CancellationToken::new())
            .await
            .unwrap();

        let sleeper = &outcome.state.resources["sleeper"];
        assert_eq!(sleeper.id, "sleeper");
        assert!(sleeper.outputs["pid"].as_u64().unwrap() > 0);
        assert!(engine.processes().is_alive("sleeper"));

        // Re-applying against the persisted state reuses the live process.
        let mut again = options(&dir, Map::new());
        again.prior_state = Some(outcome.state.clone());
        let second = engine
            .apply(again, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            second.state.resources["sleeper"].outputs["pid"],
            sleeper.outputs["pid"]
        );

        let remaining = engine
            .destroy(second.state, Progress::none(), CancellationToken::new())
            .await
            .unwrap();
        assert!(remaining.resources.is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!engine.processes().is_alive("sleeper"));
    }

    #[tokio::test]
    async fn test_when_string_false_skips() {
        let dir = write_module(
            r#"
resources:
  gated:
    type: exec
    when: "false"
    properties:
      command: ["sh", "-c", "exit 1"]
"#,
        );

        let engine = engine();
        let outcome = engine
            .apply(options(&dir, Map::new()), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.state.resources.is_empty());
    }
}
