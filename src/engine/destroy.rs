//! Destroy: custom teardown commands, then type-specific teardown

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::docker::OneShotOpts;
use crate::error::EngineResult;
use crate::process::run_host_command;
use crate::resources::{teardown_resource, ApplyContext};
use crate::state::{DestroyCommand, ResourceState, State};
use crate::system::Progress;

use super::Engine;

impl Engine {
    /// Tear down everything a state document records.
    ///
    /// Failures are reported and skipped; every other resource is still
    /// attempted. Resources that were torn down are removed from the
    /// returned state, so a re-run only retries the stragglers.
    pub async fn destroy(
        &self,
        mut state: State,
        progress: Progress,
        cancel: CancellationToken,
    ) -> EngineResult<State> {
        let base_env = BTreeMap::new();
        let actx = ApplyContext {
            docker: &self.docker,
            processes: &self.processes,
            ports: &self.ports,
            sinks: &self.sinks,
            progress: &progress,
            cancel: &cancel,
            config: &self.config,
            module_dir: PathBuf::from("."),
            work_dir: None,
            base_env: &base_env,
        };

        info!("Destroying {} resources", state.resources.len());

        let names: Vec<String> = state.resources.keys().cloned().collect();
        for name in names.iter().rev() {
            let Some(resource_state) = state.resources.get(name).cloned() else {
                continue;
            };
            progress.emit(&format!("destroying {}", name));
            match self.destroy_one(&actx, name, &resource_state).await {
                Ok(()) => {
                    state.resources.shift_remove(name);
                }
                Err(e) => {
                    warn!("Failed to destroy {}: {}", name, e);
                    self.sinks
                        .stderr
                        .push_line(&format!("failed to destroy {}: {}", name, e));
                }
            }
        }

        Ok(state)
    }

    /// One resource: custom destroy command first, then native teardown.
    pub(crate) async fn destroy_one(
        &self,
        actx: &ApplyContext<'_>,
        name: &str,
        resource_state: &ResourceState,
    ) -> EngineResult<()> {
        if let Some(cmd) = &resource_state.destroy_cmd {
            actx.progress
                .emit(&format!("running destroy command for {}", name));
            if let Err(e) = self.run_destroy_command(actx, cmd).await {
                // The native teardown still runs; the author's command is
                // advisory cleanup.
                warn!("Destroy command for {} failed: {}", name, e);
                self.sinks
                    .stderr
                    .push_line(&format!("destroy command for {} failed: {}", name, e));
            }
        }

        teardown_resource(actx, resource_state).await
    }

    async fn run_destroy_command(
        &self,
        actx: &ApplyContext<'_>,
        cmd: &DestroyCommand,
    ) -> EngineResult<()> {
        let environment = cmd.environment.clone().unwrap_or_default();

        match &cmd.image {
            Some(image) => {
                let opts = OneShotOpts {
                    image: image.clone(),
                    command: cmd.command.clone(),
                    environment,
                    network: cmd.network.clone(),
                    working_dir: cmd.working_dir.clone(),
                };
                self.docker
                    .run_one_shot(&opts, &self.sinks, actx.progress, actx.cancel)
                    .await?;
            }
            None => {
                run_host_command(
                    &cmd.command,
                    cmd.working_dir.as_deref().map(Path::new),
                    &environment,
                )
                .await?;
            }
        }
        Ok(())
    }
}
