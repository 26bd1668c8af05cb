//! One-shot task containers
//!
//! Runs a single command in a disposable container: attach before start,
//! stream output, wait for exit, then remove the container regardless of
//! outcome.

use std::collections::BTreeMap;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    WaitContainerOptions,
};
use bollard::models::HostConfig;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::system::{OutputChannels, Progress};

use super::stream::{last_nonempty_line, MAX_FRAME_BYTES};
use super::{DockerError, DockerResult, DockerService};

/// Inputs for a one-shot container run
#[derive(Debug, Clone, Default)]
pub struct OneShotOpts {
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub network: Option<String>,
    pub working_dir: Option<String>,
}

impl DockerService {
    /// Run a command in a single-use container and return its combined
    /// output. A non-zero exit surfaces as an error carrying the code.
    pub async fn run_one_shot(
        &self,
        opts: &OneShotOpts,
        sinks: &OutputChannels,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> DockerResult<String> {
        self.ensure_image(&opts.image, progress, cancel).await?;

        let name = format!("cldctl-task-{}", &Uuid::new_v4().to_string()[..8]);

        let env_vars: Vec<String> = opts
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(opts.image.clone()),
            cmd: Some(opts.command.clone()),
            env: Some(env_vars),
            working_dir: opts.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                network_mode: opts.network.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let created = self
            .client()
            .create_container(Some(create_options), config)
            .await?;
        let id = created.id;
        debug!("Created task container {}", name);

        let run = self
            .run_to_completion(&id, sinks, progress, cancel)
            .await;

        // The container is disposable either way.
        let _ = self.remove_container(&id).await;

        match run {
            Ok((0, output)) => Ok(output),
            Ok((code, output)) => Err(DockerError::NonZeroExit { code, output }),
            Err(e) => Err(e),
        }
    }

    async fn run_to_completion(
        &self,
        id: &str,
        sinks: &OutputChannels,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> DockerResult<(i64, String)> {
        let attach_options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { mut output, .. } = self
            .client()
            .attach_container(id, Some(attach_options))
            .await?;

        self.client().start_container::<String>(id, None).await?;
        info!("Started task container {}", id);

        let sinks = sinks.clone();
        let progress_cb = progress.clone();
        let collector = tokio::spawn(async move {
            let mut combined = String::new();
            while let Some(frame) = output.next().await {
                let Ok(frame) = frame else { break };
                let is_err = matches!(frame, LogOutput::StdErr { .. });
                let bytes = frame.into_bytes();
                if bytes.is_empty() || bytes.len() > MAX_FRAME_BYTES {
                    continue;
                }
                combined.push_str(&String::from_utf8_lossy(&bytes));
                if is_err {
                    sinks.stderr.push(bytes.to_vec());
                } else {
                    sinks.stdout.push(bytes.to_vec());
                }
                if let Some(line) = last_nonempty_line(&bytes) {
                    progress_cb.emit(&line);
                }
            }
            combined
        });

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.client().wait_container(id, Some(wait_options));

        let exit_code = loop {
            let item = tokio::select! {
                item = wait_stream.next() => item,
                _ = cancel.cancelled() => {
                    collector.abort();
                    return Err(DockerError::Cancelled);
                }
            };
            match item {
                Some(Ok(response)) => break response.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    break code
                }
                Some(Err(e)) => {
                    collector.abort();
                    return Err(DockerError::Docker(e));
                }
                None => {
                    collector.abort();
                    return Err(DockerError::Other("wait stream ended unexpectedly".into()));
                }
            }
        };

        let output = collector.await.unwrap_or_default();
        Ok((exit_code, output))
    }
}
