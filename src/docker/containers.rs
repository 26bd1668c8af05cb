//! Container creation, reuse checks and lifecycle

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::Duration;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, WaitContainerOptions,
};
use bollard::models::{
    HealthConfig, HostConfig, HostConfigLogConfig, Mount, MountTypeEnum, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use futures_util::StreamExt;
use regex::Regex;
use tracing::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::system::{OutputChannels, Progress};

use super::stream::{last_nonempty_line, short_id, MAX_FRAME_BYTES};
use super::{is_not_found, DockerError, DockerResult, DockerService};

/// Hostname the daemon maps onto the host gateway
const HOST_GATEWAY_ALIAS: &str = "host.docker.internal";

/// Everything needed to create and start one container
#[derive(Debug, Clone, Default)]
pub struct ContainerOpts {
    /// Container name; create fails on collision, so reuse checks run first.
    pub name: String,

    /// Image reference (tag or id).
    pub image: String,

    pub command: Option<Vec<String>>,

    pub entrypoint: Option<Vec<String>>,

    pub environment: BTreeMap<String, String>,

    /// Declared port mappings; `host == 0` asks for an ephemeral port.
    pub ports: Vec<PortSpec>,

    pub volumes: Vec<VolumeSpec>,

    pub network: Option<String>,

    /// Docker restart policy name (`no`, `always`, `on-failure`, `unless-stopped`).
    pub restart: Option<String>,

    pub log_driver: Option<String>,

    pub log_options: BTreeMap<String, String>,

    pub healthcheck: Option<HealthcheckOpts>,

    pub extra_hosts: Vec<String>,

    /// Rewrite standalone `localhost` in env values to the host gateway.
    pub resolve_localhost: bool,

    /// One-shot mode: attach before start and block until exit.
    pub wait: bool,

    pub working_dir: Option<String>,
}

/// One declared port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub container: u16,
    pub host: u16,
}

/// One mount: a named volume when `source` is empty, a bind mount otherwise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub source: String,
    pub path: String,
}

/// Container HEALTHCHECK configuration plus polling bounds
#[derive(Debug, Clone)]
pub struct HealthcheckOpts {
    pub command: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// Result of `run_container`
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub id: String,
    /// Combined output; populated in wait mode only.
    pub output: String,
}

/// Inspect result reduced to what applicators consume
#[derive(Debug, Clone)]
pub struct InspectedContainer {
    pub id: String,
    pub name: String,
    /// `"<port>/<proto>"` to assigned host port.
    pub ports: HashMap<String, u16>,
}

/// Rewrite standalone `localhost` to the host gateway alias.
///
/// Only `localhost` preceded by start-of-string, `/` or `@` and followed by
/// a non-word boundary is rewritten, so `app.localhost` stays untouched.
pub fn rewrite_localhost(value: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"(?P<pre>^|[/@])localhost(?P<post>$|[^0-9A-Za-z_.])")
            .expect("static pattern")
    });
    re.replace_all(value, format!("${{pre}}{}${{post}}", HOST_GATEWAY_ALIAS))
        .into_owned()
}

/// The env the container actually receives, as `K=V` pairs.
fn effective_env(opts: &ContainerOpts) -> Vec<String> {
    opts.environment
        .iter()
        .map(|(k, v)| {
            if opts.resolve_localhost {
                format!("{}={}", k, rewrite_localhost(v))
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect()
}

fn build_config(opts: &ContainerOpts) -> Config<String> {
    let env_vars = effective_env(opts);

    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &opts.ports {
        let key = format!("{}/tcp", port.container);
        exposed_ports.insert(key.clone(), HashMap::new());
        let binding = PortBinding {
            host_ip: None,
            // An empty host port asks the daemon for an ephemeral one.
            host_port: if port.host == 0 {
                Some(String::new())
            } else {
                Some(port.host.to_string())
            },
        };
        port_bindings.insert(key, Some(vec![binding]));
    }

    let mounts: Vec<Mount> = opts
        .volumes
        .iter()
        .map(|vol| {
            if vol.source.is_empty() {
                Mount {
                    target: Some(vol.path.clone()),
                    source: Some(vol.name.clone()),
                    typ: Some(MountTypeEnum::VOLUME),
                    ..Default::default()
                }
            } else {
                Mount {
                    target: Some(vol.path.clone()),
                    source: Some(vol.source.clone()),
                    typ: Some(MountTypeEnum::BIND),
                    ..Default::default()
                }
            }
        })
        .collect();

    let restart_policy = opts.restart.as_deref().map(|name| {
        let name = match name {
            "always" => RestartPolicyNameEnum::ALWAYS,
            "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
            "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
            _ => RestartPolicyNameEnum::NO,
        };
        RestartPolicy {
            name: Some(name),
            ..Default::default()
        }
    });

    let log_config = opts.log_driver.as_ref().map(|driver| HostConfigLogConfig {
        typ: Some(driver.clone()),
        config: if opts.log_options.is_empty() {
            None
        } else {
            Some(
                opts.log_options
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        },
    });

    let mut extra_hosts = opts.extra_hosts.clone();
    if opts.resolve_localhost {
        let gateway_entry = format!("{}:host-gateway", HOST_GATEWAY_ALIAS);
        if !extra_hosts.contains(&gateway_entry) {
            extra_hosts.push(gateway_entry);
        }
    }

    let healthcheck = opts.healthcheck.as_ref().map(|hc| {
        let mut test = hc.command.clone();
        let already_tagged = matches!(test.first().map(String::as_str), Some("CMD") | Some("CMD-SHELL") | Some("NONE"));
        if !already_tagged {
            test.insert(0, "CMD".to_string());
        }
        HealthConfig {
            test: Some(test),
            interval: Some(hc.interval.as_nanos() as i64),
            timeout: Some(hc.timeout.as_nanos() as i64),
            retries: Some(hc.retries as i64),
            start_period: Some(hc.start_period.as_nanos() as i64),
            ..Default::default()
        }
    });

    let host_config = HostConfig {
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        mounts: if mounts.is_empty() { None } else { Some(mounts) },
        network_mode: opts.network.clone(),
        restart_policy,
        log_config,
        extra_hosts: if extra_hosts.is_empty() {
            None
        } else {
            Some(extra_hosts)
        },
        ..Default::default()
    };

    Config {
        image: Some(opts.image.clone()),
        cmd: opts.command.clone(),
        entrypoint: opts.entrypoint.clone(),
        env: Some(env_vars),
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        working_dir: opts.working_dir.clone(),
        healthcheck,
        host_config: Some(host_config),
        ..Default::default()
    }
}

impl DockerService {
    /// Create and start a container.
    ///
    /// In wait mode the adapter attaches before start so no output is lost,
    /// then blocks until the container exits; a non-zero code is an error
    /// carrying the combined output.
    pub async fn run_container(
        &self,
        opts: &ContainerOpts,
        sinks: &OutputChannels,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> DockerResult<RunOutcome> {
        self.ensure_image(&opts.image, progress, cancel).await?;

        let config = build_config(opts);
        let create_options = CreateContainerOptions {
            name: opts.name.as_str(),
            platform: None,
        };

        let created = self
            .client()
            .create_container(Some(create_options), config)
            .await?;
        let id = created.id;
        debug!("Created container {} ({})", opts.name, short_id(&id));

        // Attach BEFORE starting so early output is captured.
        let mut attached = None;
        if opts.wait {
            let attach_options = AttachContainerOptions::<String> {
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                ..Default::default()
            };
            let AttachContainerResults { output, .. } = match self
                .client()
                .attach_container(&id, Some(attach_options))
                .await
            {
                Ok(results) => results,
                Err(e) => {
                    let _ = self.remove_container(&id).await;
                    return Err(DockerError::Docker(e));
                }
            };
            attached = Some(output);
        }

        if let Err(e) = self.client().start_container::<String>(&id, None).await {
            let _ = self.remove_container(&id).await;
            return Err(DockerError::Docker(e));
        }
        info!("Started container {} ({})", opts.name, short_id(&id));

        if let Some(hc) = &opts.healthcheck {
            if let Err(e) = self.wait_healthy(&id, hc, progress, cancel).await {
                let _ = self.remove_container(&id).await;
                return Err(e);
            }
        }

        if !opts.wait {
            return Ok(RunOutcome {
                id,
                output: String::new(),
            });
        }

        let Some(mut output_stream) = attached else {
            let _ = self.remove_container(&id).await;
            return Err(DockerError::Other("attach stream missing".into()));
        };
        let sinks = sinks.clone();
        let progress_cb = progress.clone();
        let collector = tokio::spawn(async move {
            let mut combined = String::new();
            while let Some(frame) = output_stream.next().await {
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
        let mut wait_stream = self.client().wait_container(&id, Some(wait_options));

        let exit_code = loop {
            let item = tokio::select! {
                item = wait_stream.next() => item,
                _ = cancel.cancelled() => {
                    collector.abort();
                    let _ = self.remove_container(&id).await;
                    return Err(DockerError::Cancelled);
                }
            };
            match item {
                Some(Ok(response)) => break response.status_code,
                // The wait endpoint reports a non-zero exit as an error that
                // still carries the status code.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    break code
                }
                Some(Err(e)) => {
                    collector.abort();
                    let _ = self.remove_container(&id).await;
                    return Err(DockerError::Docker(e));
                }
                None => {
                    collector.abort();
                    let _ = self.remove_container(&id).await;
                    return Err(DockerError::Other("wait stream ended unexpectedly".into()));
                }
            }
        };

        let output = collector.await.unwrap_or_default();

        if exit_code != 0 {
            let _ = self.remove_container(&id).await;
            return Err(DockerError::NonZeroExit {
                code: exit_code,
                output,
            });
        }

        Ok(RunOutcome { id, output })
    }

    /// Reduced inspect: id, name and assigned host ports.
    pub async fn inspect_container_info(&self, id: &str) -> DockerResult<InspectedContainer> {
        let inspect = self.client().inspect_container(id, None).await?;

        let resolved_id = inspect.id.clone().unwrap_or_else(|| id.to_string());
        let name = inspect
            .name
            .clone()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let mut ports = HashMap::new();
        if let Some(settings) = &inspect.network_settings {
            if let Some(port_map) = &settings.ports {
                for (key, bindings) in port_map {
                    let Some(bindings) = bindings else { continue };
                    let Some(first) = bindings.first() else {
                        continue;
                    };
                    if let Some(host_port) = first.host_port.as_deref() {
                        if let Ok(port) = host_port.parse::<u16>() {
                            ports.insert(key.clone(), port);
                        }
                    }
                }
            }
        }

        Ok(InspectedContainer {
            id: resolved_id,
            name,
            ports,
        })
    }

    /// Whether the container exists and is currently running.
    pub async fn is_container_running(&self, id: &str) -> DockerResult<bool> {
        match self.client().inspect_container(id, None).await {
            Ok(inspect) => Ok(inspect
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(DockerError::Docker(e)),
        }
    }

    /// Whether the running container still matches the desired config.
    ///
    /// Compares image ids (the desired tag is resolved first), requires every
    /// desired env var to be present with the same value, and checks network
    /// membership. Port mappings are deliberately excluded because ephemeral
    /// assignments differ run to run.
    pub async fn container_matches_config(
        &self,
        id: &str,
        opts: &ContainerOpts,
    ) -> DockerResult<bool> {
        let inspect = match self.client().inspect_container(id, None).await {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => return Err(DockerError::Docker(e)),
        };

        let Some(desired_image) = self.resolve_image_id(&opts.image).await? else {
            return Ok(false);
        };
        if inspect.image.as_deref() != Some(desired_image.as_str()) {
            debug!(
                "Container {} image drifted from {}",
                short_id(id),
                opts.image
            );
            return Ok(false);
        }

        let current_env: Vec<String> = inspect
            .config
            .as_ref()
            .and_then(|c| c.env.clone())
            .unwrap_or_default();
        for pair in effective_env(opts) {
            if !current_env.contains(&pair) {
                debug!("Container {} env drifted ({})", short_id(id), pair);
                return Ok(false);
            }
        }

        if let Some(network) = &opts.network {
            let in_network = inspect
                .network_settings
                .as_ref()
                .and_then(|s| s.networks.as_ref())
                .map(|networks| networks.contains_key(network))
                .unwrap_or(false);
            let as_mode = inspect
                .host_config
                .as_ref()
                .and_then(|hc| hc.network_mode.as_deref())
                == Some(network.as_str());
            if !in_network && !as_mode {
                debug!("Container {} left network {}", short_id(id), network);
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Container id for `name`, or `None` when no such container exists.
    pub async fn get_container_by_name(&self, name: &str) -> DockerResult<Option<String>> {
        match self.client().inspect_container(name, None).await {
            Ok(inspect) => Ok(inspect.id),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(DockerError::Docker(e)),
        }
    }

    /// Force-remove a container; missing containers are fine.
    pub async fn remove_container(&self, id: &str) -> DockerResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client().remove_container(id, Some(options)).await {
            Ok(_) => {
                info!("Removed container {}", short_id(id));
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!("Container {} already gone", short_id(id));
                Ok(())
            }
            Err(e) => {
                warn!("Failed to remove container {}: {}", short_id(id), e);
                Err(DockerError::Docker(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_localhost_standalone() {
        assert_eq!(
            rewrite_localhost("http://localhost:3000/"),
            "http://host.docker.internal:3000/"
        );
        assert_eq!(rewrite_localhost("localhost"), "host.docker.internal");
        assert_eq!(
            rewrite_localhost("postgres://user@localhost:5432/db"),
            "postgres://user@host.docker.internal:5432/db"
        );
    }

    #[test]
    fn test_rewrite_localhost_preserves_subdomains() {
        assert_eq!(rewrite_localhost("http://app.localhost/"), "http://app.localhost/");
        assert_eq!(rewrite_localhost("api.localhost:80"), "api.localhost:80");
        assert_eq!(
            rewrite_localhost("http://localhost.example.com/"),
            "http://localhost.example.com/"
        );
    }

    #[test]
    fn test_effective_env_rewrites_only_when_asked() {
        let mut opts = ContainerOpts {
            resolve_localhost: true,
            ..Default::default()
        };
        opts.environment
            .insert("DB_URL".into(), "postgres://localhost:5432/db".into());

        let env = effective_env(&opts);
        assert_eq!(env, vec!["DB_URL=postgres://host.docker.internal:5432/db"]);

        opts.resolve_localhost = false;
        let env = effective_env(&opts);
        assert_eq!(env, vec!["DB_URL=postgres://localhost:5432/db"]);
    }

    #[test]
    fn test_build_config_shapes_ports_and_gateway() {
        let opts = ContainerOpts {
            name: "api".into(),
            image: "api:latest".into(),
            ports: vec![PortSpec {
                container: 3000,
                host: 0,
            }],
            resolve_localhost: true,
            ..Default::default()
        };

        let config = build_config(&opts);
        let host_config = config.host_config.unwrap();

        let bindings = host_config.port_bindings.unwrap();
        let binding = bindings["3000/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some(""));

        let extra_hosts = host_config.extra_hosts.unwrap();
        assert_eq!(extra_hosts, vec!["host.docker.internal:host-gateway"]);
    }

    #[test]
    fn test_build_config_healthcheck_gets_cmd_tag() {
        let opts = ContainerOpts {
            name: "db".into(),
            image: "postgres:16".into(),
            healthcheck: Some(HealthcheckOpts {
                command: vec!["pg_isready".into(), "-U".into(), "app".into()],
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(5),
                retries: 3,
                start_period: Duration::from_secs(0),
            }),
            ..Default::default()
        };

        let config = build_config(&opts);
        let hc = config.healthcheck.unwrap();
        assert_eq!(
            hc.test.unwrap(),
            vec!["CMD", "pg_isready", "-U", "app"]
        );
        assert_eq!(hc.interval, Some(1_000_000_000));
        assert_eq!(hc.retries, Some(3));
    }

    #[test]
    fn test_volume_spec_mount_type() {
        let opts = ContainerOpts {
            name: "data".into(),
            image: "img".into(),
            volumes: vec![
                VolumeSpec {
                    name: "pgdata".into(),
                    source: String::new(),
                    path: "/var/lib/postgresql/data".into(),
                },
                VolumeSpec {
                    name: "conf".into(),
                    source: "/etc/app".into(),
                    path: "/app/conf".into(),
                },
            ],
            ..Default::default()
        };

        let config = build_config(&opts);
        let mounts = config.host_config.unwrap().mounts.unwrap();
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mounts[0].source.as_deref(), Some("pgdata"));
        assert_eq!(mounts[1].typ, Some(MountTypeEnum::BIND));
    }
}
