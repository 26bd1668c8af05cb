//! Process registry: start, stop, prefix-scoped teardown

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::system::{OutputChannels, SinkPool};

use super::readiness::{self, ReadinessCheck};
use super::{ProcessError, ProcessResult};

/// Grace period for the best-effort stop after a failed readiness check
const READINESS_FAILURE_STOP_GRACE: Duration = Duration::from_secs(2);

/// What to launch and how to know it is ready
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Overlaid on the ambient environment.
    pub environment: BTreeMap<String, String>,
    pub readiness: Option<ReadinessCheck>,
}

/// Recorded facts about a launched process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

/// Terminal status of a managed process
#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    pub code: i32,
    pub success: bool,
}

struct ProcessEntry {
    info: ProcessInfo,
    done: watch::Receiver<Option<ProcessExit>>,
}

/// Registry of managed host processes, keyed by name
#[derive(Default)]
pub struct ProcessManager {
    entries: Arc<RwLock<HashMap<String, ProcessEntry>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a registered process with this name is still alive.
    pub fn is_alive(&self, name: &str) -> bool {
        self.entries
            .read()
            .get(name)
            .map(|entry| process_alive(entry.info.pid))
            .unwrap_or(false)
    }

    /// Start a process, or return the existing registration when one with
    /// the same name is already alive.
    ///
    /// The subprocess is placed in its own process group so a later stop can
    /// signal the entire descendant tree. When a readiness check is supplied
    /// the registry lock is released while polling, and a failed check stops
    /// the process best-effort before returning the error.
    pub async fn start(
        &self,
        spec: ProcessSpec,
        sinks: &OutputChannels,
        cancel: &CancellationToken,
    ) -> ProcessResult<ProcessInfo> {
        let (info, done) = {
            let mut entries = self.entries.write();

            if let Some(entry) = entries.get(&spec.name) {
                if process_alive(entry.info.pid) {
                    debug!("Process {} already running (pid {})", spec.name, entry.info.pid);
                    return Ok(entry.info.clone());
                }
                entries.remove(&spec.name);
            }

            let (program, args) = spec
                .command
                .split_first()
                .ok_or(ProcessError::EmptyCommand)?;

            let mut cmd = tokio::process::Command::new(program);
            cmd.args(args)
                .envs(&spec.environment)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            if let Some(dir) = &spec.working_dir {
                cmd.current_dir(dir);
            }
            // Own process group, so stop() can signal the whole tree.
            #[cfg(unix)]
            cmd.process_group(0);

            let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
                name: spec.name.clone(),
                source,
            })?;
            let pid = child.id().ok_or_else(|| ProcessError::Spawn {
                name: spec.name.clone(),
                source: std::io::Error::other("process exited before pid was read"),
            })?;
            info!("Started process {} (pid {})", spec.name, pid);

            if let Some(stdout) = child.stdout.take() {
                tee_lines(stdout, sinks.stdout.clone(), format!("[{}] ", spec.name));
            }
            if let Some(stderr) = child.stderr.take() {
                tee_lines(
                    stderr,
                    sinks.stderr.clone(),
                    format!("[{}] [ERROR] ", spec.name),
                );
            }

            let (done_tx, done_rx) = watch::channel(None);
            let name = spec.name.clone();
            tokio::spawn(async move {
                let exit = match child.wait().await {
                    Ok(status) => ProcessExit {
                        code: status.code().unwrap_or(-1),
                        success: status.success(),
                    },
                    Err(e) => {
                        warn!("Failed to wait on process {}: {}", name, e);
                        ProcessExit {
                            code: -1,
                            success: false,
                        }
                    }
                };
                debug!("Process {} exited with code {}", name, exit.code);
                let _ = done_tx.send(Some(exit));
            });

            let info = ProcessInfo {
                name: spec.name.clone(),
                pid,
                command: spec.command.clone(),
                environment: spec.environment.clone(),
            };
            entries.insert(
                spec.name.clone(),
                ProcessEntry {
                    info: info.clone(),
                    done: done_rx.clone(),
                },
            );
            (info, done_rx)
        };

        // Lock released: readiness polling can take a while and other
        // start/stop calls must be able to proceed.
        if let Some(check) = &spec.readiness {
            if let Err(e) = readiness::wait_ready(check, &spec.name, done, cancel).await {
                warn!("Readiness check failed for {}: {}", spec.name, e);
                let _ = self.stop(&spec.name, READINESS_FAILURE_STOP_GRACE).await;
                return Err(e);
            }
        }

        Ok(info)
    }

    /// Stop a process by name: SIGTERM to the group, then SIGKILL on expiry.
    /// Missing entries are ignored; the entry is removed either way.
    pub async fn stop(&self, name: &str, timeout: Duration) -> ProcessResult<()> {
        let entry = self.entries.write().remove(name);
        let Some(entry) = entry else {
            debug!("No process registered as {}, nothing to stop", name);
            return Ok(());
        };

        let pid = Pid::from_raw(entry.info.pid as i32);
        info!("Stopping process {} (pid {})", name, entry.info.pid);

        // The process leads its own group; signal the group.
        if let Err(e) = signal::killpg(pid, Signal::SIGTERM) {
            debug!("SIGTERM to group {} failed: {}", entry.info.pid, e);
        }

        let mut done = entry.done;
        let finished = tokio::time::timeout(timeout, done.wait_for(|exit| exit.is_some())).await;
        if finished.is_err() {
            warn!("Process {} ignored SIGTERM, killing group", name);
            if let Err(e) = signal::killpg(pid, Signal::SIGKILL) {
                debug!("SIGKILL to group {} failed: {}", entry.info.pid, e);
            }
        }

        Ok(())
    }

    /// Stop every process whose name starts with `prefix`.
    pub async fn stop_all_with_prefix(&self, prefix: &str, timeout: Duration) -> ProcessResult<()> {
        // Collect names under the read lock, then stop without holding it so
        // stop() can take its own write lock.
        let names: Vec<String> = {
            let entries = self.entries.read();
            entries
                .keys()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect()
        };

        for name in names {
            self.stop(&name, timeout).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn registered_names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

/// Liveness probe: signal 0 succeeds only for a running process we may signal.
fn process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Tee a child stream line-by-line into a sink with the given prefix.
fn tee_lines<R>(reader: R, sink: SinkPool, prefix: String)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.push_line(&format!("{}{}", prefix, line));
        }
    });
}

/// Bind port 0 on loopback and read back the assignment, yielding a port
/// that was free at bind time. Used for `PORT=auto` expansion.
pub fn free_port() -> ProcessResult<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
