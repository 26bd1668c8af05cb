//! Health-gated startup polling

use bollard::container::LogsOptions;
use bollard::models::HealthStatusEnum;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::system::Progress;

use super::containers::HealthcheckOpts;
use super::stream::short_id;
use super::{DockerError, DockerResult, DockerService};

/// Log lines captured for operator triage when a health gate fails
const LOG_TAIL_LINES: &str = "20";

impl DockerService {
    /// Block until the container reports healthy.
    ///
    /// `starting` keeps waiting, `healthy` returns, `unhealthy` aborts with
    /// the last probe output and a log tail. A container that exits during
    /// polling aborts immediately with its exit code.
    pub(crate) async fn wait_healthy(
        &self,
        id: &str,
        hc: &HealthcheckOpts,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> DockerResult<()> {
        if !hc.start_period.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(hc.start_period) => {}
                _ = cancel.cancelled() => return Err(DockerError::Cancelled),
            }
        }

        for attempt in 1..=hc.retries {
            tokio::select! {
                _ = tokio::time::sleep(hc.interval) => {}
                _ = cancel.cancelled() => return Err(DockerError::Cancelled),
            }

            progress.emit(&format!("health check {}/{}", attempt, hc.retries));

            let inspect = self.client().inspect_container(id, None).await?;
            let state = inspect.state.as_ref();

            let running = state.and_then(|s| s.running).unwrap_or(false);
            if !running {
                let code = state.and_then(|s| s.exit_code).unwrap_or(-1);
                let log_tail = self.log_tail(id).await;
                return Err(DockerError::ExitedDuringHealthCheck {
                    id: short_id(id).to_string(),
                    code,
                    log_tail,
                });
            }

            let health = state.and_then(|s| s.health.as_ref());
            let status = health.and_then(|h| h.status);

            match status {
                Some(HealthStatusEnum::HEALTHY) => {
                    debug!("Container {} healthy after {} checks", short_id(id), attempt);
                    return Ok(());
                }
                Some(HealthStatusEnum::UNHEALTHY) => {
                    let probe = health
                        .and_then(|h| h.log.as_ref())
                        .and_then(|log| log.last())
                        .and_then(|entry| entry.output.clone())
                        .unwrap_or_default();
                    let log_tail = self.log_tail(id).await;
                    return Err(DockerError::Unhealthy {
                        id: short_id(id).to_string(),
                        probe,
                        log_tail,
                    });
                }
                // STARTING, NONE or absent health data: keep waiting.
                _ => {}
            }
        }

        Err(DockerError::HealthTimeout(short_id(id).to_string()))
    }

    /// Tail of the container's stdout/stderr, best-effort.
    pub(crate) async fn log_tail(&self, id: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: LOG_TAIL_LINES.to_string(),
            ..Default::default()
        };

        let mut stream = self.client().logs(id, Some(options));
        let mut tail = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => tail.push_str(&String::from_utf8_lossy(&frame.into_bytes())),
                Err(e) => {
                    warn!("Failed to read log tail for {}: {}", short_id(id), e);
                    break;
                }
            }
        }
        tail
    }
}
