//! Readiness probes for managed processes

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::manager::ProcessExit;
use super::{ProcessError, ProcessResult};

/// Per-attempt dial timeout for tcp probes
const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-request timeout for http probes; generous because a service may be
/// busy warming up when it first answers.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a process proves it is ready
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    /// `http` or `tcp`.
    pub kind: String,
    /// URL for http, `host:port` for tcp.
    pub endpoint: String,
    pub interval: Duration,
    pub timeout: Duration,
}

/// Poll until the endpoint answers, the process exits, the deadline expires
/// or the caller cancels.
pub(crate) async fn wait_ready(
    check: &ReadinessCheck,
    name: &str,
    mut done: watch::Receiver<Option<ProcessExit>>,
    cancel: &CancellationToken,
) -> ProcessResult<()> {
    let http_client = match check.kind.as_str() {
        "tcp" => None,
        "http" => Some(
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(HTTP_REQUEST_TIMEOUT)
                .build()
                .map_err(|e| ProcessError::InvalidReadiness(e.to_string()))?,
        ),
        other => return Err(ProcessError::InvalidReadiness(other.to_string())),
    };

    let deadline = tokio::time::Instant::now() + check.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        debug!(
            "Readiness attempt {} for {} against {}",
            attempt, name, check.endpoint
        );

        let ready = match &http_client {
            Some(client) => probe_http(client, &check.endpoint).await,
            None => probe_tcp(&check.endpoint).await,
        };
        if ready {
            debug!("Process {} ready after {} attempts", name, attempt);
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(ProcessError::ReadinessTimeout {
                name: name.to_string(),
                seconds: check.timeout.as_secs(),
            });
        }

        // While waiting for the next attempt, watch for the process dying
        // underneath us so we fail fast with its exit status.
        tokio::select! {
            _ = tokio::time::sleep(check.interval) => {}
            changed = done.changed() => {
                let exit = match changed {
                    Ok(()) => *done.borrow(),
                    // Sender dropped: the wait task is gone, treat as exited.
                    Err(_) => Some(ProcessExit { code: -1, success: false }),
                };
                if let Some(exit) = exit {
                    return Err(ProcessError::ExitedDuringReadiness {
                        name: name.to_string(),
                        code: exit.code,
                    });
                }
            }
            _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
        }
    }
}

/// Any HTTP response is liveness enough, including 3xx/4xx/5xx.
async fn probe_http(client: &reqwest::Client, endpoint: &str) -> bool {
    client.get(endpoint).send().await.is_ok()
}

async fn probe_tcp(endpoint: &str) -> bool {
    let address = endpoint
        .strip_prefix("tcp://")
        .unwrap_or(endpoint)
        .to_string();
    matches!(
        tokio::time::timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::OutputChannels;
    use crate::process::{ProcessManager, ProcessSpec};
    use std::collections::BTreeMap;

    fn check(kind: &str, endpoint: String) -> ReadinessCheck {
        ReadinessCheck {
            kind: kind.to_string(),
            endpoint,
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_tcp_readiness_succeeds_against_listener() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = ProcessManager::new();
        let sinks = OutputChannels::new();
        let cancel = CancellationToken::new();

        let spec = ProcessSpec {
            name: "tcp-ready".into(),
            command: vec!["sleep".into(), "10".into()],
            working_dir: None,
            environment: BTreeMap::new(),
            readiness: Some(check("tcp", format!("127.0.0.1:{}", port))),
        };

        manager.start(spec, &sinks, &cancel).await.unwrap();
        manager.stop("tcp-ready", Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_during_readiness_reports_code() {
        let manager = ProcessManager::new();
        let sinks = OutputChannels::new();
        let cancel = CancellationToken::new();

        // Nothing ever listens on the endpoint and the process dies quickly.
        let spec = ProcessSpec {
            name: "crasher".into(),
            command: vec!["sh".into(), "-c".into(), "sleep 0.2; exit 1".into()],
            working_dir: None,
            environment: BTreeMap::new(),
            readiness: Some(check("tcp", "127.0.0.1:1".into())),
        };

        let err = manager.start(spec, &sinks, &cancel).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("process exited unexpectedly during readiness check"));
        match err {
            ProcessError::ExitedDuringReadiness { code, .. } => assert_eq!(code, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_readiness_kind() {
        let manager = ProcessManager::new();
        let sinks = OutputChannels::new();
        let cancel = CancellationToken::new();

        let spec = ProcessSpec {
            name: "bad-kind".into(),
            command: vec!["sleep".into(), "5".into()],
            working_dir: None,
            environment: BTreeMap::new(),
            readiness: Some(check("icmp", "127.0.0.1:1".into())),
        };

        let err = manager.start(spec, &sinks, &cancel).await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidReadiness(_)));
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let manager = ProcessManager::new();
        let sinks = OutputChannels::new();
        let cancel = CancellationToken::new();

        let spec = ProcessSpec {
            name: "never-ready".into(),
            command: vec!["sleep".into(), "10".into()],
            working_dir: None,
            environment: BTreeMap::new(),
            readiness: Some(ReadinessCheck {
                kind: "tcp".into(),
                endpoint: "127.0.0.1:1".into(),
                interval: Duration::from_millis(50),
                timeout: Duration::from_millis(400),
            }),
        };

        let err = manager.start(spec, &sinks, &cancel).await.unwrap_err();
        assert!(matches!(err, ProcessError::ReadinessTimeout { .. }));
        // The failed process must have been stopped best-effort.
        assert!(!manager.is_alive("never-ready"));
    }
}
