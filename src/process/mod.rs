//! Host process management
//!
//! Launches module-declared subprocesses in their own process groups, tees
//! their output, gates on readiness probes and tears whole descendant trees
//! down with SIGTERM then SIGKILL.

mod manager;
mod readiness;

pub use manager::{free_port, ProcessExit, ProcessInfo, ProcessManager, ProcessSpec};
pub use readiness::ReadinessCheck;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tracing::debug;

/// Errors raised by process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid readiness check type: {0} (expected http or tcp)")]
    InvalidReadiness(String),

    #[error("Readiness check for {name} timed out after {seconds}s")]
    ReadinessTimeout { name: String, seconds: u64 },

    #[error("process exited unexpectedly during readiness check: {name} exited with code {code}")]
    ExitedDuringReadiness { name: String, code: i32 },

    #[error("Command exited with code {code}\n{output}")]
    CommandFailed { code: i32, output: String },

    #[error("Operation cancelled")]
    Cancelled,
}

pub type ProcessResult<T> = Result<T, ProcessError>;

/// Run a command on the host and return its combined stdout/stderr.
///
/// Used by host-mode exec resources and persisted destroy commands.
pub async fn run_host_command(
    command: &[String],
    working_dir: Option<&Path>,
    environment: &BTreeMap<String, String>,
) -> ProcessResult<String> {
    let (program, args) = command.split_first().ok_or(ProcessError::EmptyCommand)?;

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .envs(environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    debug!("Running host command: {}", command.join(" "));
    let result = cmd.output().await.map_err(|source| ProcessError::Spawn {
        name: program.clone(),
        source,
    })?;

    let mut output = String::from_utf8_lossy(&result.stdout).to_string();
    output.push_str(&String::from_utf8_lossy(&result.stderr));

    if !result.status.success() {
        return Err(ProcessError::CommandFailed {
            code: result.status.code().unwrap_or(-1),
            output,
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_host_command_combines_output() {
        let output = run_host_command(
            &["sh".into(), "-c".into(), "echo out; echo err >&2".into()],
            None,
            &BTreeMap::new(),
        )
        .await
        .unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn test_run_host_command_nonzero_exit() {
        let err = run_host_command(
            &["sh".into(), "-c".into(), "echo boom; exit 3".into()],
            None,
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
        match err {
            ProcessError::CommandFailed { code, output } => {
                assert_eq!(code, 3);
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_host_command_empty() {
        let err = run_host_command(&[], None, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ProcessError::EmptyCommand));
    }
}
