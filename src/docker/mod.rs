//! Docker daemon adapter
//!
//! A thin contract over the daemon: image pull with progress, container
//! create/start/inspect/remove, network and volume CRUD, image builds, and
//! one-shot task containers. Applicators never talk to bollard directly.

mod build;
mod containers;
mod health;
mod images;
mod networks;
mod oneshot;
mod stream;
mod volumes;

pub use build::{BuildOptions, BuildOutcome};
pub use containers::{
    rewrite_localhost, ContainerOpts, HealthcheckOpts, InspectedContainer, PortSpec, RunOutcome,
    VolumeSpec,
};
pub use oneshot::OneShotOpts;

use std::sync::Arc;

use bollard::Docker;
use thiserror::Error;

/// Errors raised by daemon operations
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Build timed out after {0:?}")]
    BuildTimeout(std::time::Duration),

    #[error("Container {id} became unhealthy: {probe}\n--- log tail ---\n{log_tail}")]
    Unhealthy {
        id: String,
        probe: String,
        log_tail: String,
    },

    #[error("Container {id} exited with code {code} during health check\n--- log tail ---\n{log_tail}")]
    ExitedDuringHealthCheck {
        id: String,
        code: i64,
        log_tail: String,
    },

    #[error("Health check timed out for container {0}")]
    HealthTimeout(String),

    #[error("Command exited with code {code}\n{output}")]
    NonZeroExit { code: i64, output: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type DockerResult<T> = Result<T, DockerError>;

/// Shared handle to the Docker daemon
#[derive(Clone)]
pub struct DockerService {
    client: Arc<Docker>,
}

impl DockerService {
    /// Connect using the ambient daemon configuration.
    pub fn new() -> DockerResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(DockerError::Docker)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Connect to an explicit unix socket.
    pub fn with_socket(socket_path: &str) -> DockerResult<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(DockerError::Docker)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn client(&self) -> &Docker {
        &self.client
    }

    pub async fn ping(&self) -> DockerResult<()> {
        self.client.ping().await.map_err(DockerError::Docker)?;
        Ok(())
    }
}

/// True when the daemon answered 404 for the referenced object.
pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
