use thiserror::Error;

use crate::docker::DockerError;
use crate::expr::ExprError;
use crate::module::ModuleError;
use crate::process::ProcessError;
use crate::resources::CryptoError;
use crate::state::StateError;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Decoration added by the orchestrator before surfacing.
    #[error("resource {name}: {source}")]
    Resource {
        name: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Invalid properties for {resource}: {reason}")]
    InvalidProperties { resource: String, reason: String },

    #[error("Cannot infer a resource type for import address {0}")]
    UnknownImport(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Wrap with the owning resource's name.
    pub fn for_resource(self, name: &str) -> Self {
        EngineError::Resource {
            name: name.to_string(),
            source: Box::new(self),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
