//! Declarative module documents (inputs, resources, outputs)

mod loader;
mod types;

pub use loader::{load_module, resolve_inputs};
pub use types::{
    DestroySpec, InputDefinition, Module, OutputDefinition, ResourceDefinition, ResourceType,
};

use thiserror::Error;

/// Errors raised while loading or validating a module document
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Module not found at {0}")]
    NotFound(String),

    #[error("Failed to read module: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse module YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unrecognized plugin tag: {0}")]
    InvalidPlugin(String),

    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),
}

pub type ModuleResult<T> = Result<T, ModuleError>;
