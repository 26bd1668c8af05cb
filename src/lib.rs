//! cldctl native execution engine
//!
//! Turns a declarative module (inputs, resources, outputs) into running
//! Docker containers, host processes and cryptographic artifacts, and
//! persists a state document sufficient to reuse or tear down what it made.

pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod expr;
pub mod module;
pub mod ports;
pub mod process;
pub mod resources;
pub mod state;
pub mod system;

// Re-export the surface most callers need
pub use config::EngineConfig;
pub use engine::{ApplyOptions, ApplyOutcome, Engine, ImportMapping};
pub use error::{EngineError, EngineResult};
pub use state::State;
pub use system::Progress;
