//! Engine orchestrator
//!
//! Owns the ordered apply/destroy/import loops, the evaluation context, and
//! the state document for the lifetime of one invocation.

mod apply;
mod destroy;
mod import;

pub use import::ImportMapping;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::docker::DockerService;
use crate::error::EngineResult;
use crate::ports::PortRegistry;
use crate::process::ProcessManager;
use crate::state::State;
use crate::system::{OutputChannels, Progress};

/// Runtime inputs for one apply invocation
pub struct ApplyOptions {
    /// Path to the module root or module file.
    pub module_source: PathBuf,

    /// Caller-supplied input values.
    pub inputs: Map<String, Value>,

    /// Decoded prior state; absent on a first apply.
    pub prior_state: Option<State>,

    /// Working directory for host-side commands.
    pub work_dir: Option<PathBuf>,

    /// Ambient environment overlaid under process/exec environments.
    pub environment: BTreeMap<String, String>,

    /// Sub-status callback.
    pub progress: Progress,
}

/// What a successful apply hands back
#[derive(Debug)]
pub struct ApplyOutcome {
    pub state: State,
    pub outputs: Map<String, Value>,
}

/// The native execution engine
pub struct Engine {
    pub(crate) docker: DockerService,
    pub(crate) processes: ProcessManager,
    pub(crate) ports: PortRegistry,
    pub(crate) sinks: OutputChannels,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(docker: DockerService, config: EngineConfig) -> Self {
        Self {
            docker,
            processes: ProcessManager::new(),
            ports: PortRegistry::new(),
            sinks: OutputChannels::new(),
            config,
        }
    }

    /// Output streams; subscribe before applying to see container, build
    /// and process output.
    pub fn sinks(&self) -> &OutputChannels {
        &self.sinks
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// Refresh is a no-op by contract: recorded state is trusted and
    /// external mutation is not reconciled.
    pub async fn refresh(&self) -> EngineResult<()> {
        Ok(())
    }
}
