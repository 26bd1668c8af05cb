//! CLI command handlers

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cldctl_engine::engine::ApplyOptions;
use cldctl_engine::docker::DockerService;
use cldctl_engine::state::State;
use cldctl_engine::system::OutputChannels;
use cldctl_engine::{Engine, EngineConfig, ImportMapping, Progress};

#[derive(Subcommand)]
pub enum Commands {
    /// Apply a module and write the resulting state
    Apply {
        /// Module root or module file
        #[arg(short, long)]
        module: PathBuf,

        /// State file to read and update
        #[arg(short, long, default_value = "state.json")]
        state: PathBuf,

        /// JSON file of input values
        #[arg(short, long)]
        inputs: Option<PathBuf>,

        /// Working directory for host-side commands
        #[arg(short, long)]
        workdir: Option<PathBuf>,
    },

    /// Destroy everything a state file records
    Destroy {
        #[arg(short, long, default_value = "state.json")]
        state: PathBuf,
    },

    /// Import existing Docker objects into state
    Import {
        #[arg(short, long, default_value = "state.json")]
        state: PathBuf,

        /// JSON file with a list of {address, id} pairs
        #[arg(short, long)]
        mappings: PathBuf,
    },
}

pub async fn run(command: Commands) -> Result<()> {
    let engine = Engine::new(
        DockerService::new().context("Failed to connect to Docker")?,
        EngineConfig::from_env(),
    );

    drain_sinks(engine.sinks());

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            cancel_on_signal.cancel();
        }
    });

    let progress = Progress::new(|message| {
        eprintln!("  -> {}", message);
    });

    match command {
        Commands::Apply {
            module,
            state,
            inputs,
            workdir,
        } => {
            let prior_state = read_state(&state)?;
            let input_values = match inputs {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read inputs from {}", path.display()))?;
                    serde_json::from_str::<Map<String, Value>>(&raw)
                        .context("Inputs file must be a JSON object")?
                }
                None => Map::new(),
            };

            let options = ApplyOptions {
                module_source: module,
                inputs: input_values,
                prior_state,
                work_dir: workdir,
                environment: BTreeMap::new(),
                progress,
            };

            match engine.apply(options, cancel).await {
                Ok(outcome) => {
                    write_state(&state, &outcome.state)?;
                    println!("{}", serde_json::to_string_pretty(&outcome.outputs)?);
                }
                Err(e) => {
                    // Rollback already ran; an empty state reflects it.
                    write_state(&state, &State::default())?;
                    error!("Apply failed: {}", e);
                    return Err(e.into());
                }
            }
        }

        Commands::Destroy { state } => {
            let Some(prior) = read_state(&state)? else {
                info!("No state at {}, nothing to destroy", state.display());
                return Ok(());
            };
            let remaining = engine.destroy(prior, progress, cancel).await?;
            write_state(&state, &remaining)?;
            if !remaining.resources.is_empty() {
                anyhow::bail!("{} resources could not be destroyed", remaining.resources.len());
            }
        }

        Commands::Import { state, mappings } => {
            let prior = read_state(&state)?;
            let raw = std::fs::read_to_string(&mappings)
                .with_context(|| format!("Failed to read mappings from {}", mappings.display()))?;
            let rows: Vec<ImportMapping> =
                serde_json::from_str(&raw).context("Mappings file must be a JSON list")?;

            let updated = engine.import(prior, &rows, progress, cancel).await?;
            write_state(&state, &updated)?;
            info!("Imported {} mappings", rows.len());
        }
    }

    Ok(())
}

fn read_state(path: &Path) -> Result<Option<State>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open state file {}", path.display()))?;
    let state = State::decode(file)
        .with_context(|| format!("Failed to decode state file {}", path.display()))?;
    Ok(Some(state))
}

/// Write the state atomically: sibling temp file, then rename over.
fn write_state(path: &Path, state: &State) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        state.encode(&mut file)?;
        file.flush()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to write state file {}", path.display()))?;
    Ok(())
}

/// Forward engine output sinks to the terminal.
fn drain_sinks(sinks: &OutputChannels) {
    let mut stdout_rx = sinks.stdout.subscribe();
    tokio::spawn(async move {
        while let Ok(chunk) = stdout_rx.recv().await {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&chunk);
            let _ = stdout.flush();
        }
    });

    let mut stderr_rx = sinks.stderr.subscribe();
    tokio::spawn(async move {
        while let Ok(chunk) = stderr_rx.recv().await {
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(&chunk);
            let _ = stderr.flush();
        }
    });
}
