//! Module loading and input resolution

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use super::{Module, ModuleError, ModuleResult};

/// Plugin tags this engine answers to
const PLUGIN_TAGS: &[&str] = &["cldctl", "native"];

/// File names probed when the module source is a directory
const MODULE_FILE_NAMES: &[&str] = &["module.yml", "module.yaml"];

/// Load a module from a file or a directory containing `module.yml`.
pub fn load_module(source: &Path) -> ModuleResult<Module> {
    let file = if source.is_dir() {
        MODULE_FILE_NAMES
            .iter()
            .map(|name| source.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| ModuleError::NotFound(source.display().to_string()))?
    } else if source.is_file() {
        source.to_path_buf()
    } else {
        return Err(ModuleError::NotFound(source.display().to_string()));
    };

    debug!("Loading module from {}", file.display());

    let raw = std::fs::read_to_string(&file)?;
    let module: Module = serde_yaml::from_str(&raw)?;

    if let Some(plugin) = &module.plugin {
        if !PLUGIN_TAGS.contains(&plugin.as_str()) {
            return Err(ModuleError::InvalidPlugin(plugin.clone()));
        }
    }

    Ok(module)
}

/// Resolve caller-supplied inputs against the module's declarations.
///
/// Required inputs must be present; declared defaults fill the gaps.
/// Values for undeclared names pass through untouched.
pub fn resolve_inputs(module: &Module, provided: &Map<String, Value>) -> ModuleResult<Map<String, Value>> {
    let mut resolved = provided.clone();

    for (name, def) in &module.inputs {
        if resolved.get(name).map(|v| !v.is_null()).unwrap_or(false) {
            continue;
        }
        match &def.default {
            Some(default) => {
                resolved.insert(name.clone(), default.clone());
            }
            None if def.required => {
                return Err(ModuleError::MissingInput(name.clone()));
            }
            None => {}
        }
    }

    Ok(resolved)
}
