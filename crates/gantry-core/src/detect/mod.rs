//! Project detection: discover the ecosystem and settle on a stage graph.
//!
//! Looks for marker files in the project root and falls back to the
//! ecosystem's default stages when the configuration defines none.
//!
//! # Example
//!
//! ```no_run
//! use camino::Utf8Path;
//! use gantry_core::detect;
//!
//! match detect::detect_ecosystem(Utf8Path::new(".")) {
//!     Some(ecosystem) => println!("Detected: {ecosystem}"),
//!     None => println!("Unknown project type"),
//! }
//! ```

use camino::Utf8Path;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::ecosystem::Ecosystem;
use crate::error::{ConfigError, ConfigResult};
use crate::stage::StageDefinition;

/// Identify the ecosystem by scanning `project_root` for marker files.
///
/// Returns `None` if no recognized marker file is found.
#[instrument(fields(root = %project_root))]
pub fn detect_ecosystem(project_root: &Utf8Path) -> Option<Ecosystem> {
    let found = Ecosystem::ALL
        .iter()
        .copied()
        .find(|ecosystem| project_root.join(ecosystem.marker_file()).is_file());
    if let Some(ecosystem) = found {
        debug!(%ecosystem, "detected ecosystem");
    }
    found
}

/// The ecosystem in effect: `[project] type` if set, else detection.
pub fn effective_ecosystem(config: &Config, project_root: &Utf8Path) -> Option<Ecosystem> {
    config
        .project_type()
        .or_else(|| detect_ecosystem(project_root))
}

/// Stages to run: the configured `[[stages]]`, else ecosystem defaults.
///
/// Fails with [`ConfigError::NoStages`] when neither is available.
#[instrument(skip(config), fields(root = %project_root))]
pub fn resolve_stages(config: &Config, project_root: &Utf8Path) -> ConfigResult<Vec<StageDefinition>> {
    if !config.stages.is_empty() {
        debug!(count = config.stages.len(), "using configured stages");
        return Ok(config.stages.clone());
    }
    let ecosystem = effective_ecosystem(config, project_root).ok_or(ConfigError::NoStages)?;
    debug!(%ecosystem, "using default stages");
    Ok(ecosystem.default_stages())
}

/// Check whether a binary is available on `PATH`.
pub fn has_binary(name: &str) -> bool {
    which::which(name).is_ok()
}

/// The program a shell command line starts, skipping leading `VAR=value`
/// assignments.
pub fn program_of(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|token| !is_assignment(token))
}

fn is_assignment(token: &str) -> bool {
    token.split_once('=').is_some_and(|(name, _)| {
        !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}
