//! Clean command: remove build outputs and run scratch space.

use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use gantry_core::clean::{self, CleanReport};

use super::Project;

/// Arguments for the `clean` subcommand.
#[derive(Args, Debug, Default)]
pub struct CleanArgs {
    // Paths come from the [clean] section of the configuration
}

/// Remove the configured clean paths plus `<state_dir>/runs`.
pub fn clean_project(project: &Project) -> anyhow::Result<CleanReport> {
    let mut paths = project.config.clean_paths();
    paths.push(project.config.state_dir().join("runs"));
    Ok(clean::clean(&project.root, &paths)?)
}

/// Execute the clean command.
#[instrument(name = "cmd_clean", skip_all)]
pub fn cmd_clean(_args: CleanArgs, global_json: bool, project: &Project) -> anyhow::Result<()> {
    debug!(root = %project.root, "executing clean command");
    let report = clean_project(project)?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Human-readable summary of a clean pass.
pub fn print_report(report: &CleanReport) {
    if report.removed.is_empty() {
        println!("{}", "Nothing to clean".dimmed());
        return;
    }
    for path in &report.removed {
        println!("  {} {}", "removed".dimmed(), path);
    }
}
