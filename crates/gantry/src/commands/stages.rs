//! `lint`, `test`, and `build`: run the stages named or grouped so.

use anyhow::Context;
use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use gantry_core::cancel::CancelToken;

use super::Project;

/// Arguments shared by the stage subcommands.
#[derive(Args, Debug, Default)]
pub struct StageArgs {
    /// Also run the stages these depend on
    #[arg(long)]
    pub with_deps: bool,
}

/// Run every stage named or grouped `target`.
#[instrument(name = "cmd_stages", skip_all, fields(%target))]
pub fn cmd_stages(
    target: &str,
    args: StageArgs,
    global_json: bool,
    project: &Project,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    debug!(with_deps = args.with_deps, "executing stage command");

    let graph = project
        .graph()?
        .select(&[target], args.with_deps)
        .with_context(|| format!("no '{target}' stages defined"))?;
    super::require_preflight(project, &graph, global_json)?;
    let spec = project.resolve_version()?;

    if !global_json {
        println!(
            "{} {} {}",
            target.bold(),
            "@".dimmed(),
            spec.to_string().green()
        );
    }

    let run = super::execute_pipeline(project, &graph, &spec, cancel, global_json)?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        super::print_run_summary(&run);
    }
    super::require_success(&run)
}
