//! Version command: print the version resolved from tags and commits.

use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument, warn};

use super::Project;

/// Arguments for the `version` subcommand.
#[derive(Args, Debug, Default)]
pub struct VersionArgs {
    /// Also show the base tag, distance, and commit
    #[arg(long)]
    pub detail: bool,
}

/// Resolve and print the working tree's version.
#[instrument(name = "cmd_version", skip_all)]
pub fn cmd_version(args: VersionArgs, global_json: bool, project: &Project) -> anyhow::Result<()> {
    let spec = project.resolve_version()?;
    debug!(version = %spec, release = spec.is_release(), "resolved version");

    if spec.dirty {
        warn!("working tree has uncommitted changes");
    }

    if global_json {
        println!("{}", serde_json::to_string_pretty(&spec)?);
        return Ok(());
    }

    println!("{spec}");
    if spec.dirty {
        eprintln!(
            "{}",
            "warning: working tree has uncommitted changes".yellow()
        );
    }
    if args.detail {
        let base = spec.base_tag.as_deref().unwrap_or("none");
        println!("{}: {}", "Base tag".dimmed(), base);
        println!("{}: {}", "Distance".dimmed(), spec.distance);
        println!("{}: {}", "Commit".dimmed(), spec.source_commit);
        println!(
            "{}: {}",
            "Release".dimmed(),
            if spec.is_release() { "yes" } else { "no" }
        );
    }
    Ok(())
}
