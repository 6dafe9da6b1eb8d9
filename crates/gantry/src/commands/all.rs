//! All command: clean, run the full pipeline, and optionally publish.

use anyhow::Context;
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, info, instrument};

use gantry_core::cancel::CancelToken;
use gantry_core::clean::CleanReport;
use gantry_core::pipeline::PipelineRun;
use gantry_core::release::{FsArtifactStore, ReleaseCoordinator, ReleaseRecord};
use gantry_core::semver::Version;
use gantry_core::version::normalize_tag_input;

use super::Project;

/// Arguments for the `all` subcommand.
#[derive(Args, Debug, Default)]
pub struct AllArgs {
    /// Publish a release record after a successful run (implies all checks)
    #[arg(long, conflicts_with_all = ["no_lint", "no_test", "no_build"])]
    pub release: bool,

    /// Version to release (defaults to the tag at HEAD)
    #[arg(long, value_name = "VERSION", requires = "release")]
    pub target: Option<String>,

    /// Keep existing build outputs
    #[arg(long)]
    pub no_clean: bool,

    /// Leave out lint stages
    #[arg(long)]
    pub no_lint: bool,

    /// Leave out test stages
    #[arg(long)]
    pub no_test: bool,

    /// Leave out build stages
    #[arg(long)]
    pub no_build: bool,
}

impl AllArgs {
    fn excluded(&self) -> Vec<&'static str> {
        [
            ("lint", self.no_lint),
            ("test", self.no_test),
            ("build", self.no_build),
        ]
        .into_iter()
        .filter_map(|(name, skip)| skip.then_some(name))
        .collect()
    }
}

#[derive(Serialize)]
struct AllOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    clean: Option<CleanReport>,
    run: PipelineRun,
    #[serde(skip_serializing_if = "Option::is_none")]
    release: Option<ReleaseRecord>,
}

/// Execute the all command.
#[instrument(name = "cmd_all", skip_all, fields(release = args.release))]
pub fn cmd_all(
    args: AllArgs,
    global_json: bool,
    project: &Project,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let excluded = args.excluded();
    debug!(?excluded, no_clean = args.no_clean, "executing all command");

    let graph = project.graph()?.without(&excluded)?;
    super::require_preflight(project, &graph, global_json)?;

    let clean = if args.no_clean {
        None
    } else {
        let report = super::clean::clean_project(project)?;
        if !global_json {
            super::clean::print_report(&report);
        }
        Some(report)
    };

    let spec = project.resolve_version()?;
    if !global_json {
        println!("{} {}", "Pipeline".bold(), spec.to_string().green());
    }

    let run = super::execute_pipeline(project, &graph, &spec, cancel, global_json)?;
    if !global_json {
        super::print_run_summary(&run);
    }

    let result = super::require_success(&run);
    let release = match (&result, args.release) {
        (Ok(()), true) => Some(publish(project, &run, args.target.as_deref())?),
        _ => None,
    };

    if global_json {
        let outcome = AllOutcome {
            clean,
            run,
            release,
        };
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if let Some(record) = &release {
        print_record(record);
    }
    result
}

fn publish(project: &Project, run: &PipelineRun, target: Option<&str>) -> anyhow::Result<ReleaseRecord> {
    let target = match target {
        Some(input) => {
            let bare = normalize_tag_input(input)?;
            Version::parse(&bare).with_context(|| format!("invalid release target '{input}'"))?
        }
        None => run
            .version
            .release_version()
            .cloned()
            .unwrap_or_else(|| run.version.version().clone()),
    };

    let store = FsArtifactStore::new(project.root.join(project.config.release_store()));
    let record = ReleaseCoordinator::new(store)
        .release(run, &target)
        .with_context(|| format!("release {target} failed"))?;
    info!(version = %record.version, "published release");
    Ok(record)
}

fn print_record(record: &ReleaseRecord) {
    println!();
    println!(
        "{} Released {} from {}",
        "✓".green().bold(),
        record.version.to_string().green().bold(),
        record.tag.cyan()
    );
    for (platform, entries) in &record.artifact_manifest {
        println!("  {}", platform.bold());
        for entry in entries {
            println!("    {} {}", entry.file_name, entry.sha256.dimmed());
        }
    }
}
