//! Tag command: create (and optionally push) a release tag at HEAD.

use std::io::IsTerminal;

use anyhow::Context;
use clap::Args;
use inquire::Confirm;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use gantry_core::tagging;

use super::Project;

/// Arguments for the `tag` subcommand.
#[derive(Args, Debug, Default)]
pub struct TagArgs {
    /// Version to tag (e.g., "1.2.3", "v1.2.3", "1.3.0-rc1")
    #[arg(value_name = "VERSION")]
    pub version: String,

    /// Push the tag to the configured remote
    #[arg(long)]
    pub push: bool,

    /// Don't ask whether to push
    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Serialize)]
struct TagOutcome<'a> {
    tag: &'a str,
    pushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<&'a str>,
}

/// Execute the tag command.
#[instrument(name = "cmd_tag", skip_all, fields(version = %args.version))]
pub fn cmd_tag(args: TagArgs, global_json: bool, project: &Project) -> anyhow::Result<()> {
    let name = tagging::plan_tag(&args.version, project.config.tag_prefix())?;
    debug!(%name, "planned tag");

    tagging::create_tag(&project.root, &name)
        .with_context(|| format!("failed to create tag {name}"))?;
    if !global_json {
        println!("{} Created tag {}", "✓".green(), name.green().bold());
    }

    let remote = project.config.remote();
    let push = if args.push {
        true
    } else if args.yes || global_json || !std::io::stdin().is_terminal() {
        false
    } else {
        Confirm::new(&format!("Push {name} to {remote}?"))
            .with_default(false)
            .prompt()
            .context("push prompt cancelled")?
    };

    if push {
        tagging::push(&project.root, remote, &name)
            .with_context(|| format!("failed to push {name} to {remote}"))?;
        if !global_json {
            println!("{} Pushed {} to {}", "✓".green(), name.bold(), remote.cyan());
        }
    }

    if global_json {
        let outcome = TagOutcome {
            tag: &name,
            pushed: push,
            remote: push.then_some(remote),
        };
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    Ok(())
}
