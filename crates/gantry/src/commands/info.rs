//! Info command: show package, configuration, and the effective stage graph.

use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use gantry_core::config::{self, Config};
use gantry_core::detect;
use gantry_core::ecosystem::Ecosystem;
use gantry_core::pipeline::StageGraph;

use super::Project;

/// Arguments for the `info` subcommand.
#[derive(Args, Debug, Default)]
pub struct InfoArgs {
    // No subcommand-specific arguments; uses global --json flag
}

#[derive(Serialize)]
struct PackageInfo {
    name: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    description: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    repository: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    homepage: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    license: &'static str,
}

impl PackageInfo {
    const fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            description: env!("CARGO_PKG_DESCRIPTION"),
            repository: env!("CARGO_PKG_REPOSITORY"),
            homepage: env!("CARGO_PKG_HOMEPAGE"),
            license: env!("CARGO_PKG_LICENSE"),
        }
    }
}

#[derive(Serialize)]
struct ConfigInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    config_file: Option<String>,
    log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_dir: Option<String>,
    workers: usize,
    fail_fast: bool,
    state_dir: String,
    tag_prefix: String,
    release_store: String,
}

impl ConfigInfo {
    fn from_config(config: &Config, cwd: &camino::Utf8Path) -> Self {
        Self {
            config_file: config::find_project_config(cwd).map(|p| p.to_string()),
            log_level: config.log_level.as_str().to_string(),
            log_dir: config.log_dir.as_ref().map(|p| p.to_string()),
            workers: config.workers(),
            fail_fast: config.fail_fast,
            state_dir: config.state_dir().to_string(),
            tag_prefix: config.tag_prefix().to_string(),
            release_store: config.release_store().to_string(),
        }
    }
}

#[derive(Serialize)]
struct StageInfo {
    name: String,
    command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    after: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<String>,
}

impl StageInfo {
    fn from_graph(graph: &StageGraph) -> Vec<Self> {
        graph
            .stages()
            .iter()
            .enumerate()
            .map(|(i, def)| Self {
                name: def.name.clone(),
                command: def.command.clone(),
                after: graph
                    .prerequisites(i)
                    .iter()
                    .map(|&p| graph.stages()[p].name.clone())
                    .collect(),
                group: def.group.clone(),
                required: def.required,
                platform: def.platform.clone(),
            })
            .collect()
    }
}

#[derive(Serialize)]
struct FullInfo {
    #[serde(flatten)]
    package: PackageInfo,
    root: String,
    config: ConfigInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    ecosystem: Option<Ecosystem>,
    stages: Vec<StageInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage_error: Option<String>,
}

/// Print package information.
///
/// # Arguments
/// * `global_json` - Global `--json` flag from CLI
/// * `project` - Project root and loaded configuration
/// * `cwd` - Current working directory for config discovery
#[instrument(name = "cmd_info", skip_all, fields(json_output))]
pub fn cmd_info(
    _args: InfoArgs,
    global_json: bool,
    project: &Project,
    cwd: &camino::Utf8Path,
) -> anyhow::Result<()> {
    debug!(json_output = global_json, "executing info command");

    let ecosystem = detect::effective_ecosystem(&project.config, &project.root);
    let (stages, stage_error) = match project.graph() {
        Ok(graph) => (StageInfo::from_graph(&graph), None),
        Err(e) => (Vec::new(), Some(format!("{e:#}"))),
    };

    let full_info = FullInfo {
        package: PackageInfo::new(),
        root: project.root.to_string(),
        config: ConfigInfo::from_config(&project.config, cwd),
        ecosystem,
        stages,
        stage_error,
    };

    if global_json {
        println!("{}", serde_json::to_string_pretty(&full_info)?);
        return Ok(());
    }

    println!(
        "{} {}",
        full_info.package.name.bold(),
        full_info.package.version.green()
    );
    if !full_info.package.description.is_empty() {
        println!("{}", full_info.package.description);
    }
    if !full_info.package.license.is_empty() {
        println!("{}: {}", "License".dimmed(), full_info.package.license);
    }
    if !full_info.package.repository.is_empty() {
        println!(
            "{}: {}",
            "Repository".dimmed(),
            full_info.package.repository.cyan()
        );
    }

    // Configuration section
    println!();
    println!("{}", "Configuration".bold().underline());
    let cfg = &full_info.config;
    if let Some(ref path) = cfg.config_file {
        println!("{}: {}", "Config file".dimmed(), path.cyan());
    } else {
        println!("{}: {}", "Config file".dimmed(), "none loaded".yellow());
    }
    println!("{}: {}", "Project root".dimmed(), full_info.root);
    println!("{}: {}", "Log level".dimmed(), cfg.log_level);
    if let Some(ref dir) = cfg.log_dir {
        println!("{}: {}", "Log directory".dimmed(), dir);
    }
    println!("{}: {}", "Workers".dimmed(), cfg.workers);
    println!("{}: {}", "Fail fast".dimmed(), cfg.fail_fast);
    println!("{}: {}", "State directory".dimmed(), cfg.state_dir);
    println!("{}: {}", "Tag prefix".dimmed(), cfg.tag_prefix);
    println!("{}: {}", "Release store".dimmed(), cfg.release_store);

    // Stage graph section
    println!();
    println!("{}", "Stages".bold().underline());
    if let Some(eco) = full_info.ecosystem {
        println!("{}: {}", "Ecosystem".dimmed(), eco.to_string().cyan());
    }
    if let Some(ref err) = full_info.stage_error {
        println!("  {} {}", "○".yellow(), err.yellow());
    }
    for stage in &full_info.stages {
        let mut notes = Vec::new();
        if let Some(ref group) = stage.group {
            notes.push(format!("group {group}"));
        }
        if !stage.after.is_empty() {
            notes.push(format!("after {}", stage.after.join(", ")));
        }
        if let Some(ref platform) = stage.platform {
            notes.push(format!("platform {platform}"));
        }
        if !stage.required {
            notes.push("advisory".to_string());
        }
        println!("  {} {}", stage.name.bold(), stage.command.cyan());
        if !notes.is_empty() {
            println!("    {}", notes.join("; ").dimmed());
        }
    }

    Ok(())
}
