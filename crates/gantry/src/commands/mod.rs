//! Command implementations

pub mod all;

pub mod clean;

pub mod info;

pub mod stages;

pub mod tag;

pub mod version;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use gantry_core::cancel::CancelToken;
use gantry_core::config::Config;
use gantry_core::detect;
use gantry_core::git::{self, GitRepo};
use gantry_core::pipeline::{
    Orchestrator, OrchestratorOptions, PipelineEvent, PipelineRun, StageGraph, Verdict,
};
use gantry_core::preflight::{self, PreflightReport};
use gantry_core::stage::{ShellExecutor, StageStatus};
use gantry_core::version::{self as core_version, VersionSpec};

/// Everything a command needs to know about the project it runs in.
#[derive(Debug, Clone)]
pub struct Project {
    /// Top of the git work tree, or the working directory outside a repo.
    pub root: Utf8PathBuf,
    /// Merged configuration.
    pub config: Config,
}

impl Project {
    /// Locate the project containing `cwd`.
    pub fn discover(cwd: &Utf8Path, config: &Config) -> Self {
        let root = git::toplevel(cwd).unwrap_or_else(|e| {
            debug!(error = %e, "not in a git work tree, using cwd as project root");
            cwd.to_path_buf()
        });
        Self {
            root,
            config: config.clone(),
        }
    }

    /// The validated stage graph: configured stages or ecosystem defaults.
    pub fn graph(&self) -> anyhow::Result<StageGraph> {
        let stages = detect::resolve_stages(&self.config, &self.root)?;
        StageGraph::new(stages).context("invalid stage configuration")
    }

    /// Resolve the working tree's version, honouring the configured tag prefix.
    pub fn resolve_version(&self) -> anyhow::Result<VersionSpec> {
        core_version::resolve_repo_with_prefix(
            &GitRepo::new(self.root.clone()),
            self.config.tag_prefix(),
        )
            .context("failed to resolve version")
    }

    fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            workers: self.config.workers(),
            fail_fast: self.config.fail_fast,
            project_root: self.root.clone(),
            state_dir: self.config.state_dir(),
        }
    }
}

/// Run preflight checks for `graph`, failing if any check fails.
pub fn require_preflight(project: &Project, graph: &StageGraph, json: bool) -> anyhow::Result<()> {
    let report = preflight::run_preflight(&project.root, graph.stages());
    if report.all_passed {
        return Ok(());
    }
    if !json {
        print_preflight(&report);
    }
    let failed: Vec<&str> = report.failures().map(|c| c.name.as_str()).collect();
    bail!("preflight checks failed: {}", failed.join(", "))
}

fn print_preflight(report: &PreflightReport) {
    eprintln!("{}", "Preflight Checks".bold().underline());
    for check in &report.checks {
        let icon = if check.passed {
            "✓".green().to_string()
        } else {
            "✗".red().to_string()
        };
        eprintln!("  {icon} {}: {}", check.name.bold(), check.message);
    }
}

/// Execute `graph` for `spec`, showing a spinner per running stage.
///
/// Returns the completed run; the caller decides what a verdict means.
pub fn execute_pipeline(
    project: &Project,
    graph: &StageGraph,
    spec: &VersionSpec,
    cancel: &CancelToken,
    json: bool,
) -> anyhow::Result<PipelineRun> {
    let orchestrator = Orchestrator::new(ShellExecutor::new(), project.orchestrator_options())
        .with_cancel_token(cancel.clone());

    let mut display = StageDisplay::new(json);
    let run = orchestrator
        .execute_with(graph, spec, |event| display.handle(event))
        .context("pipeline execution failed")?;
    display.finish();
    Ok(run)
}

/// Print the per-stage summary and verdict of a completed run.
pub fn print_run_summary(run: &PipelineRun) {
    println!();
    for stage in &run.stages {
        if stage.status == StageStatus::Failed
            && let Some(log) = &stage.log_ref
        {
            println!("  {} {}: {}", "log".dimmed(), stage.name, log);
        }
    }
    let verdict = run.verdict().unwrap_or(Verdict::Failure);
    let line = format!("{} {}", "Verdict:".bold(), verdict);
    match verdict {
        Verdict::Success => println!("{}", line.green()),
        Verdict::PartialSkip => println!("{}", line.yellow()),
        Verdict::Failure => println!("{}", line.red()),
    }
}

/// Fail unless the run's verdict is Success, naming what went wrong.
pub fn require_success(run: &PipelineRun) -> anyhow::Result<()> {
    match run.verdict() {
        Some(Verdict::Success) => Ok(()),
        Some(verdict) => {
            let failed: Vec<&str> = run
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Failed && s.required)
                .map(|s| s.name.as_str())
                .collect();
            if failed.is_empty() {
                bail!("pipeline verdict: {verdict}")
            }
            bail!("pipeline verdict: {verdict} (failed: {})", failed.join(", "))
        }
        None => bail!("pipeline did not complete"),
    }
}

/// Terminal progress for a running pipeline.
struct StageDisplay {
    quiet: bool,
    multi: MultiProgress,
    spinners: HashMap<String, ProgressBar>,
}

impl StageDisplay {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            multi: MultiProgress::new(),
            spinners: HashMap::new(),
        }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("  {spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"])
    }

    fn handle(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { name } => {
                debug!(stage = %name, "stage started");
                if self.quiet {
                    return;
                }
                let spinner = self.multi.add(ProgressBar::new_spinner());
                spinner.set_style(Self::spinner_style());
                spinner.set_message(name.clone());
                spinner.enable_steady_tick(Duration::from_millis(100));
                self.spinners.insert(name, spinner);
            }
            PipelineEvent::StageFinished {
                name,
                status,
                failure,
                required,
                duration,
            } => {
                let secs = duration.map_or(0.0, |d| d.as_secs_f64());
                let line = match (status, failure) {
                    (StageStatus::Succeeded, _) => {
                        format!("  {} {} {}", "✓".green(), name.bold(), format!("{secs:.1}s").dimmed())
                    }
                    (_, kind) => {
                        let kind = kind.map_or_else(|| "failed".to_string(), |k| k.to_string());
                        if required {
                            warn!(stage = %name, %kind, "stage failed");
                            format!("  {} {} {}", "✗".red(), name.bold(), kind.red())
                        } else {
                            format!(
                                "  {} {} {}",
                                "!".yellow(),
                                name.bold(),
                                format!("{kind} (advisory)").yellow()
                            )
                        }
                    }
                };
                self.finish_line(&name, line);
            }
            PipelineEvent::StageSkipped { name, reason } => {
                let line = format!(
                    "  {} {} {}",
                    "–".yellow(),
                    name.bold(),
                    format!("skipped: {reason}").dimmed()
                );
                self.finish_line(&name, line);
            }
        }
    }

    fn finish_line(&mut self, name: &str, line: String) {
        if self.quiet {
            return;
        }
        if let Some(spinner) = self.spinners.remove(name) {
            spinner.finish_and_clear();
        }
        // Printing through MultiProgress keeps the line above live spinners.
        if self.multi.is_hidden() || self.multi.println(&line).is_err() {
            println!("{line}");
        }
    }

    fn finish(self) {
        for spinner in self.spinners.into_values() {
            spinner.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::stage::StageDefinition;

    #[test]
    fn discover_outside_repo_uses_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let project = Project::discover(&cwd, &Config::default());
        assert_eq!(project.root, cwd);
    }

    #[test]
    fn graph_without_stages_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let project = Project::discover(&cwd, &Config::default());
        assert!(project.graph().is_err());
    }

    #[test]
    fn graph_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let config = Config {
            stages: vec![
                StageDefinition::new("b", "true").after(["a"]),
                StageDefinition::new("a", "true"),
            ],
            ..Config::default()
        };
        let graph = Project::discover(&cwd, &config).graph().unwrap();
        let names: Vec<&str> = graph.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
