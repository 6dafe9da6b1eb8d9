//! Preflight checks run before any stage starts.
//!
//! Validates that the project is a git checkout and that every stage's
//! program can be found on `PATH`. Returns structured results that the CLI
//! formats.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::detect;
use crate::git;
use crate::stage::StageDefinition;

/// A single preflight check result.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Human-readable name of the check.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Description of the result (reason for failure, or confirmation).
    pub message: String,
}

/// Full preflight report.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    /// Individual check results.
    pub checks: Vec<CheckResult>,
    /// Whether all checks passed.
    pub all_passed: bool,
}

impl PreflightReport {
    /// Checks that did not pass.
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Run all preflight checks for `stages` in `project_root`.
#[instrument(skip(stages), fields(root = %project_root, stages = stages.len()))]
pub fn run_preflight(project_root: &Utf8Path, stages: &[StageDefinition]) -> PreflightReport {
    let checks = vec![
        check_git_repo(project_root),
        check_stage_tools(project_root, stages),
    ];

    let all_passed = checks.iter().all(|c| c.passed);
    debug!(all_passed, check_count = checks.len(), "preflight complete");

    PreflightReport { checks, all_passed }
}

fn check_git_repo(project_root: &Utf8Path) -> CheckResult {
    match git::is_inside_repo(project_root) {
        Ok(true) => CheckResult {
            name: "Git repository".into(),
            passed: true,
            message: "Inside a git repository".into(),
        },
        Ok(false) => CheckResult {
            name: "Git repository".into(),
            passed: false,
            message: "Not inside a git repository".into(),
        },
        Err(e) => CheckResult {
            name: "Git repository".into(),
            passed: false,
            message: format!("Failed to check: {e}"),
        },
    }
}

/// Words `sh` handles itself; there is nothing to find on `PATH`.
const SHELL_BUILTINS: &[&str] = &[
    "!", ".", ":", "[", "alias", "break", "case", "cd", "command", "continue", "eval", "exec",
    "exit", "export", "false", "for", "if", "local", "read", "readonly", "return", "set",
    "shift", "source", "test", "trap", "true", "ulimit", "umask", "unset", "until", "wait",
    "while",
];

/// Where the program a stage starts should be, if it can be checked before
/// the stage runs.
enum ProgramLookup<'a> {
    /// Found through `PATH`.
    OnPath(&'a str),
    /// A path, already resolved against the stage's working directory.
    File(Utf8PathBuf),
    /// Builtins and placeholders only mean something once the shell runs.
    Unchecked,
}

fn lookup<'a>(
    project_root: &Utf8Path,
    stage: &StageDefinition,
    program: &'a str,
) -> ProgramLookup<'a> {
    let program = program.trim_end_matches([';', '&', '|']);
    if program.is_empty()
        || program.starts_with(['(', '{'])
        || program.contains(['{', '$', '`'])
        || SHELL_BUILTINS.contains(&program)
    {
        return ProgramLookup::Unchecked;
    }
    if !program.contains('/') {
        return ProgramLookup::OnPath(program);
    }
    let path = Utf8Path::new(program);
    if path.is_absolute() {
        return ProgramLookup::File(path.to_path_buf());
    }
    let base = stage
        .working_dir
        .as_ref()
        .map_or_else(|| project_root.to_path_buf(), |dir| project_root.join(dir));
    ProgramLookup::File(base.join(path))
}

fn check_stage_tools(project_root: &Utf8Path, stages: &[StageDefinition]) -> CheckResult {
    let mut missing: Vec<String> = Vec::new();
    for stage in stages {
        let Some(program) = detect::program_of(&stage.command) else {
            missing.push(format!("{} (empty command)", stage.name));
            continue;
        };
        let found = match lookup(project_root, stage, program) {
            ProgramLookup::Unchecked => continue,
            ProgramLookup::OnPath(name) => detect::has_binary(name),
            ProgramLookup::File(path) => path.is_file(),
        };
        if !found {
            missing.push(format!("{program} (stage '{}')", stage.name));
        }
    }

    if missing.is_empty() {
        CheckResult {
            name: "Stage tools".into(),
            passed: true,
            message: "All stage programs are installed".into(),
        }
    } else {
        CheckResult {
            name: "Stage tools".into(),
            passed: false,
            message: format!("Missing tools: {}", missing.join(", ")),
        }
    }
}
