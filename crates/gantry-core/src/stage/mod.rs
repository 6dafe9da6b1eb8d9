//! Pipeline stages: definitions, status tracking, and execution.
//!
//! A stage is a named shell command with a timeout, optional prerequisites,
//! and a required/advisory classification. Each execution produces a
//! [`StageResult`] whose status only ever moves forward:
//!
//! ```text
//! Pending -> Running -> Succeeded | Failed
//! Pending -> Skipped
//! ```

mod exec;
mod runner;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use exec::{CommandExecutor, ExecOutcome, Invocation, ShellExecutor};
pub use runner::{StageRunner, StageVars};

/// Errors from the stage runner.
///
/// Command failures are not errors; they are recorded as a Failed
/// [`StageResult`].
#[derive(Error, Debug)]
pub enum StageError {
    /// The stage was already run in this pipeline run.
    #[error("stage '{0}' already executed in this run")]
    AlreadyExecuted(String),

    /// Another stage of this run already owns the same scratch directory.
    #[error("stage '{stage}' would share scratch directory '{dir}' with stage '{owner}'")]
    ScratchCollision {
        /// Stage being run.
        stage: String,
        /// Stage that claimed the directory first.
        owner: String,
        /// The shared directory name.
        dir: String,
    },

    /// A status change that would move a stage backwards.
    #[error("stage '{stage}' cannot move from {from} to {to}")]
    IllegalTransition {
        /// Stage name.
        stage: String,
        /// Current status.
        from: StageStatus,
        /// Requested status.
        to: StageStatus,
    },
}

/// Declarative definition of one stage, as written under `[[stages]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name.
    pub name: String,

    /// Shell command, run through `sh -c`.
    pub command: String,

    /// Stages or groups that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Group this stage belongs to (e.g. `lint`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Failure blocks dependents and fails the run. `false` makes the stage advisory.
    #[serde(default = "default_required")]
    pub required: bool,

    /// Kill the command after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Working directory, relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<Utf8PathBuf>,

    /// Extra environment variables. Values support `{var}` interpolation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Target platform of the artifacts this stage produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    /// Glob patterns, relative to the project root, that must match after success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

const fn default_required() -> bool {
    true
}

impl StageDefinition {
    /// A required stage with no prerequisites.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            depends_on: Vec::new(),
            group: None,
            required: true,
            timeout_secs: None,
            working_dir: None,
            env: BTreeMap::new(),
            platform: None,
            artifacts: Vec::new(),
        }
    }

    /// Add prerequisites.
    #[must_use]
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Place the stage in a group.
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Mark the stage advisory.
    #[must_use]
    pub const fn advisory(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set the target platform.
    #[must_use]
    pub fn for_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Declare artifact globs.
    #[must_use]
    pub fn with_artifacts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Directory name holding a stage's scratch output within a run.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`, and names made only of
/// dots are rewritten so the directory always stays inside the run.
pub fn scratch_dir_name(name: &str) -> String {
    if name.chars().all(|c| c == '.') {
        return "_".repeat(name.len().max(1));
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Lifecycle status of a stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Scheduled but not started.
    Pending,
    /// Command in flight.
    Running,
    /// Command exited zero and declared artifacts exist.
    Succeeded,
    /// Command failed, timed out, or was cancelled.
    Failed,
    /// Never started because a prerequisite did not succeed.
    Skipped,
}

impl StageStatus {
    /// Succeeded, Failed, or Skipped.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Succeeded | Self::Failed)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Command exited non-zero or was killed by a signal.
    NonZeroExit,
    /// Command exceeded its timeout.
    Timeout,
    /// Run was cancelled while the command was in flight.
    Cancelled,
    /// Command could not be started.
    SpawnFailed,
    /// Command succeeded but a declared artifact pattern matched nothing.
    MissingArtifacts,
    /// The executor panicked before reporting an outcome.
    Crashed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NonZeroExit => "non-zero exit",
            Self::Timeout => "timed out",
            Self::Cancelled => "cancelled",
            Self::SpawnFailed => "failed to start",
            Self::MissingArtifacts => "missing artifacts",
            Self::Crashed => "executor crashed",
        };
        f.write_str(s)
    }
}

/// Outcome of one stage in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Current status.
    pub status: StageStatus,
    /// Copied from the definition.
    pub required: bool,
    /// When the stage entered Running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Captured combined output.
    pub log_ref: Option<Utf8PathBuf>,
    /// Exit code of the command, when it exited normally.
    pub exit_code: Option<i32>,
    /// Failure classification for Failed stages.
    pub failure: Option<FailureKind>,
    /// Why the stage was skipped.
    pub skip_reason: Option<String>,
    /// Copied from the definition.
    pub platform: Option<String>,
    /// Files matched by the artifact patterns.
    pub artifacts: Vec<Utf8PathBuf>,
}

impl StageResult {
    /// A fresh Pending result for `stage`.
    pub fn pending(stage: &StageDefinition) -> Self {
        Self {
            name: stage.name.clone(),
            status: StageStatus::Pending,
            required: stage.required,
            started_at: None,
            finished_at: None,
            log_ref: None,
            exit_code: None,
            failure: None,
            skip_reason: None,
            platform: stage.platform.clone(),
            artifacts: Vec::new(),
        }
    }

    fn transition(&mut self, next: StageStatus) -> Result<(), StageError> {
        if !self.status.can_become(next) {
            return Err(StageError::IllegalTransition {
                stage: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Pending -> Running.
    pub fn start(&mut self) -> Result<(), StageError> {
        self.transition(StageStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Succeeded.
    pub fn succeed(&mut self, artifacts: Vec<Utf8PathBuf>) -> Result<(), StageError> {
        self.transition(StageStatus::Succeeded)?;
        self.exit_code = Some(0);
        self.artifacts = artifacts;
        Ok(())
    }

    /// Running -> Failed.
    pub fn fail(&mut self, kind: FailureKind, exit_code: Option<i32>) -> Result<(), StageError> {
        self.transition(StageStatus::Failed)?;
        self.failure = Some(kind);
        self.exit_code = exit_code;
        Ok(())
    }

    /// Pending -> Skipped.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), StageError> {
        self.transition(StageStatus::Skipped)?;
        self.skip_reason = Some(reason.into());
        Ok(())
    }

    /// Wall-clock time spent Running.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }

    /// Failed and required, so dependents must not run.
    pub fn is_blocking_failure(&self) -> bool {
        self.required && self.status == StageStatus::Failed
    }
}
