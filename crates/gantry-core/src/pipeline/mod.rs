//! Pipeline runs: stage graphs, scheduling, and verdicts.
//!
//! A [`PipelineRun`] is the aggregate of every [`StageResult`] for one
//! [`VersionSpec`]. It moves through
//!
//! ```text
//! NotStarted -> Running -> Completed(Success | Failure | PartialSkip)
//! ```
//!
//! and never re-enters Running. Retrying means starting a new run.

mod graph;
mod scheduler;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::stage::{FailureKind, StageError, StageResult, StageStatus};
use crate::version::VersionSpec;

pub use graph::StageGraph;
pub use scheduler::{Orchestrator, OrchestratorOptions};

/// Errors from pipeline construction and execution.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The stage graph cannot be executed. Fatal; no stage runs.
    #[error("invalid pipeline graph: {reason}")]
    InvalidPipelineGraph {
        /// What is wrong with the graph.
        reason: String,
    },

    /// A selection named a stage or group that does not exist.
    #[error("no stage or group named '{0}'")]
    UnknownStage(String),

    /// A run state change that would move backwards.
    #[error("pipeline run cannot move from {from} to {to}")]
    IllegalRunTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Completion was requested while stages were still pending or running.
    #[error("stages not finished: {}", .0.join(", "))]
    Unfinished(Vec<String>),

    /// The stage runner was misused.
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Aggregate outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every required stage succeeded.
    Success,
    /// At least one required stage failed.
    Failure,
    /// Nothing required failed, but something required was skipped.
    PartialSkip,
}

impl Verdict {
    /// Derive the verdict from terminal stage results.
    ///
    /// Advisory stages never affect the verdict.
    pub fn from_results(results: &[StageResult]) -> Self {
        let required = || results.iter().filter(|r| r.required);
        if required().any(|r| r.status == StageStatus::Failed) {
            Self::Failure
        } else if required().all(|r| r.status == StageStatus::Succeeded) {
            Self::Success
        } else {
            Self::PartialSkip
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::PartialSkip => "partial skip",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "verdict")]
pub enum RunState {
    /// Created, no stage scheduled yet.
    NotStarted,
    /// Stages are being scheduled.
    Running,
    /// Every stage is terminal.
    Completed(Verdict),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Running => f.write_str("running"),
            Self::Completed(v) => write!(f, "completed ({v})"),
        }
    }
}

/// One execution of a stage graph for one version.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    /// Unique run identifier, also the scratch directory name.
    pub id: String,
    /// Version every stage was stamped with.
    pub version: VersionSpec,
    /// Stage results in dependency order.
    pub stages: Vec<StageResult>,
    #[serde(flatten)]
    state: RunState,
}

impl PipelineRun {
    /// A run with every stage of `graph` Pending.
    pub fn new(id: impl Into<String>, version: VersionSpec, graph: &StageGraph) -> Self {
        Self {
            id: id.into(),
            version,
            stages: graph.stages().iter().map(StageResult::pending).collect(),
            state: RunState::NotStarted,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// The verdict, once completed.
    pub const fn verdict(&self) -> Option<Verdict> {
        match self.state {
            RunState::Completed(v) => Some(v),
            _ => None,
        }
    }

    /// Result for a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// NotStarted -> Running.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.state != RunState::NotStarted {
            return Err(PipelineError::IllegalRunTransition {
                from: self.state.to_string(),
                to: RunState::Running.to_string(),
            });
        }
        self.state = RunState::Running;
        Ok(())
    }

    /// Running -> Completed, computing the verdict.
    ///
    /// Every stage must be terminal.
    pub fn complete(&mut self) -> PipelineResult<Verdict> {
        if self.state != RunState::Running {
            return Err(PipelineError::IllegalRunTransition {
                from: self.state.to_string(),
                to: "completed".to_string(),
            });
        }
        let unfinished: Vec<String> = self
            .stages
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.name.clone())
            .collect();
        if !unfinished.is_empty() {
            return Err(PipelineError::Unfinished(unfinished));
        }
        let verdict = Verdict::from_results(&self.stages);
        self.state = RunState::Completed(verdict);
        Ok(verdict)
    }
}

/// Progress notifications emitted while a run executes.
///
/// Delivered on the thread that called
/// [`Orchestrator::execute_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A stage was handed to a worker.
    StageStarted {
        /// Stage name.
        name: String,
    },
    /// A stage reached Succeeded or Failed.
    StageFinished {
        /// Stage name.
        name: String,
        /// Terminal status.
        status: StageStatus,
        /// Failure classification, if failed.
        failure: Option<FailureKind>,
        /// Whether the stage is required.
        required: bool,
        /// Time spent running.
        duration: Option<Duration>,
    },
    /// A stage was skipped without running.
    StageSkipped {
        /// Stage name.
        name: String,
        /// Why.
        reason: String,
    },
}
