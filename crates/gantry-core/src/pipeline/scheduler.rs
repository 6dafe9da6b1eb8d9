//! Bounded worker-pool scheduling of a stage graph.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use camino::Utf8PathBuf;
use chrono::Utc;
use tracing::{debug, info, instrument, warn, Span};

use super::{PipelineEvent, PipelineResult, PipelineRun, StageGraph};
use crate::cancel::CancelToken;
use crate::stage::{
    CommandExecutor, FailureKind, StageDefinition, StageError, StageResult, StageRunner,
    StageStatus,
};
use crate::version::VersionSpec;

/// Knobs for [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Maximum stages running at once.
    pub workers: usize,
    /// Stop starting new stages after the first required failure.
    pub fail_fast: bool,
    /// Project root; stage commands run here by default.
    pub project_root: Utf8PathBuf,
    /// Directory for run scratch space, relative to the project root.
    pub state_dir: Utf8PathBuf,
}

impl OrchestratorOptions {
    /// Defaults for `project_root`: one worker per CPU, `.gantry` state.
    pub fn new(project_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, usize::from),
            fail_fast: false,
            project_root: project_root.into(),
            state_dir: Utf8PathBuf::from(".gantry"),
        }
    }
}

/// Readiness of a pending stage given its prerequisites.
enum Readiness {
    Ready,
    Waiting,
    Blocked(String),
}

fn readiness(results: &[StageResult], prerequisites: &[usize]) -> Readiness {
    let mut waiting = false;
    for &p in prerequisites {
        let prereq = &results[p];
        match prereq.status {
            StageStatus::Failed if prereq.required => {
                return Readiness::Blocked(format!("prerequisite '{}' failed", prereq.name));
            }
            StageStatus::Skipped => {
                return Readiness::Blocked(format!("prerequisite '{}' was skipped", prereq.name));
            }
            StageStatus::Pending | StageStatus::Running => waiting = true,
            StageStatus::Succeeded | StageStatus::Failed => {}
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Failed result for a stage whose executor panicked.
fn crashed(definition: &StageDefinition) -> Result<StageResult, StageError> {
    warn!(stage = %definition.name, "stage executor panicked");
    let mut result = StageResult::pending(definition);
    result.start()?;
    result.fail(FailureKind::Crashed, None)?;
    Ok(result)
}

/// Runs stage graphs.
///
/// Stages whose prerequisites are all terminal run concurrently, up to
/// `workers` at a time. When a required stage fails, every stage that
/// depends on it is skipped; siblings already running finish normally.
pub struct Orchestrator<E> {
    executor: E,
    options: OrchestratorOptions,
    cancel: CancelToken,
}

impl<E: CommandExecutor> Orchestrator<E> {
    /// Create an orchestrator with its own cancellation token.
    pub fn new(executor: E, options: OrchestratorOptions) -> Self {
        Self {
            executor,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Share an existing cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts in-flight runs when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute every stage of `graph` for `spec`.
    pub fn execute(&self, graph: &StageGraph, spec: &VersionSpec) -> PipelineResult<PipelineRun> {
        self.execute_with(graph, spec, |_| {})
    }

    /// Execute `graph`, reporting progress to `on_event`.
    ///
    /// Stage failures are recorded in the returned run; errors are reserved
    /// for internal inconsistencies.
    #[instrument(
        skip_all,
        fields(run = tracing::field::Empty, version = %spec.version(), stages = graph.len())
    )]
    pub fn execute_with(
        &self,
        graph: &StageGraph,
        spec: &VersionSpec,
        mut on_event: impl FnMut(PipelineEvent),
    ) -> PipelineResult<PipelineRun> {
        let run_id = format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"), std::process::id());
        let run_dir = self
            .options
            .project_root
            .join(&self.options.state_dir)
            .join("runs")
            .join(&run_id);
        let span = Span::current();
        span.record("run", run_id.as_str());
        let mut run = PipelineRun::new(run_id, spec.clone(), graph);
        run.start()?;
        info!("pipeline started");

        let runner = StageRunner::new(
            &self.executor,
            self.options.project_root.clone(),
            run_dir,
            self.cancel.clone(),
        );
        let workers = self.options.workers.max(1);

        thread::scope(|scope| -> PipelineResult<()> {
            let (tx, rx) = mpsc::channel();
            let mut in_flight = 0usize;
            let mut halted = false;

            loop {
                for i in 0..graph.len() {
                    if run.stages[i].status != StageStatus::Pending {
                        continue;
                    }
                    let skip_reason = if self.cancel.is_cancelled() {
                        Some("run cancelled".to_string())
                    } else {
                        match readiness(&run.stages, graph.prerequisites(i)) {
                            Readiness::Blocked(reason) => Some(reason),
                            Readiness::Waiting => continue,
                            Readiness::Ready if halted => {
                                Some("an earlier required stage failed (fail-fast)".to_string())
                            }
                            Readiness::Ready => None,
                        }
                    };

                    let stage = &mut run.stages[i];
                    if let Some(reason) = skip_reason {
                        debug!(stage = %stage.name, %reason, "skipping stage");
                        stage.skip(reason.clone())?;
                        on_event(PipelineEvent::StageSkipped {
                            name: stage.name.clone(),
                            reason,
                        });
                        continue;
                    }
                    if in_flight >= workers {
                        continue;
                    }

                    stage.start()?;
                    on_event(PipelineEvent::StageStarted {
                        name: stage.name.clone(),
                    });
                    in_flight += 1;

                    let tx = tx.clone();
                    let definition = &graph.stages()[i];
                    let runner = &runner;
                    let run_span = &span;
                    scope.spawn(move || {
                        // Stage spans nest under the run's span on every worker.
                        let outcome = run_span.in_scope(|| {
                            panic::catch_unwind(AssertUnwindSafe(|| runner.run(definition, spec)))
                                .unwrap_or_else(|_| crashed(definition))
                        });
                        // The receiver outlives every worker inside this scope.
                        let _ = tx.send((i, outcome));
                    });
                }

                if in_flight == 0 {
                    break;
                }
                let Ok((i, outcome)) = rx.recv() else {
                    warn!("worker channel closed unexpectedly");
                    break;
                };
                in_flight -= 1;

                let result = outcome?;
                if result.is_blocking_failure() && self.options.fail_fast {
                    halted = true;
                }
                on_event(PipelineEvent::StageFinished {
                    name: result.name.clone(),
                    status: result.status,
                    failure: result.failure,
                    required: result.required,
                    duration: result.duration(),
                });
                run.stages[i] = result;
            }
            Ok(())
        })?;

        let verdict = run.complete()?;
        info!(%verdict, "pipeline finished");
        Ok(run)
    }
}
