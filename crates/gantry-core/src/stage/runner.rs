//! The stage runner: one command, one run, one result.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, instrument, warn};

use super::{
    CommandExecutor, ExecOutcome, FailureKind, Invocation, StageDefinition, StageError,
    StageResult, scratch_dir_name,
};
use crate::cancel::CancelToken;
use crate::version::VersionSpec;

/// Values available for `{var}` interpolation in commands and env.
///
/// `{version}`, `{tag}`, `{commit}`, `{stage}`, `{platform}`.
#[derive(Debug, Clone)]
pub struct StageVars {
    /// Resolved version.
    pub version: String,
    /// Base tag name, empty when none.
    pub tag: String,
    /// Abbreviated commit hash.
    pub commit: String,
    /// Stage name.
    pub stage: String,
    /// Stage platform, empty when none.
    pub platform: String,
}

impl StageVars {
    /// Variables for `stage` under `spec`.
    pub fn new(stage: &StageDefinition, spec: &VersionSpec) -> Self {
        Self {
            version: spec.version().to_string(),
            tag: spec.tag().to_string(),
            commit: spec.commit_hash.clone(),
            stage: stage.name.clone(),
            platform: stage.platform.clone().unwrap_or_default(),
        }
    }

    /// Replace `{var}` placeholders. Unknown placeholders are left alone.
    pub fn interpolate(&self, input: &str) -> String {
        input
            .replace("{version}", &self.version)
            .replace("{tag}", &self.tag)
            .replace("{commit}", &self.commit)
            .replace("{stage}", &self.stage)
            .replace("{platform}", &self.platform)
    }
}

/// Executes stages for a single pipeline run.
///
/// Each stage gets a scratch directory `<run_dir>/<stage>/` holding its
/// `output.log`. A stage name can be run at most once per runner, and no two
/// stages may map to the same directory.
pub struct StageRunner<'a, E: CommandExecutor + ?Sized> {
    executor: &'a E,
    project_root: Utf8PathBuf,
    run_dir: Utf8PathBuf,
    cancel: CancelToken,
    /// Scratch directory name -> stage that owns it.
    claimed: Mutex<HashMap<String, String>>,
}

impl<'a, E: CommandExecutor + ?Sized> StageRunner<'a, E> {
    /// Create a runner writing scratch output under `run_dir`.
    pub fn new(
        executor: &'a E,
        project_root: impl Into<Utf8PathBuf>,
        run_dir: impl Into<Utf8PathBuf>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            executor,
            project_root: project_root.into(),
            run_dir: run_dir.into(),
            cancel,
            claimed: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding this run's stage scratch directories.
    pub fn run_dir(&self) -> &Utf8Path {
        &self.run_dir
    }

    /// Reserve the stage's scratch directory, returning its name.
    fn claim(&self, name: &str) -> Result<String, StageError> {
        let dir = scratch_dir_name(name);
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        match claimed.get(&dir) {
            Some(owner) if owner == name => Err(StageError::AlreadyExecuted(name.to_string())),
            Some(owner) => Err(StageError::ScratchCollision {
                stage: name.to_string(),
                owner: owner.clone(),
                dir,
            }),
            None => {
                claimed.insert(dir.clone(), name.to_string());
                Ok(dir)
            }
        }
    }

    /// Run `stage` once and return its terminal result.
    ///
    /// Command failures, timeouts, and cancellation are reported through the
    /// returned [`StageResult`]; only misuse of the runner is an error.
    #[instrument(skip_all, fields(stage = %stage.name))]
    pub fn run(
        &self,
        stage: &StageDefinition,
        spec: &VersionSpec,
    ) -> Result<StageResult, StageError> {
        let dir = self.claim(&stage.name)?;
        let mut result = StageResult::pending(stage);
        result.start()?;

        let stage_dir = self.run_dir.join(dir);
        let log_path = stage_dir.join("output.log");
        if let Err(e) = fs::create_dir_all(&stage_dir) {
            warn!(dir = %stage_dir, error = %e, "cannot create stage directory");
            result.fail(FailureKind::SpawnFailed, None)?;
            return Ok(result);
        }
        result.log_ref = Some(log_path.clone());

        if self.cancel.is_cancelled() {
            result.fail(FailureKind::Cancelled, None)?;
            return Ok(result);
        }

        let vars = StageVars::new(stage, spec);
        let invocation = self.invocation(stage, &vars, &stage_dir, log_path.clone());
        let outcome = self.executor.execute(&invocation, &self.cancel);
        debug!(?outcome, "command finished");

        match outcome {
            ExecOutcome::Exited(0) => match self.collect_artifacts(stage, &vars) {
                Ok(paths) => result.succeed(paths)?,
                Err(pattern) => {
                    append_note(&log_path, &format!("no files match artifact pattern '{pattern}'"));
                    result.fail(FailureKind::MissingArtifacts, Some(0))?;
                }
            },
            ExecOutcome::Exited(code) => result.fail(FailureKind::NonZeroExit, Some(code))?,
            ExecOutcome::Signalled => result.fail(FailureKind::NonZeroExit, None)?,
            ExecOutcome::TimedOut => {
                let secs = stage.timeout_secs.unwrap_or_default();
                append_note(&log_path, &format!("timed out after {secs}s"));
                result.fail(FailureKind::Timeout, None)?;
            }
            ExecOutcome::Cancelled => {
                append_note(&log_path, "cancelled");
                result.fail(FailureKind::Cancelled, None)?;
            }
            ExecOutcome::SpawnFailed(message) => {
                append_note(&log_path, &format!("failed to start: {message}"));
                result.fail(FailureKind::SpawnFailed, None)?;
            }
        }

        info!(status = %result.status, exit_code = ?result.exit_code, "stage finished");
        Ok(result)
    }

    fn invocation(
        &self,
        stage: &StageDefinition,
        vars: &StageVars,
        stage_dir: &Utf8Path,
        log_path: Utf8PathBuf,
    ) -> Invocation {
        let working_dir = stage
            .working_dir
            .as_ref()
            .map_or_else(|| self.project_root.clone(), |dir| self.project_root.join(dir));

        let mut env = vec![
            ("GANTRY_VERSION".to_string(), vars.version.clone()),
            ("GANTRY_COMMIT".to_string(), vars.commit.clone()),
            ("GANTRY_STAGE".to_string(), vars.stage.clone()),
            ("GANTRY_STAGE_DIR".to_string(), stage_dir.to_string()),
        ];
        env.extend(
            stage
                .env
                .iter()
                .map(|(k, v)| (k.clone(), vars.interpolate(v))),
        );

        Invocation {
            stage: stage.name.clone(),
            command: vars.interpolate(&stage.command),
            working_dir,
            env,
            timeout: stage.timeout(),
            log_path,
        }
    }

    /// Expand artifact globs. Returns the first pattern that matched nothing.
    fn collect_artifacts(
        &self,
        stage: &StageDefinition,
        vars: &StageVars,
    ) -> Result<Vec<Utf8PathBuf>, String> {
        let mut found = Vec::new();
        for pattern in &stage.artifacts {
            let pattern = vars.interpolate(pattern);
            let full = self.project_root.join(&pattern);
            let matches: Vec<Utf8PathBuf> = glob::glob(full.as_str())
                .map_err(|_| pattern.clone())?
                .filter_map(Result::ok)
                .filter(|p| p.is_file())
                .filter_map(|p| Utf8PathBuf::from_path_buf(p).ok())
                .collect();
            if matches.is_empty() {
                return Err(pattern);
            }
            found.extend(matches);
        }
        found.sort();
        found.dedup();
        Ok(found)
    }
}

fn append_note(log_path: &Utf8Path, note: &str) {
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut f| writeln!(f, "[gantry] {note}"));
    if let Err(e) = written {
        warn!(log = %log_path, error = %e, "cannot append to stage log");
    }
}
