//! Command execution behind the stage runner.

use std::fs::File;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

/// A fully resolved command, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Stage the command belongs to.
    pub stage: String,
    /// Interpolated shell command.
    pub command: String,
    /// Directory to run in.
    pub working_dir: Utf8PathBuf,
    /// Environment added on top of the inherited one.
    pub env: Vec<(String, String)>,
    /// Kill the command after this long.
    pub timeout: Option<Duration>,
    /// File receiving combined stdout and stderr.
    pub log_path: Utf8PathBuf,
}

/// How a command invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Exited with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signalled,
    /// Killed after exceeding its timeout.
    TimedOut,
    /// Killed because the run was cancelled.
    Cancelled,
    /// Could not be started.
    SpawnFailed(String),
}

/// Runs stage commands.
///
/// Implementations must honour the timeout and cancellation token of each
/// call and must not retry.
pub trait CommandExecutor: Send + Sync {
    /// Execute once and report how it ended.
    fn execute(&self, invocation: &Invocation, cancel: &CancelToken) -> ExecOutcome;
}

/// Executes commands with `sh -c`, polling for timeout and cancellation.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    poll_interval: Duration,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ShellExecutor {
    /// Executor with the default 50ms poll interval.
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(invocation: &Invocation) -> std::io::Result<Child> {
        let stdout = File::create(&invocation.log_path)?;
        let stderr = stdout.try_clone()?;
        Command::new("sh")
            .args(["-c", &invocation.command])
            .current_dir(invocation.working_dir.as_std_path())
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    }
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, invocation: &Invocation, cancel: &CancelToken) -> ExecOutcome {
        debug!(stage = %invocation.stage, command = %invocation.command, "spawning stage command");
        let mut child = match Self::spawn(invocation) {
            Ok(child) => child,
            Err(e) => return ExecOutcome::SpawnFailed(e.to_string()),
        };

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return status
                        .code()
                        .map_or(ExecOutcome::Signalled, ExecOutcome::Exited);
                }
                Ok(None) => {}
                Err(e) => {
                    kill(&mut child);
                    return ExecOutcome::SpawnFailed(e.to_string());
                }
            }

            if cancel.is_cancelled() {
                kill(&mut child);
                return ExecOutcome::Cancelled;
            }
            if invocation.timeout.is_some_and(|limit| start.elapsed() >= limit) {
                kill(&mut child);
                return ExecOutcome::TimedOut;
            }
            thread::sleep(self.poll_interval);
        }
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(error = %e, "failed to kill stage command");
    }
    let _ = child.wait();
}
