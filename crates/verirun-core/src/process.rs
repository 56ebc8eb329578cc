//! Subordinate process runner
//!
//! Every external tool of the pipeline is launched through [`ProcessRunner`].
//! Each child gets its own process group so that a timeout can take down the
//! whole tree the tool spawned. The group is killed after a normal exit as
//! well, and the child is always reaped before the runner returns.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::toolchain::ResolvedEnvironment;

/// Pipeline phase a tool invocation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Link,
    Prepare,
    Instrument,
    Optimize,
    Slice,
    Verify,
    Output,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Link => "link",
            Phase::Prepare => "prepare",
            Phase::Instrument => "instrument",
            Phase::Optimize => "optimize",
            Phase::Slice => "slice",
            Phase::Verify => "verify",
            Phase::Output => "output",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured result of one tool invocation
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout followed by stderr, the way most tools are parsed
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Launches tools with the resolved environment under a cancellation token
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    env: ResolvedEnvironment,
    cwd: PathBuf,
    cancel: CancellationToken,
}

impl ProcessRunner {
    pub fn new(env: ResolvedEnvironment, cwd: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            env,
            cwd: cwd.into(),
            cancel,
        }
    }

    pub fn env(&self) -> &ResolvedEnvironment {
        &self.env
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `program` to completion, or until the token is cancelled
    pub async fn run<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<ProcessOutput, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let executable = self
            .env
            .find_executable(program)
            .unwrap_or_else(|| PathBuf::from(program));

        let mut command = std::process::Command::new(&executable);
        command
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        self.env.apply_to(&mut command);

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);

        debug!(
            "running {} {}",
            executable.display(),
            args.iter()
                .map(|a| a.as_ref().to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| PipelineError::Spawn {
            tool: program.to_string(),
            source,
        })?;

        let group = child.id();
        let mut stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = self.cancel.cancelled() => None,
        };

        let status = match waited {
            Some(status) => {
                // Background descendants die with the tool and release its pipes
                kill_group(group);
                status.map_err(|source| PipelineError::Spawn {
                    tool: program.to_string(),
                    source,
                })?
            }
            None => {
                debug!("cancelling {}", program);
                terminate(&mut child, program).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(PipelineError::Cancelled);
            }
        };

        // A descendant that left the group can still hold the pipes open
        let drained = tokio::select! {
            pipes = async { tokio::join!(&mut stdout_task, &mut stderr_task) } => Some(pipes),
            _ = self.cancel.cancelled() => None,
        };
        let (stdout, stderr) = match drained {
            Some((stdout, stderr)) => (stdout.unwrap_or_default(), stderr.unwrap_or_default()),
            None => {
                debug!("cancelled while reading output of {}", program);
                stdout_task.abort();
                stderr_task.abort();
                return Err(PipelineError::Cancelled);
            }
        };
        let duration = start.elapsed();

        debug!("{} finished with {} in {:?}", program, status, duration);

        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
            duration,
        })
    }

    /// Like [`ProcessRunner::run`], but a non-zero exit is a phase failure
    pub async fn run_checked<S: AsRef<OsStr>>(
        &self,
        phase: Phase,
        program: &str,
        args: &[S],
    ) -> Result<ProcessOutput, PipelineError> {
        let output = self.run(program, args).await?;
        if !output.success() {
            debug!("{} stderr:\n{}", program, output.stderr);
            return Err(PipelineError::ToolFailed {
                phase,
                tool: program.to_string(),
                status: output.status.to_string(),
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// SIGKILL the process group led by `group`; a group that is already gone is fine
pub(crate) fn kill_group(group: Option<u32>) {
    let Some(pid) = group else {
        return;
    };
    // The child leads its own group, see `process_group(0)`
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!("killpg({}) failed: {}", pid, err);
        }
    }
}

/// Kill the child's process group and reap the child
async fn terminate(child: &mut Child, program: &str) {
    kill_group(child.id());
    if let Err(e) = child.kill().await {
        warn!("failed to reap {}: {}", program, e);
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("failed to read tool output: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
