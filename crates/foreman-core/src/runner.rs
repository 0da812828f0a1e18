//! External process execution: spawn, time-bound, and collect output from
//! the LLM command and the quality-gate hooks.
//!
//! Every spawned child is tracked in a pid registry so the scheduler's
//! emergency stop can broadcast a kill to all outstanding children.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Grace window between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors from running an external process.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The executable could not be spawned (missing binary, bad cwd).
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded its deadline and was killed.
    #[error("{command:?} timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// I/O failure while feeding stdin or collecting output.
    #[error("i/o error while running {command:?}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// Timeouts and spawn failures are retryable; they count against the
    /// task's retry budget rather than aborting the cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Spawn { .. })
    }
}

/// A request to run an external command.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Fed to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl ProcessRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            stdin: None,
            cwd: None,
            timeout: Duration::from_secs(900),
        }
    }
}

/// Collected output of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external commands with a shared pid registry for emergency kill.
///
/// Cloning is cheap; clones share the registry.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    live_pids: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pids of currently outstanding children.
    pub fn live_pids(&self) -> Vec<u32> {
        let pids = self.live_pids.lock().unwrap_or_else(|e| e.into_inner());
        pids.iter().copied().collect()
    }

    /// Run a command to completion.
    ///
    /// On timeout the child receives SIGTERM, then SIGKILL after a 5 s
    /// grace window, and [`RunnerError::Timeout`] is returned -- a distinct
    /// failure class from a non-zero exit.
    pub async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, RunnerError> {
        let start = Instant::now();

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(ref cwd) = request.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            command: request.command.clone(),
            source,
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.register(pid);
        }

        // Feed stdin and close it so the child starts processing.
        if let Some(ref input) = request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!(command = %request.command, error = %e, "failed to write child stdin");
                }
                drop(stdin);
            }
        } else {
            drop(child.stdin.take());
        }

        // Read stdout/stderr concurrently with waiting so a chatty child
        // cannot deadlock on a full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let waited = tokio::time::timeout(request.timeout, async {
            let (status, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
            (status, stdout, stderr)
        })
        .await;

        let result = match waited {
            Ok((Ok(status), stdout, stderr)) => Ok(ProcessOutput {
                stdout,
                stderr,
                exit_code: status.code(),
                duration: start.elapsed(),
            }),
            Ok((Err(source), _, _)) => Err(RunnerError::Io {
                command: request.command.clone(),
                source,
            }),
            Err(_elapsed) => {
                warn!(
                    command = %request.command,
                    timeout_secs = request.timeout.as_secs(),
                    "process timed out, terminating"
                );
                Self::terminate(&mut child, pid).await;
                Err(RunnerError::Timeout {
                    command: request.command.clone(),
                    timeout_secs: request.timeout.as_secs(),
                })
            }
        };

        if let Some(pid) = pid {
            self.deregister(pid);
        }

        result
    }

    /// Broadcast SIGTERM to every outstanding child, escalate to SIGKILL
    /// for any child still registered after the grace window.
    pub async fn kill_all(&self) {
        let pids = self.live_pids();
        if pids.is_empty() {
            return;
        }

        warn!(count = pids.len(), "broadcasting SIGTERM to live children");
        for pid in &pids {
            signal_pid(*pid, TermSignal::Term);
        }

        tokio::time::sleep(KILL_GRACE).await;

        // run() deregisters children as they exit; whatever remains did not
        // honor SIGTERM.
        for pid in self.live_pids() {
            debug!(pid, "child survived grace window, sending SIGKILL");
            signal_pid(pid, TermSignal::Kill);
        }
    }

    /// Graceful termination for a single child: SIGTERM, grace, SIGKILL.
    async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            signal_pid(pid, TermSignal::Term);
        }

        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(_status)) => {
                debug!(?pid, "child exited after SIGTERM");
            }
            _ => {
                debug!(?pid, "child did not exit after SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
    }

    fn register(&self, pid: u32) {
        let mut pids = self.live_pids.lock().unwrap_or_else(|e| e.into_inner());
        pids.insert(pid);
    }

    fn deregister(&self, pid: u32) {
        let mut pids = self.live_pids.lock().unwrap_or_else(|e| e.into_inner());
        pids.remove(&pid);
    }
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: TermSignal) {
    let sig = match signal {
        TermSignal::Term => libc::SIGTERM,
        TermSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: pid came from a child we spawned; worst case the pid was
    // recycled and the signal is a no-op for us.
    let ret = unsafe { libc::kill(pid as i32, sig) };
    if ret != 0 {
        debug!(pid, ?signal, "kill(2) failed (process likely already gone)");
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: TermSignal) {}
