//! The external simulation engine as seen from this service.
//!
//! The engine is an opaque, independently deployed executable. Everything this
//! crate needs from it is captured by [`EngineRunner`]: run a command, feed it
//! an optional payload on stdin, and report stdout, stderr and the exit code.

use std::{
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};

pub mod handoff;

pub use handoff::{HandoffFiles, HandoffSlot};

/// How the serialized request reaches the engine.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// `engine` with the JSON on stdin and the result on stdout.
    #[default]
    Stdin,
    /// `engine <input_path> <output_path>`.
    File,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeliveryMode::Stdin => write!(f, "stdin"),
            DeliveryMode::File => write!(f, "file"),
        }
    }
}

/// One engine execution request.
#[derive(Clone, Debug)]
pub struct EngineCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Written to the child's stdin when present; stdin is null otherwise.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// Everything captured from a finished engine process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

#[derive(Debug)]
pub enum RunError {
    /// The process could not be started.
    Spawn(io::Error),
    /// Pipe I/O with a running process failed.
    Io(io::Error),
    /// The process exceeded its wall-clock bound and was killed.
    TimedOut(Duration),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Spawn(err) => write!(f, "Failed to spawn engine: {err}"),
            RunError::Io(err) => write!(f, "Engine I/O error: {err}"),
            RunError::TimedOut(timeout) => {
                write!(f, "Engine timed out after {}s", timeout.as_secs_f64())
            }
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Spawn(err) | RunError::Io(err) => Some(err),
            RunError::TimedOut(_) => None,
        }
    }
}

/// Capability to execute the engine: `invoke(input) -> (stdout, stderr, exit_code)`.
#[async_trait]
pub trait EngineRunner: Send + Sync {
    async fn run(&self, command: EngineCommand) -> Result<EngineOutput, RunError>;
}

/// Runs the engine as a child process of this service.
///
/// The child leads its own process group and is spawned with `kill_on_drop`.
/// When a run is abandoned (a disconnected caller or an expired timeout) the
/// whole group is killed, including helpers forked by a wrapper script.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl EngineRunner for ProcessRunner {
    async fn run(&self, command: EngineCommand) -> Result<EngineOutput, RunError> {
        let EngineCommand {
            program,
            args,
            stdin,
            timeout,
        } = command;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(RunError::Spawn)?;
        let mut group = ProcessGroup { pgid: child.id() };
        debug!(
            "Spawned engine {} (pid {:?})",
            program.display(),
            child.id()
        );

        let pipe = child.stdin.take();
        // Feed stdin concurrently with draining stdout/stderr so a chatty
        // engine cannot deadlock on a full pipe.
        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (pipe, stdin) {
                match pipe.write_all(&input).await {
                    Ok(()) => pipe.shutdown().await.or_else(ignore_broken_pipe),
                    Err(e) => ignore_broken_pipe(e),
                }
            } else {
                Ok(())
            }
        };

        let exchange = async move { tokio::join!(feed, child.wait_with_output()) };

        match tokio::time::timeout(timeout, exchange).await {
            Ok((fed, output)) => {
                group.disarm();
                fed.map_err(RunError::Io)?;
                let output = output.map_err(RunError::Io)?;
                Ok(EngineOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code(),
                })
            }
            // the dropped future owns the child, kill_on_drop reaps it and the
            // group guard takes down anything it forked
            Err(_) => Err(RunError::TimedOut(timeout)),
        }
    }
}

/// Kills the engine's process group on drop unless the run finished.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only signals; a group that is already gone yields ESRCH.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        debug!("Killed engine process group {pgid}");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

// An engine that exits without reading all of its input is judged by its exit
// code and output, not by the write failure.
fn ignore_broken_pipe(err: io::Error) -> io::Result<()> {
    if err.kind() == io::ErrorKind::BrokenPipe {
        debug!("Engine closed stdin before reading the whole payload");
        Ok(())
    } else {
        Err(err)
    }
}

/// Returns the first candidate that exists as a file.
///
/// Called per request so a redeployed engine is picked up without a restart.
/// A bare file name is returned as `./name`, since spawning a bare name would
/// search `PATH` instead of the working directory it was found in.
pub async fn resolve_executable<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    for candidate in candidates {
        let candidate = candidate.as_ref();
        match tokio::fs::metadata(candidate).await {
            Ok(meta) if meta.is_file() => return Some(anchor_to_working_dir(candidate)),
            Ok(_) => debug!("Engine candidate {} is not a file", candidate.display()),
            Err(e) => debug!("Engine candidate {} unavailable: {e}", candidate.display()),
        }
    }
    None
}

fn anchor_to_working_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new(".").join(path),
        _ => path.to_path_buf(),
    }
}

/// Diagnostic record of one engine run, discarded with the request.
#[derive(Clone, Debug)]
pub struct EngineInvocation {
    pub executable: PathBuf,
    pub delivery: DeliveryMode,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl EngineInvocation {
    pub fn new(
        executable: PathBuf,
        delivery: DeliveryMode,
        output: EngineOutput,
        elapsed: Duration,
    ) -> Self {
        Self {
            executable,
            delivery,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            elapsed,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}
