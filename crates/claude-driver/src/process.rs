use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use crate::{DriverError, Result};

// ─── ProcessRunner ────────────────────────────────────────────────────────

/// Capability to start external subprocesses.
///
/// Production code uses [`TokioRunner`]; tests substitute runners that spawn
/// `cat`/`sh` or that record the requested argument vector without spawning
/// anything. Every started child must be paired with exactly one
/// [`ChildHandle::wait_graceful`] (or [`ChildHandle::kill`]).
pub trait ProcessRunner: Send + Sync {
    fn start(&self, program: &str, args: &[String]) -> Result<ChildHandle>;
}

/// Spawns real subprocesses via `tokio::process`.
///
/// stdin is closed at launch (the protocol reads no stdin), stdout is piped
/// for the stream-json frames, and stderr is left to the CLI's diagnostics.
#[derive(Debug, Clone, Default)]
pub struct TokioRunner;

impl ProcessRunner for TokioRunner {
    fn start(&self, program: &str, args: &[String]) -> Result<ChildHandle> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        ChildHandle::spawn(cmd, program)
    }
}

// ─── ChildHandle ──────────────────────────────────────────────────────────

/// A running subprocess with line-oriented stdout.
///
/// Owned exclusively by whoever drives the session; after
/// [`ChildHandle::wait_graceful`] returns no more IO happens on the child.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl ChildHandle {
    /// Spawn `cmd`, capturing stdout. `program` is only used in error text.
    pub fn spawn(mut cmd: Command, program: &str) -> Result<Self> {
        cmd.stdout(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            program: program.to_owned(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Process("stdout not captured".into()))?;
        let lines = BufReader::new(stdout).lines();
        Ok(Self { child, lines })
    }

    /// Read the next raw stdout line. `Ok(None)` on EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.lines.next_line().await.map_err(DriverError::Io)
    }

    /// Kill the subprocess (best-effort; errors are silently ignored).
    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }

    /// Wait for the child with a bounded grace period, force-killing on
    /// expiry, and return its exit status.
    pub async fn wait_graceful(&mut self, grace: Duration) -> Result<std::process::ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map_err(DriverError::Io),
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "subprocess did not exit in grace period, killing");
                self.kill().await;
                self.child.wait().await.map_err(DriverError::Io)
            }
        }
    }
}

// ─── ClaudeCommand ────────────────────────────────────────────────────────

/// Argument builder for the assistant CLI's non-interactive streaming mode.
///
/// Produces `[--resume <id>,] -p <prompt> --verbose --output-format
/// stream-json --model <name>`; the resume token leads so a continuation is
/// visible at a glance in process listings.
#[derive(Debug, Clone)]
pub struct ClaudeCommand {
    pub binary: String,
    pub model: String,
    pub prompt: String,
    pub resume: Option<String>,
}

impl ClaudeCommand {
    pub fn new(binary: impl Into<String>, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            prompt: prompt.into(),
            resume: None,
        }
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume = Some(session_id.into());
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(id) = &self.resume {
            args.push("--resume".to_owned());
            args.push(id.clone());
        }
        args.extend([
            "-p".to_owned(),
            self.prompt.clone(),
            "--verbose".to_owned(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--model".to_owned(),
            self.model.clone(),
        ]);
        args
    }

    /// Start this command through `runner`.
    pub fn start(&self, runner: &dyn ProcessRunner) -> Result<ChildHandle> {
        runner.start(&self.binary, &self.args())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
