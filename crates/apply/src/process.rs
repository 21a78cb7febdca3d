//! External process capability. The orchestrator only ever talks to kubectl
//! through [`ProcessRunner`], so tests can script the outcomes.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self { Self { program: program.into(), ..Default::default() } }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `program arg arg`, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)).collect::<Vec<_>>().join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn ok(stdout: impl Into<String>) -> Self { Self { exit_code: Some(0), stdout: stdout.into(), stderr: String::new() } }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self { exit_code: Some(code), stdout: String::new(), stderr: stderr.into() }
    }

    pub fn success(&self) -> bool { self.exit_code == Some(0) }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, #[source] source: std::io::Error },
    #[error("process io: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Requests termination of an in-flight operation. Dropping it without
/// calling `cancel` never cancels.
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Receiving side of a [`CancelHandle`].
#[derive(Debug, Default)]
pub struct CancelSignal {
    rx: Option<oneshot::Receiver<()>>,
    fired: bool,
}

impl CancelSignal {
    pub fn never() -> Self { Self::default() }
    pub fn is_cancelled(&self) -> bool { self.fired }

    /// Resolves once cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&mut self) {
        if self.fired { return; }
        if let Some(rx) = self.rx.as_mut() {
            if rx.await.is_ok() {
                self.fired = true;
                return;
            }
            self.rx = None;
        }
        std::future::pending::<()>().await
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = oneshot::channel();
    (CancelHandle { tx: Some(tx) }, CancelSignal { rx: Some(rx), fired: false })
}

#[async_trait::async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, timeout: Duration, cancel: &mut CancelSignal) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands with tokio. The child is killed if the call times out or is
/// cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait::async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration, cancel: &mut CancelSignal) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn { program: spec.program.clone(), source })?;
        // Fed from a task so a child that never drains stdin still hits the timeout.
        let writer = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            })),
            _ => None,
        };
        debug!(command = %spec.display(), "process started");
        let res = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
                Ok(Ok(out)) => Ok(ProcessOutput {
                    exit_code: out.status.code(),
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                }),
                Ok(Err(e)) => Err(ProcessError::Io(e)),
                Err(_) => Err(ProcessError::Timeout(timeout)),
            },
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
        };
        if let Some(writer) = writer {
            if res.is_err() {
                writer.abort();
            } else if let Ok(Err(e)) = writer.await {
                // the child may exit before reading everything; its exit status decides
                debug!(command = %spec.display(), error = %e, "stdin not fully written");
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("kubectl").args(["get", "pods"]).stdin("x");
        assert_eq!(spec.display(), "kubectl get pods");
        assert_eq!(spec.stdin.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn cancel_signal_fires_once_requested() {
        let (handle, mut signal) = cancel_pair();
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_handle_never_cancels() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        let res = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(res.is_err());
        assert!(!signal.is_cancelled());
    }

    fn sh(script: &str) -> CommandSpec { CommandSpec::new("sh").args(["-c", script]) }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_covers_child_that_never_reads_stdin() {
        let spec = sh("sleep 5").stdin("x".repeat(1 << 20));
        let started = std::time::Instant::now();
        let res = SystemRunner.run(&spec, Duration::from_millis(200), &mut CancelSignal::never()).await;
        assert!(matches!(res, Err(ProcessError::Timeout(_))), "got {:?}", res);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_reaches_child_blocked_on_stdin() {
        let spec = sh("sleep 5").stdin("x".repeat(1 << 20));
        let (handle, mut signal) = cancel_pair();
        let started = std::time::Instant::now();
        let run = SystemRunner.run(&spec, Duration::from_secs(30), &mut signal);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        };
        let (res, ()) = tokio::join!(run, cancel);
        assert!(matches!(res, Err(ProcessError::Cancelled)), "got {:?}", res);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_reaches_child_that_reads_it() {
        let spec = sh("cat").stdin("kind: Pod\n");
        let out = SystemRunner.run(&spec, Duration::from_secs(5), &mut CancelSignal::never()).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "kind: Pod\n");
    }
}
