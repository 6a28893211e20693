//! Process Runner
//!
//! The only I/O boundary of the execution layer. A [`ProcessRunner`] takes a
//! fully validated [`CommandInvocation`] and starts the program directly,
//! never through a shell. The secure executor owns timeouts and
//! cancellation; runners only spawn and wait.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, Command as TokioCommand};

/// Bytes of streamed stderr kept for failure classification
pub const STDERR_TAIL_LIMIT: usize = 64 * 1024;

/// Where the child's stdout/stderr go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Stream to the caller's terminal, keeping the tail of stderr
    Inherit,

    /// Capture into the returned [`ProcessOutput`]
    Capture,
}

/// One subprocess request, built fresh for every call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Program to run
    pub name: String,

    /// Arguments, passed verbatim
    pub args: Vec<String>,

    /// Complete, already filtered environment as `KEY=VALUE` entries
    pub env: Vec<String>,

    /// Working directory (default: inherit the caller's)
    pub working_dir: Option<PathBuf>,
}

impl CommandInvocation {
    /// The command as a single display line
    pub fn command_line(&self) -> String {
        command_line(&self.name, self.args.as_slice())
    }
}

/// Join a command name and its arguments for display
pub fn command_line<S: AsRef<str>>(name: &str, args: &[S]) -> String {
    let mut line = name.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg.as_ref());
    }
    line
}

/// Result of a process that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code (None if the process was terminated by a signal)
    pub exit_code: Option<i32>,

    /// Whether the process exited successfully
    pub success: bool,

    /// Captured stdout (empty in [`OutputMode::Inherit`])
    pub stdout: String,

    /// Captured stderr (the last [`STDERR_TAIL_LIMIT`] bytes in
    /// [`OutputMode::Inherit`])
    pub stderr: String,
}

impl ProcessOutput {
    /// Create a success result
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Create a failure result
    pub fn failure(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// Failure of the spawn primitive itself
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started
    #[error("failed to start process: {0}")]
    Spawn(#[source] io::Error),

    /// The program started but waiting on it failed
    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

/// Spawn-and-wait primitive used by the secure executor
#[async_trait]
pub trait ProcessRunner: Send + Sync + std::fmt::Debug {
    /// Run the invocation to completion
    ///
    /// Dropping the returned future must stop the child process.
    async fn run(
        &self,
        invocation: &CommandInvocation,
        mode: OutputMode,
    ) -> Result<ProcessOutput, ProcessError>;
}

/// Runner backed by `tokio::process::Command`
///
/// The environment is cleared and replaced with the invocation's entries,
/// and children are killed when the waiting future is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRunner;

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(
        &self,
        invocation: &CommandInvocation,
        mode: OutputMode,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut process = TokioCommand::new(&invocation.name);
        process
            .args(&invocation.args)
            .env_clear()
            .stdin(Stdio::null())
            .kill_on_drop(true);

        for entry in &invocation.env {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    process.env(key, value);
                }
                _ => tracing::debug!("Skipping malformed environment entry"),
            }
        }

        if let Some(ref dir) = invocation.working_dir {
            process.current_dir(dir);
        }

        match mode {
            OutputMode::Inherit => {
                process.stdout(Stdio::inherit()).stderr(Stdio::piped());
                let mut child = process.spawn().map_err(ProcessError::Spawn)?;
                let stderr = child.stderr.take();
                let (status, stderr) = tokio::join!(child.wait(), tee_stderr(stderr));
                let status = status.map_err(ProcessError::Wait)?;
                Ok(ProcessOutput {
                    exit_code: status.code(),
                    success: status.success(),
                    stdout: String::new(),
                    stderr,
                })
            }
            OutputMode::Capture => {
                process.stdout(Stdio::piped()).stderr(Stdio::piped());
                let child = process.spawn().map_err(ProcessError::Spawn)?;
                let output = child.wait_with_output().await.map_err(ProcessError::Wait)?;
                Ok(ProcessOutput {
                    exit_code: output.status.code(),
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}

/// Copy the child's stderr to ours, returning its last [`STDERR_TAIL_LIMIT`] bytes
async fn tee_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut sink = tokio::io::stderr();
    let mut tail = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = sink.write_all(&buf[..n]).await {
                    tracing::debug!("Failed to forward child stderr: {}", e);
                }
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_LIMIT {
                    let excess = tail.len() - STDERR_TAIL_LIMIT;
                    tail.drain(..excess);
                }
            }
            Err(e) => {
                tracing::debug!("Failed to read child stderr: {}", e);
                break;
            }
        }
    }
    let _ = sink.flush().await;

    String::from_utf8_lossy(&tail).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(name: &str, args: &[&str]) -> CommandInvocation {
        CommandInvocation {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            working_dir: None,
        }
    }

    #[test]
    fn test_command_line() {
        assert_eq!(invocation("echo", &["a", "b"]).command_line(), "echo a b");
        assert_eq!(command_line::<&str>("true", &[]), "true");
    }

    #[test]
    fn test_combined_output_order() {
        let output = ProcessOutput {
            exit_code: Some(1),
            success: false,
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
        };
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_echo() {
        let output = TokioRunner
            .run(&invocation("echo", &["hello world"]), OutputMode::Capture)
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "hello world\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command() {
        let output = TokioRunner
            .run(&invocation("false", &[]), OutputMode::Capture)
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inherit_keeps_stderr_tail() {
        let output = TokioRunner
            .run(
                &invocation("sh", &["-c", "echo out\necho 'connection refused' >&2\nexit 1"]),
                OutputMode::Inherit,
            )
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(1));
        assert!(output.stdout.is_empty());
        assert_eq!(output.stderr, "connection refused\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inherit_stderr_tail_is_bounded() {
        let output = TokioRunner
            .run(
                &invocation("sh", &["-c", "head -c 200000 /dev/zero | tr '\\0' x >&2\nprintf end >&2"]),
                OutputMode::Inherit,
            )
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stderr.len(), STDERR_TAIL_LIMIT);
        assert!(output.stderr.ends_with("xend"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_is_replaced() {
        let mut inv = invocation("env", &[]);
        inv.env.push("BUILDGUARD_MARKER=1".to_string());
        inv.env.push("MALFORMED".to_string());
        let output = TokioRunner.run(&inv, OutputMode::Capture).await.unwrap();
        assert!(output.stdout.contains("BUILDGUARD_MARKER=1"));
        assert!(!output.stdout.contains("MALFORMED"));
        assert!(!output.stdout.contains("HOME="));
    }

    #[tokio::test]
    async fn test_nonexistent_command() {
        let result = TokioRunner
            .run(
                &invocation("this-command-does-not-exist-12345", &[]),
                OutputMode::Capture,
            )
            .await;
        assert!(matches!(result, Err(ProcessError::Spawn(_))));
    }
}
