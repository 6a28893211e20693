//! Recording Executor
//!
//! A [`CommandExecutor`] for tests of code that runs commands. It stores
//! every call in order and answers with pre-programmed responses; it never
//! spawns a process.
//!
//! Responses are keyed by the command line, `"name arg1 arg2"` (just
//! `"name"` without arguments). A queued one-shot response for a key is
//! used before any persistent response; unknown commands succeed with empty
//! output.
//!
//! # Example
//!
//! ```
//! use buildguard::exec::{CommandExecutor, ExecContext, RecordingExecutor};
//!
//! # tokio_test_block_on(async {
//! let recorder = RecordingExecutor::new();
//! recorder.set_response("git describe --tags", "v1.2.3", None);
//!
//! let tag = recorder
//!     .execute_output(&ExecContext::new(), "git", &["describe", "--tags"])
//!     .await
//!     .unwrap();
//! assert_eq!(tag, "v1.2.3");
//! assert_eq!(recorder.call_count(), 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use super::context::ExecContext;
use super::error::ExecError;
use super::executor::CommandExecutor;
use super::runner::command_line;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Which executor operation produced a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Execute,
    ExecuteOutput,
    ExecuteWithEnv,
}

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCall {
    pub kind: CallKind,
    pub name: String,
    pub args: Vec<String>,
    /// Environment overrides as `KEY=VALUE` (empty unless `ExecuteWithEnv`)
    pub env: Vec<String>,
}

impl CommandCall {
    /// Response key for this call
    pub fn key(&self) -> String {
        command_line(&self.name, self.args.as_slice())
    }
}

/// Pre-programmed result for a command line
#[derive(Debug, Clone, Default)]
pub struct CommandResponse {
    pub output: String,
    pub error: Option<ExecError>,
}

impl CommandResponse {
    fn into_result(self) -> Result<String, ExecError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.output),
        }
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    calls: Vec<CommandCall>,
    responses: HashMap<String, CommandResponse>,
    queued: HashMap<String, VecDeque<CommandResponse>>,
}

/// Test stand-in that records calls instead of running them
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    state: Mutex<RecorderState>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the response key for a command
    pub fn call_key(name: &str, args: &[&str]) -> String {
        command_line(name, args)
    }

    fn state(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer every call to `command` with this output/error pair
    pub fn set_response(&self, command: impl Into<String>, output: impl Into<String>, error: Option<ExecError>) {
        self.state().responses.insert(
            command.into(),
            CommandResponse {
                output: output.into(),
                error,
            },
        );
    }

    /// Answer the next call to `command` once, ahead of any persistent response
    pub fn queue_response(&self, command: impl Into<String>, output: impl Into<String>, error: Option<ExecError>) {
        self.state()
            .queued
            .entry(command.into())
            .or_default()
            .push_back(CommandResponse {
                output: output.into(),
                error,
            });
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<CommandCall> {
        self.state().calls.clone()
    }

    /// Calls of one kind, in order
    pub fn calls_of(&self, kind: CallKind) -> Vec<CommandCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.kind == kind)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Forget recorded calls and programmed responses
    pub fn reset(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.responses.clear();
        state.queued.clear();
    }

    fn record(&self, kind: CallKind, env: &[(&str, &str)], name: &str, args: &[&str]) -> Result<String, ExecError> {
        let call = CommandCall {
            kind,
            name: name.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
        };
        let key = call.key();

        let mut state = self.state();
        state.calls.push(call);
        let queued = state.queued.get_mut(&key).and_then(VecDeque::pop_front);
        let response = queued
            .or_else(|| state.responses.get(&key).cloned())
            .unwrap_or_default();
        drop(state);

        tracing::debug!("Recorded call: {}", key);
        response.into_result()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, _ctx: &ExecContext, name: &str, args: &[&str]) -> Result<(), ExecError> {
        self.record(CallKind::Execute, &[], name, args).map(|_| ())
    }

    async fn execute_output(
        &self,
        _ctx: &ExecContext,
        name: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        self.record(CallKind::ExecuteOutput, &[], name, args)
    }

    async fn execute_with_env(
        &self,
        _ctx: &ExecContext,
        env: &[(&str, &str)],
        name: &str,
        args: &[&str],
    ) -> Result<(), ExecError> {
        self.record(CallKind::ExecuteWithEnv, env, name, args).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::error::RuntimeFailure;
    use std::time::Duration;

    fn network_failure() -> ExecError {
        ExecError::Runtime {
            command: "go".to_string(),
            failure: RuntimeFailure::Exit {
                code: Some(1),
                output: "connection reset by peer".to_string(),
            },
        }
    }

    #[test]
    fn test_call_key() {
        assert_eq!(RecordingExecutor::call_key("git", &["tag", "-l"]), "git tag -l");
        assert_eq!(RecordingExecutor::call_key("pwd", &[]), "pwd");
    }

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let recorder = RecordingExecutor::new();
        let ctx = ExecContext::new();

        recorder.execute(&ctx, "go", &["build"]).await.unwrap();
        recorder.execute_output(&ctx, "git", &["status"]).await.unwrap();
        recorder
            .execute_with_env(&ctx, &[("GOOS", "linux")], "go", &["test"])
            .await
            .unwrap();

        let calls = recorder.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].kind, CallKind::Execute);
        assert_eq!(calls[1].name, "git");
        assert_eq!(calls[2].env, vec!["GOOS=linux".to_string()]);
        assert_eq!(recorder.calls_of(CallKind::ExecuteOutput).len(), 1);
    }

    #[tokio::test]
    async fn test_programmed_error() {
        let recorder = RecordingExecutor::new();
        recorder.set_response("go test", "", Some(network_failure()));

        let err = recorder
            .execute(&ExecContext::new(), "go", &["test"])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Runtime { .. }));

        // Other argument lists do not match the key
        recorder
            .execute(&ExecContext::new(), "go", &["test", "-v"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_queued_responses_take_priority() {
        let recorder = RecordingExecutor::new();
        recorder.set_response("git rev-parse HEAD", "persistent", None);
        recorder.queue_response("git rev-parse HEAD", "first", None);
        let ctx = ExecContext::new();

        let args = ["rev-parse", "HEAD"];
        assert_eq!(recorder.execute_output(&ctx, "git", &args).await.unwrap(), "first");
        assert_eq!(recorder.execute_output(&ctx, "git", &args).await.unwrap(), "persistent");
        assert_eq!(recorder.execute_output(&ctx, "git", &args).await.unwrap(), "persistent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_runs_over_recorded_attempts() {
        let recorder = RecordingExecutor::new();
        recorder.queue_response("go mod download", "", Some(network_failure()));
        recorder.queue_response("go mod download", "", Some(network_failure()));

        recorder
            .execute_with_retry(
                &ExecContext::new(),
                3,
                Duration::from_millis(100),
                "go",
                &["mod", "download"],
            )
            .await
            .unwrap();
        assert_eq!(recorder.call_count(), 3);
    }

    #[tokio::test]
    async fn test_reset() {
        let recorder = RecordingExecutor::new();
        recorder.set_response("ls", "x", None);
        recorder.execute(&ExecContext::new(), "ls", &[]).await.unwrap();
        recorder.reset();
        assert_eq!(recorder.call_count(), 0);
        assert_eq!(
            recorder.execute_output(&ExecContext::new(), "ls", &[]).await.unwrap(),
            ""
        );
    }
}
