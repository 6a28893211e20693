//! Secure Executor
//!
//! This module runs external commands for the build pipeline with
//! validation, environment scrubbing, working-directory confinement,
//! timeouts, dry-run and optional retry.
//!
//! Every call follows the same order:
//!
//! 1. Validate the command name, every argument, environment override keys
//!    and the working directory. A failure returns before any process exists.
//! 2. Build the child environment from the current process environment plus
//!    overrides and pass it through the [`EnvFilter`].
//! 3. In dry-run mode, report what would run and stop.
//! 4. Spawn without a shell, bounded by the executor timeout and the
//!    caller's [`ExecContext`].
//! 5. Emit one audit record.

use super::audit::{AuditEvent, AuditOutcome};
use super::context::ExecContext;
use super::env_filter::{EnvFilter, EnvWhitelist};
use super::error::{ExecError, RuntimeFailure, ValidationError, ValidationKind};
use super::retry::{retry_with_backoff, RetryPolicy};
use super::runner::{
    command_line, CommandInvocation, OutputMode, ProcessError, ProcessOutput, ProcessRunner,
    TokioRunner,
};
use super::timeout::{ExecutionTimeout, Interruption};
use super::validator::{validate_env_var_name, validate_working_dir, CommandValidator};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default timeout for command execution in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Maximum captured output size in bytes (1MB)
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Prefix of the synthetic output produced in dry-run mode
pub const DRY_RUN_PREFIX: &str = "[DRY RUN] Would execute:";

/// Operations shared by the secure executor and the recording stand-in
///
/// Every operation takes the cancellable execution context first.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command, streaming its output to the terminal
    ///
    /// The tail of stderr is still kept, so a failure carries it for
    /// retry classification.
    async fn execute(&self, ctx: &ExecContext, name: &str, args: &[&str]) -> Result<(), ExecError>;

    /// Run a command and return its captured stdout followed by stderr
    async fn execute_output(
        &self,
        ctx: &ExecContext,
        name: &str,
        args: &[&str],
    ) -> Result<String, ExecError>;

    /// Run a command with extra environment variables
    ///
    /// Overrides replace inherited variables of the same name and are
    /// filtered like everything else.
    async fn execute_with_env(
        &self,
        ctx: &ExecContext,
        env: &[(&str, &str)],
        name: &str,
        args: &[&str],
    ) -> Result<(), ExecError>;

    /// Backoff policy used by the retry variants
    fn retry_policy(&self, max_attempts: usize, initial_delay: Duration) -> RetryPolicy {
        RetryPolicy::for_call(max_attempts, initial_delay)
    }

    /// [`execute`](Self::execute) with exponential backoff on transient failures
    async fn execute_with_retry(
        &self,
        ctx: &ExecContext,
        max_attempts: usize,
        initial_delay: Duration,
        name: &str,
        args: &[&str],
    ) -> Result<(), ExecError> {
        let policy = self.retry_policy(max_attempts, initial_delay);
        retry_with_backoff(ctx, &policy, name, || self.execute(ctx, name, args)).await
    }

    /// [`execute_output`](Self::execute_output) with exponential backoff on
    /// transient failures
    async fn execute_output_with_retry(
        &self,
        ctx: &ExecContext,
        max_attempts: usize,
        initial_delay: Duration,
        name: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        let policy = self.retry_policy(max_attempts, initial_delay);
        retry_with_backoff(ctx, &policy, name, || self.execute_output(ctx, name, args)).await
    }
}

/// Configuration for the secure executor
///
/// Frozen once handed to [`SecureExecutor::with_config`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Command allowlist (empty means any validated name may run)
    pub allowed_commands: Vec<String>,

    /// Per-command exceptions to environment filtering
    pub env_whitelist: EnvWhitelist,

    /// Working directory for child processes (default: inherit)
    pub working_dir: Option<PathBuf>,

    /// Timeout for a single spawn (default: 300 seconds)
    pub timeout: Duration,

    /// Report commands instead of running them
    pub dry_run: bool,

    /// Maximum captured output size in bytes (default: 1MB)
    pub max_output_size: usize,

    /// Delay cap and jitter applied by the retry variants
    pub backoff: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            env_whitelist: EnvWhitelist::release_defaults(),
            working_dir: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            dry_run: false,
            max_output_size: MAX_OUTPUT_SIZE,
            backoff: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict execution to the given command names
    pub fn allowed_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn env_whitelist(mut self, whitelist: EnvWhitelist) -> Self {
        self.env_whitelist = whitelist;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn max_output_size(mut self, size: usize) -> Self {
        self.max_output_size = size;
        self
    }

    pub fn backoff(mut self, policy: RetryPolicy) -> Self {
        self.backoff = policy;
        self
    }
}

/// Command executor with input validation and environment scrubbing
///
/// # Security
///
/// 1. Programs are started directly with `tokio::process::Command`, never
///    through a shell
/// 2. Names and arguments are validated before anything is spawned
/// 3. Credential-bearing variables are stripped from the child environment
/// 4. Each spawn is bounded by a timeout; children are killed when a call is
///    cancelled or times out
///
/// The executor holds no mutable state and can be shared between tasks.
///
/// # Example
///
/// ```no_run
/// use buildguard::exec::{CommandExecutor, ExecContext, ExecutorConfig, SecureExecutor};
///
/// # async fn demo() -> Result<(), buildguard::exec::ExecError> {
/// let executor = SecureExecutor::with_config(ExecutorConfig::new().allowed_commands(["go"]));
/// let version = executor
///     .execute_output(&ExecContext::new(), "go", &["version"])
///     .await?;
/// println!("{}", version);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SecureExecutor {
    validator: CommandValidator,
    env_filter: EnvFilter,
    working_dir: Option<PathBuf>,
    timeout: ExecutionTimeout,
    dry_run: bool,
    max_output_size: usize,
    backoff: RetryPolicy,
    runner: Arc<dyn ProcessRunner>,
}

impl Default for SecureExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureExecutor {
    /// Create an executor with default configuration
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::default())
    }

    /// Create an executor from a configuration
    pub fn with_config(config: ExecutorConfig) -> Self {
        Self {
            validator: CommandValidator::with_allowlist(config.allowed_commands),
            env_filter: EnvFilter::new(config.env_whitelist),
            working_dir: config.working_dir,
            timeout: ExecutionTimeout::new(config.timeout),
            dry_run: config.dry_run,
            max_output_size: config.max_output_size,
            backoff: config.backoff,
            runner: Arc::new(TokioRunner),
        }
    }

    /// Replace the process-spawn primitive
    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    pub fn env_filter(&self) -> &EnvFilter {
        &self.env_filter
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.duration()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Environment `name` would receive, as `KEY=VALUE` entries
    pub fn child_env(&self, overrides: &[(&str, &str)], name: &str) -> Vec<String> {
        let mut env: Vec<String> = std::env::vars_os()
            .filter_map(|(key, value)| {
                let key = key.into_string().ok()?;
                if overrides.iter().any(|(k, _)| *k == key) {
                    return None;
                }
                let value = value.into_string().ok()?;
                Some(format!("{}={}", key, value))
            })
            .collect();
        env.extend(overrides.iter().map(|(k, v)| format!("{}={}", k, v)));
        self.env_filter.filter(&env, name)
    }

    /// Run one call end to end and emit its audit record
    async fn run(
        &self,
        ctx: &ExecContext,
        overrides: &[(&str, &str)],
        name: &str,
        args: &[&str],
        mode: OutputMode,
    ) -> Result<ProcessOutput, ExecError> {
        let start = Instant::now();
        let preview = command_preview(name, args);
        info!("Executing: {}", preview);

        let result = self.run_unaudited(ctx, overrides, name, args, mode).await;

        let (outcome, exit_code) = match &result {
            Ok(output) if self.dry_run => (AuditOutcome::DryRun, output.exit_code),
            Ok(output) => (AuditOutcome::Success, output.exit_code),
            Err(err) => {
                warn!("Command failed: {}: {}", preview, err);
                audit_failure(err)
            }
        };
        AuditEvent::new(name, args.len(), self.working_dir.as_deref(), self.dry_run)
            .finish(outcome, exit_code, start.elapsed())
            .emit();

        result
    }

    async fn run_unaudited(
        &self,
        ctx: &ExecContext,
        overrides: &[(&str, &str)],
        name: &str,
        args: &[&str],
        mode: OutputMode,
    ) -> Result<ProcessOutput, ExecError> {
        self.validator.validate(name, args)?;
        for (key, value) in overrides {
            validate_env_var_name(key).map_err(|e| ExecError::validation(name, Some(*key), e))?;
            if value.contains('\0') {
                return Err(ExecError::validation(
                    name,
                    Some(*key),
                    ValidationError::new(
                        ValidationKind::ControlCharacter,
                        "environment value contains a NUL byte",
                        "\0",
                    ),
                ));
            }
        }
        let working_dir = self
            .working_dir
            .as_deref()
            .map(validate_working_dir)
            .transpose()
            .map_err(|e| ExecError::validation(name, None, e))?;
        debug!("Command validated successfully");

        if let Some(reason) = ctx.state() {
            return Err(ExecError::cancelled(name, reason));
        }

        if self.dry_run {
            let message = format!("{} {}", DRY_RUN_PREFIX, command_line(name, args));
            info!("{}", message);
            return Ok(ProcessOutput {
                exit_code: None,
                success: true,
                stdout: message,
                stderr: String::new(),
            });
        }

        let invocation = CommandInvocation {
            name: name.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: self.child_env(overrides, name),
            working_dir,
        };

        let output = match self.timeout.run(ctx, self.runner.run(&invocation, mode)).await {
            Ok(Ok(output)) => output,
            Ok(Err(ProcessError::Spawn(e))) => {
                return Err(ExecError::Spawn {
                    command: name.to_string(),
                    source: Arc::new(e),
                })
            }
            Ok(Err(ProcessError::Wait(e))) => {
                return Err(ExecError::Runtime {
                    command: name.to_string(),
                    failure: RuntimeFailure::Io(Arc::new(e)),
                })
            }
            Err(Interruption::TimedOut(duration)) => {
                warn!("Command timed out after {:?}", duration);
                return Err(ExecError::Runtime {
                    command: name.to_string(),
                    failure: RuntimeFailure::Timeout(duration),
                });
            }
            Err(Interruption::Cancelled(reason)) => {
                return Err(ExecError::cancelled(name, reason));
            }
        };

        if output.success {
            Ok(output)
        } else {
            Err(ExecError::Runtime {
                command: name.to_string(),
                failure: RuntimeFailure::Exit {
                    code: output.exit_code,
                    output: truncate_string(output.combined(), self.max_output_size),
                },
            })
        }
    }
}

#[async_trait]
impl CommandExecutor for SecureExecutor {
    async fn execute(&self, ctx: &ExecContext, name: &str, args: &[&str]) -> Result<(), ExecError> {
        self.run(ctx, &[], name, args, OutputMode::Inherit).await?;
        Ok(())
    }

    async fn execute_output(
        &self,
        ctx: &ExecContext,
        name: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        let output = self.run(ctx, &[], name, args, OutputMode::Capture).await?;
        Ok(truncate_string(output.combined(), self.max_output_size))
    }

    async fn execute_with_env(
        &self,
        ctx: &ExecContext,
        env: &[(&str, &str)],
        name: &str,
        args: &[&str],
    ) -> Result<(), ExecError> {
        self.run(ctx, env, name, args, OutputMode::Inherit).await?;
        Ok(())
    }

    fn retry_policy(&self, max_attempts: usize, initial_delay: Duration) -> RetryPolicy {
        self.backoff
            .clone()
            .max_attempts(max_attempts)
            .base_delay(initial_delay)
    }
}

fn audit_failure(err: &ExecError) -> (AuditOutcome, Option<i32>) {
    match err {
        ExecError::Validation { .. } => (AuditOutcome::Rejected, None),
        ExecError::Spawn { .. } => (AuditOutcome::SpawnFailed, None),
        ExecError::Cancelled { .. } => (AuditOutcome::Cancelled, None),
        ExecError::Runtime {
            failure: RuntimeFailure::Timeout(_),
            ..
        } => (AuditOutcome::TimedOut, None),
        ExecError::Runtime {
            failure: RuntimeFailure::Exit { code, .. },
            ..
        } => (AuditOutcome::Failed, *code),
        ExecError::Runtime { .. } | ExecError::RetriesExhausted { .. } => {
            (AuditOutcome::Failed, None)
        }
    }
}

/// Command line for logs: short commands in full, long ones as name and count
fn command_preview(name: &str, args: &[&str]) -> String {
    if args.len() > 3 {
        format!("{} ... ({} args)", name, args.len())
    } else {
        command_line(name, args)
    }
}

/// Truncate a string to a maximum length, adding ellipsis if truncated
fn truncate_string(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut end = max_len.saturating_sub(3);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("...");
    }
    s
}
