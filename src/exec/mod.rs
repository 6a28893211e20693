//! Secure Command Execution
//!
//! Input validation and process execution for the build pipeline.
//!
//! - [`validator`]: pattern validators for arguments, paths, versions, git
//!   refs, filenames, URLs, emails, ports and variable names
//! - [`env_filter`]: strips credential-bearing variables from child
//!   environments
//! - [`retry`]: transient/permanent classification and exponential backoff
//! - [`executor`]: the [`SecureExecutor`] and the [`CommandExecutor`] trait
//! - [`recording`]: a [`CommandExecutor`] that records calls for tests

pub mod audit;
pub mod context;
pub mod env_filter;
pub mod error;
pub mod executor;
pub mod recording;
pub mod retry;
pub mod runner;
pub mod timeout;
pub mod validator;

pub use context::ExecContext;
pub use env_filter::{is_sensitive, EnvFilter, EnvWhitelist, SENSITIVE_PREFIXES};
pub use error::{
    CancelReason, ErrorCategory, ExecError, RuntimeFailure, ValidationError, ValidationKind,
};
pub use executor::{CommandExecutor, ExecutorConfig, SecureExecutor};
pub use recording::{CallKind, CommandCall, RecordingExecutor};
pub use retry::{is_retriable, is_transient, RetryPolicy};
pub use runner::{CommandInvocation, OutputMode, ProcessError, ProcessOutput, ProcessRunner, TokioRunner};
pub use timeout::ExecutionTimeout;
pub use validator::{
    clean_path, validate_command_arg, validate_command_arg_bytes, validate_email,
    validate_env_var_name, validate_filename, validate_git_ref, validate_path,
    validate_path_within, validate_port, validate_url, validate_utf8, validate_version,
    validate_version_bytes, validate_working_dir, CommandValidator,
};
