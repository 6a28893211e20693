//! Execution Error Types
//!
//! This module defines the failure taxonomy shared by the validators, the
//! secure executor, the retry loop and the recording stand-in.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Category of a failed validation check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationKind {
    /// Command name is not in the configured allowlist
    NotAllowed,

    /// Shell metacharacters or script/markup injection
    Injection,

    /// Path traversal or escape from the allowed root
    Traversal,

    /// Input is not valid UTF-8
    InvalidEncoding,

    /// NUL byte, newline or other control character
    ControlCharacter,

    /// Input does not have the expected shape
    FormatMismatch,

    /// Numeric value outside the permitted range
    RangeViolation,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValidationKind::NotAllowed => "not allowed",
            ValidationKind::Injection => "injection",
            ValidationKind::Traversal => "traversal",
            ValidationKind::InvalidEncoding => "invalid encoding",
            ValidationKind::ControlCharacter => "control character",
            ValidationKind::FormatMismatch => "format mismatch",
            ValidationKind::RangeViolation => "range violation",
        };
        f.write_str(label)
    }
}

/// A rejected input, tagged with its category and the offending fragment
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {reason} ({fragment:?})")]
pub struct ValidationError {
    kind: ValidationKind,
    reason: &'static str,
    fragment: String,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, reason: &'static str, fragment: impl Into<String>) -> Self {
        Self {
            kind,
            reason,
            fragment: fragment.into(),
        }
    }

    pub fn kind(&self) -> ValidationKind {
        self.kind
    }

    /// The part of the input that triggered the rejection
    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// Why an execution context stopped a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The context's cancellation token fired
    Cancelled,

    /// The context's deadline passed
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("was cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("exceeded the caller's deadline"),
        }
    }
}

/// Failure of a process that was successfully started
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeFailure {
    /// Process exited unsuccessfully
    #[error("exited with {}", describe_exit(.code))]
    Exit {
        /// Exit code (None if the process was killed by a signal)
        code: Option<i32>,

        /// Captured output; only the stderr tail when output was streamed
        output: String,
    },

    /// Process outlived the executor's timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Waiting on the process failed
    #[error("I/O error while waiting for process: {0}")]
    Io(#[source] Arc<io::Error>),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// How a caller should present a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input; fix the invocation
    Usage,

    /// The command ran (or tried to) and failed
    Operational,

    /// The caller gave up
    Cancelled,
}

/// Error returned by every executor operation
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    /// Name or argument rejected before any process existed
    #[error("command validation failed for '{command}'{}: {source}", describe_argument(.argument))]
    Validation {
        command: String,
        argument: Option<String>,
        #[source]
        source: ValidationError,
    },

    /// The program could not be started
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The program started but did not succeed
    #[error("command '{command}' failed: {failure}")]
    Runtime {
        command: String,
        #[source]
        failure: RuntimeFailure,
    },

    /// The execution context was cancelled or its deadline passed
    #[error("command '{command}' {reason}")]
    Cancelled {
        command: String,
        reason: CancelReason,
    },

    /// A retriable failure outlasted the attempt budget
    #[error("command '{command}' still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        command: String,
        attempts: usize,
        #[source]
        last: Box<ExecError>,
    },
}

fn describe_argument(argument: &Option<String>) -> String {
    match argument {
        Some(arg) => format!(" (argument {:?})", arg),
        None => String::new(),
    }
}

impl ExecError {
    pub(crate) fn validation(command: &str, argument: Option<&str>, source: ValidationError) -> Self {
        ExecError::Validation {
            command: command.to_string(),
            argument: argument.map(str::to_string),
            source,
        }
    }

    pub(crate) fn cancelled(command: &str, reason: CancelReason) -> Self {
        ExecError::Cancelled {
            command: command.to_string(),
            reason,
        }
    }

    /// Name of the command the failure belongs to
    pub fn command(&self) -> &str {
        match self {
            ExecError::Validation { command, .. }
            | ExecError::Spawn { command, .. }
            | ExecError::Runtime { command, .. }
            | ExecError::Cancelled { command, .. }
            | ExecError::RetriesExhausted { command, .. } => command,
        }
    }

    /// Map the failure to the remediation a caller should suggest
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecError::Validation { .. } => ErrorCategory::Usage,
            ExecError::Cancelled { .. } => ErrorCategory::Cancelled,
            ExecError::Spawn { .. }
            | ExecError::Runtime { .. }
            | ExecError::RetriesExhausted { .. } => ErrorCategory::Operational,
        }
    }

    /// The validation failure, if this is one
    pub fn validation_error(&self) -> Option<&ValidationError> {
        match self {
            ExecError::Validation { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Output captured from the failed process, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::Runtime {
                failure: RuntimeFailure::Exit { output, .. },
                ..
            } => Some(output),
            ExecError::RetriesExhausted { last, .. } => last.output(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_validation_error_display_quotes_fragment() {
        let err = ValidationError::new(ValidationKind::ControlCharacter, "path contains a control character", "\0");
        assert_eq!(err.to_string(), "control character: path contains a control character (\"\\0\")");
        assert_eq!(err.fragment(), "\0");
    }

    #[test]
    fn test_exec_error_mentions_argument() {
        let err = ExecError::validation(
            "echo",
            Some("$(id)"),
            ValidationError::new(ValidationKind::Injection, "shell metacharacter sequence", "$("),
        );
        let msg = err.to_string();
        assert!(msg.contains("'echo'"));
        assert!(msg.contains("$(id)"));
        assert_eq!(err.category(), ErrorCategory::Usage);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_categories() {
        let spawn = ExecError::Spawn {
            command: "nope".to_string(),
            source: Arc::new(io::Error::from(io::ErrorKind::NotFound)),
        };
        assert_eq!(spawn.category(), ErrorCategory::Operational);

        let cancelled = ExecError::cancelled("sleep", CancelReason::DeadlineExceeded);
        assert_eq!(cancelled.category(), ErrorCategory::Cancelled);
        assert!(cancelled.to_string().contains("deadline"));
    }

    #[test]
    fn test_exhausted_exposes_last_output() {
        let last = ExecError::Runtime {
            command: "go".to_string(),
            failure: RuntimeFailure::Exit {
                code: Some(1),
                output: "dial tcp: i/o timeout".to_string(),
            },
        };
        let err = ExecError::RetriesExhausted {
            command: "go".to_string(),
            attempts: 3,
            last: Box::new(last),
        };
        assert_eq!(err.output(), Some("dial tcp: i/o timeout"));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_signal_exit_description() {
        let failure = RuntimeFailure::Exit {
            code: None,
            output: String::new(),
        };
        assert!(failure.to_string().contains("signal"));
    }
}
