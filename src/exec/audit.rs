//! Command Audit Records
//!
//! One JSON record per executor call, emitted on the `buildguard::audit`
//! tracing target so operators can route it separately from diagnostics.
//! Arguments are counted, never recorded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Tracing target for audit records
pub const AUDIT_TARGET: &str = "buildguard::audit";

/// How a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    DryRun,
    Rejected,
    SpawnFailed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Structured record of a single command execution
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub arg_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub success: bool,
    pub dry_run: bool,
    pub outcome: AuditOutcome,
}

impl AuditEvent {
    pub fn new(command: &str, arg_count: usize, working_dir: Option<&Path>, dry_run: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            command: command.to_string(),
            arg_count,
            working_dir: working_dir.map(|dir| dir.display().to_string()),
            duration_ms: 0,
            exit_code: None,
            success: false,
            dry_run,
            outcome: AuditOutcome::Failed,
        }
    }

    /// Fill in the result of the call
    pub fn finish(mut self, outcome: AuditOutcome, exit_code: Option<i32>, elapsed: Duration) -> Self {
        self.outcome = outcome;
        self.exit_code = exit_code;
        self.success = matches!(outcome, AuditOutcome::Success | AuditOutcome::DryRun);
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Emit the record. Serialization problems are logged and swallowed.
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => tracing::info!(target: AUDIT_TARGET, "{}", json),
            Err(e) => tracing::debug!("Failed to serialize audit record: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_json() {
        let event = AuditEvent::new("go", 2, Some(Path::new("/tmp/build")), false).finish(
            AuditOutcome::Success,
            Some(0),
            Duration::from_millis(1500),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["command"], "go");
        assert_eq!(value["arg_count"], 2);
        assert_eq!(value["working_dir"], "/tmp/build");
        assert_eq!(value["duration_ms"], 1500);
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["success"], true);
        assert_eq!(value["outcome"], "success");
        assert!(value.get("args").is_none());
    }

    #[test]
    fn test_failed_event_omits_missing_fields() {
        let event = AuditEvent::new("rm", 1, None, false).finish(
            AuditOutcome::Rejected,
            None,
            Duration::ZERO,
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["outcome"], "rejected");
        assert!(value.get("exit_code").is_none());
        assert!(value.get("working_dir").is_none());
    }

    #[test]
    fn test_dry_run_counts_as_success() {
        let event = AuditEvent::new("rm", 1, None, true).finish(
            AuditOutcome::DryRun,
            None,
            Duration::ZERO,
        );
        assert!(event.success);
        assert!(event.dry_run);
        event.emit();
    }
}
