//! Secure executor tests against real processes

#![cfg(unix)]

use buildguard::exec::{
    CommandExecutor, EnvWhitelist, ExecContext, ExecError, ExecutorConfig, RuntimeFailure,
    SecureExecutor, ValidationKind,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[tokio::test]
async fn test_execute_output_echo() {
    let executor = SecureExecutor::new();
    let output = executor
        .execute_output(&ExecContext::new(), "echo", &["hello world"])
        .await
        .unwrap();
    assert_eq!(output, "hello world\n");
}

#[tokio::test]
async fn test_arguments_are_not_shell_expanded() {
    let executor = SecureExecutor::new();
    let output = executor
        .execute_output(&ExecContext::new(), "echo", &["*", "$HOME"])
        .await;
    // `$HOME` contains no injection sequence but must reach echo verbatim
    assert_eq!(output.unwrap(), "* $HOME\n");
}

#[tokio::test]
async fn test_execute_streams_and_succeeds() {
    let executor = SecureExecutor::new();
    executor
        .execute(&ExecContext::new(), "true", &[])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_nonzero_exit_is_runtime_failure() {
    let executor = SecureExecutor::new();
    let err = executor
        .execute_output(&ExecContext::new(), "sh", &["-c", "printf boom\nexit 3"])
        .await
        .unwrap_err();

    match err {
        ExecError::Runtime {
            failure: RuntimeFailure::Exit { code, ref output },
            ..
        } => {
            assert_eq!(code, Some(3));
            assert_eq!(output, "boom");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_program_is_spawn_failure() {
    let executor = SecureExecutor::new();
    let err = executor
        .execute(&ExecContext::new(), "buildguard-no-such-program", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Spawn { .. }));
}

#[tokio::test]
async fn test_allowlist_blocks_other_commands() {
    let executor = SecureExecutor::with_config(ExecutorConfig::new().allowed_commands(["echo"]));
    let err = executor
        .execute(&ExecContext::new(), "rm", &["-rf", "/tmp/nothing-here"])
        .await
        .unwrap_err();
    assert_eq!(err.validation_error().unwrap().kind(), ValidationKind::NotAllowed);

    let err = executor
        .execute(&ExecContext::new(), "/bin/echo", &["hi"])
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Validation { .. }));
}

#[tokio::test]
async fn test_sensitive_override_never_reaches_child() {
    let executor = SecureExecutor::new();
    let ctx = ExecContext::new();

    let overrides = [("API_KEY", "leaked"), ("BUILDGUARD_VISIBLE", "yes")];

    executor
        .execute_with_env(&ctx, &overrides, "sh", &["-c", "test -z \"$API_KEY\""])
        .await
        .unwrap();
    executor
        .execute_with_env(
            &ctx,
            &overrides,
            "sh",
            &["-c", "test \"$BUILDGUARD_VISIBLE\" = yes"],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_whitelisted_command_keeps_token() {
    let executor = SecureExecutor::with_config(
        ExecutorConfig::new().env_whitelist(EnvWhitelist::new().allow("sh", ["NPM_TOKEN"])),
    );
    executor
        .execute_with_env(
            &ExecContext::new(),
            &[("NPM_TOKEN", "npm_abc")],
            "sh",
            &["-c", "test \"$NPM_TOKEN\" = npm_abc"],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_streamed_network_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    let attempts_log = dir.path().join("attempts");
    let script = dir.path().join("fetch.sh");
    std::fs::write(
        &script,
        format!(
            "echo attempt >> '{}'\necho 'dial tcp 10.0.0.1:443: connect: connection refused' >&2\nexit 1\n",
            attempts_log.display()
        ),
    )
    .unwrap();

    let executor = SecureExecutor::new();
    let err = executor
        .execute_with_retry(
            &ExecContext::new(),
            3,
            Duration::from_millis(10),
            "sh",
            &[script.to_str().unwrap()],
        )
        .await
        .unwrap_err();

    match err {
        ExecError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {:?}", other),
    }
    let log = std::fs::read_to_string(&attempts_log).unwrap();
    assert_eq!(log.lines().count(), 3);
}

#[tokio::test]
async fn test_streamed_failure_keeps_stderr() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("fail.sh");
    std::fs::write(&script, "echo 'undefined: main' >&2\nexit 2\n").unwrap();

    let executor = SecureExecutor::new();
    let err = executor
        .execute_with_retry(
            &ExecContext::new(),
            3,
            Duration::from_millis(10),
            "sh",
            &[script.to_str().unwrap()],
        )
        .await
        .unwrap_err();

    match err {
        ExecError::Runtime {
            failure: RuntimeFailure::Exit { code, ref output },
            ..
        } => {
            assert_eq!(code, Some(2));
            assert!(output.contains("undefined: main"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_working_dir() {
    let dir = TempDir::new().unwrap();
    let canonical = dir.path().canonicalize().unwrap();
    let executor = SecureExecutor::with_config(ExecutorConfig::new().working_dir(canonical.clone()));

    let output = executor
        .execute_output(&ExecContext::new(), "pwd", &[])
        .await
        .unwrap();
    assert_eq!(output.trim_end(), canonical.to_str().unwrap());
}

#[tokio::test]
async fn test_timeout_kills_long_command() {
    let executor =
        SecureExecutor::with_config(ExecutorConfig::new().timeout(Duration::from_millis(200)));
    let start = Instant::now();

    let err = executor
        .execute(&ExecContext::new(), "sleep", &["10"])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ExecError::Runtime {
            failure: RuntimeFailure::Timeout(_),
            ..
        }
    ));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_stops_running_command() {
    let executor = SecureExecutor::new();
    let ctx = ExecContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let err = executor.execute(&ctx, "sleep", &["10"]).await.unwrap_err();
    assert!(matches!(err, ExecError::Cancelled { .. }));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_dry_run_does_not_touch_filesystem() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("created");
    let target_arg = target.to_str().unwrap();

    let executor = SecureExecutor::with_config(ExecutorConfig::new().dry_run(true));
    let output = executor
        .execute_output(&ExecContext::new(), "touch", &[target_arg])
        .await
        .unwrap();

    assert_eq!(output, format!("[DRY RUN] Would execute: touch {}", target_arg));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_concurrent_calls_share_executor() {
    let executor = Arc::new(SecureExecutor::new());
    let ctx = ExecContext::new();

    let calls = (0..8).map(|i| {
        let executor = Arc::clone(&executor);
        let ctx = ctx.clone();
        async move {
            let arg = i.to_string();
            executor.execute_output(&ctx, "echo", &[arg.as_str()]).await
        }
    });

    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), format!("{}\n", i));
    }
}
