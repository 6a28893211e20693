//! Retry Classification and Backoff
//!
//! This module decides whether a failed command is worth running again and
//! drives the retry loop for the executor's `*_with_retry` operations.
//!
//! # Classification
//!
//! - **Network I/O**: refused, reset, aborted and timed-out connections,
//!   unreachable hosts/networks and unexpected EOF anywhere in the error's
//!   source chain
//! - **Timeouts**: the executor's own timeout and exit code 124 (`timeout(1)`)
//! - **Known flaky phrases**: DNS, TLS and dependency-download messages found
//!   in the error text or in the command's captured output
//!
//! Everything else is permanent. Validation, spawn and cancellation failures
//! are never retried.
//!
//! # Example
//!
//! ```
//! use std::io;
//! use buildguard::exec::retry::is_transient;
//!
//! let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
//! assert!(is_transient(&refused));
//!
//! let missing = io::Error::new(io::ErrorKind::NotFound, "file not found");
//! assert!(!is_transient(&missing));
//! ```

use super::context::ExecContext;
use super::error::{ExecError, RuntimeFailure};
use std::error::Error;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Exit code used by `timeout(1)` when the wrapped command ran too long
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Generic network failure phrases
const NETWORK_PHRASES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "connection timed out",
    "timeout",
    "timed out",
    "deadline exceeded",
    "temporary failure in name resolution",
    "no such host",
    "no route to host",
    "network is unreachable",
    "host is unreachable",
    "i/o timeout",
    "unexpected eof",
    "tls handshake timeout",
    "dial tcp",
    "proxyconnect tcp",
];

/// Phrases printed by dependency tooling while a download or checksum
/// lookup is failing
const RESOLUTION_PHRASES: &[&str] = &[
    "go: downloading",
    "go: module",
    "verifying module",
    "getting requirements",
    "sumdb verification",
    "checksum database",
];

/// Retry configuration
///
/// # Fields
///
/// * `max_attempts` - Total attempts including the first (default: 3)
/// * `base_delay` - Delay before the first retry (default: 1s)
/// * `max_delay` - Upper bound for a single delay (default: 30s)
/// * `jitter` - Extra random delay as a fraction of the computed delay
///   (default: 0.0)
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use buildguard::exec::RetryPolicy;
///
/// let policy = RetryPolicy::new()
///     .max_attempts(5)
///     .base_delay(Duration::from_millis(200));
/// assert_eq!(policy.calculate_delay(2), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial attempt)
    pub max_attempts: usize,

    /// Base delay before first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0), only ever lengthens a delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for a single `*_with_retry` call
    pub fn for_call(max_attempts: usize, initial_delay: Duration) -> Self {
        Self::default()
            .max_attempts(max_attempts)
            .base_delay(initial_delay)
    }

    /// Set the maximum number of attempts; zero is treated as one
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate the delay after a failed attempt (0-based)
    ///
    /// Uses exponential backoff: delay = base_delay * 2^attempt, plus jitter,
    /// capped at `max_delay` (or `base_delay` if that is larger).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let cap = self.max_delay.max(self.base_delay);
        let exponential_delay = u32::try_from(attempt)
            .ok()
            .and_then(|exp| 2_u32.checked_pow(exp))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(cap);

        let jittered_delay = if self.jitter > 0.0 {
            exponential_delay.saturating_add(exponential_delay.mul_f64(self.jitter * rand::random::<f64>()))
        } else {
            exponential_delay
        };

        jittered_delay.min(cap)
    }

    /// Number of attempts the loop will make
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

fn matches_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    NETWORK_PHRASES
        .iter()
        .chain(RESOLUTION_PHRASES)
        .any(|phrase| lower.contains(phrase))
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::UnexpectedEof
    )
}

/// Classify an arbitrary error as transient or permanent
///
/// Walks the source chain looking for network I/O errors, then falls back
/// to case-insensitive phrase matching on each message in the chain.
pub fn is_transient(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(exec) = e.downcast_ref::<ExecError>() {
            return is_retriable(exec);
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_transient_io(io_err) {
                return true;
            }
        }
        if let Some(io_err) = e.downcast_ref::<Arc<io::Error>>() {
            if is_transient_io(io_err) {
                return true;
            }
        }
        current = e.source();
    }

    let mut current = Some(err);
    while let Some(e) = current {
        if matches_phrase(&e.to_string()) {
            return true;
        }
        current = e.source();
    }
    false
}

/// Decide whether an executor failure should be retried
///
/// The verdict depends only on the error value.
pub fn is_retriable(err: &ExecError) -> bool {
    match err {
        ExecError::Validation { .. }
        | ExecError::Spawn { .. }
        | ExecError::Cancelled { .. }
        | ExecError::RetriesExhausted { .. } => false,
        ExecError::Runtime { failure, .. } => match failure {
            RuntimeFailure::Timeout(_) => true,
            RuntimeFailure::Exit { code, output } => {
                *code == Some(TIMEOUT_EXIT_CODE) || matches_phrase(output)
            }
            RuntimeFailure::Io(source) => {
                is_transient_io(source) || matches_phrase(&source.to_string())
            }
        },
    }
}

/// Retry an operation with exponential backoff
///
/// Runs `operation` up to `policy.max_attempts` times. A permanent failure
/// is returned as-is after the attempt that produced it; a failure that is
/// still retriable on the last attempt becomes
/// [`ExecError::RetriesExhausted`]. The context is checked before every
/// attempt and races every backoff sleep, so cancelling it ends the loop
/// with [`ExecError::Cancelled`] without waiting out the delay.
pub async fn retry_with_backoff<F, T, Fut>(
    ctx: &ExecContext,
    policy: &RetryPolicy,
    command: &str,
    mut operation: F,
) -> Result<T, ExecError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExecError>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        if let Some(reason) = ctx.state() {
            return Err(ExecError::cancelled(command, reason));
        }

        let err = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(
                        "Command '{}' succeeded on attempt {} after {} retries",
                        command,
                        attempt + 1,
                        attempt
                    );
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if !is_retriable(&err) {
            if attempt > 0 {
                tracing::error!(
                    "Command '{}' failed permanently on attempt {}: {}",
                    command,
                    attempt + 1,
                    err
                );
            }
            return Err(err);
        }

        if attempt + 1 >= attempts {
            tracing::error!("Command '{}' failed after {} attempts: {}", command, attempts, err);
            return Err(ExecError::RetriesExhausted {
                command: command.to_string(),
                attempts,
                last: Box::new(err),
            });
        }

        let delay = policy.calculate_delay(attempt);
        tracing::warn!(
            "Attempt {}/{} of '{}' failed: {}, retrying in {:?}",
            attempt + 1,
            attempts,
            command,
            err,
            delay
        );

        tokio::select! {
            biased;
            reason = ctx.done() => return Err(ExecError::cancelled(command, reason)),
            _ = sleep(delay) => {}
        }

        attempt += 1;
    }
}
