//! Execution Timeout Management
//!
//! This module bounds a single spawn-and-wait by the executor's timeout and
//! by the caller's [`ExecContext`]. Whichever finishes first wins; the
//! bounded future is dropped otherwise, which tears down its child process.

use super::context::ExecContext;
use super::error::CancelReason;
use std::future::Future;
use std::time::Duration;
use tokio::time;

/// Why a bounded future did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// The executor's own timeout expired
    TimedOut(Duration),

    /// The caller's context was cancelled or hit its deadline
    Cancelled(CancelReason),
}

/// Execution timeout configuration
///
/// Timeouts are enforced to prevent commands from hanging indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTimeout {
    /// The timeout duration
    duration: Duration,
}

impl Default for ExecutionTimeout {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl ExecutionTimeout {
    /// Create a new execution timeout
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use buildguard::exec::ExecutionTimeout;
    ///
    /// let timeout = ExecutionTimeout::new(Duration::from_secs(30));
    /// assert_eq!(timeout.duration(), Duration::from_secs(30));
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Create a timeout from seconds
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Get the timeout duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run a future until it completes, the timeout expires, or `ctx` ends
    ///
    /// Cancellation takes precedence over the timeout when both are ready.
    pub async fn run<F, T>(&self, ctx: &ExecContext, future: F) -> Result<T, Interruption>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            reason = ctx.done() => Err(Interruption::Cancelled(reason)),
            _ = time::sleep(self.duration) => Err(Interruption::TimedOut(self.duration)),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_default() {
        let timeout = ExecutionTimeout::default();
        assert_eq!(timeout.duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_timeout_from_secs() {
        let timeout = ExecutionTimeout::from_secs(45);
        assert_eq!(timeout.duration(), Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_timeout_run_returns_value() {
        let timeout = ExecutionTimeout::from_secs(10);
        let result = timeout
            .run(&ExecContext::new(), async { "test value".to_string() })
            .await;
        assert_eq!(result.unwrap(), "test value");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_run_timeout() {
        let timeout = ExecutionTimeout::from_secs(1);
        let result = timeout
            .run(&ExecContext::new(), async {
                time::sleep(Duration::from_secs(2)).await;
            })
            .await;
        assert_eq!(result, Err(Interruption::TimedOut(Duration::from_secs(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_run_just_in_time() {
        let timeout = ExecutionTimeout::from_secs(1);
        let result = timeout
            .run(&ExecContext::new(), async {
                time::sleep(Duration::from_millis(500)).await;
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_before_timeout() {
        let timeout = ExecutionTimeout::from_secs(60);
        let ctx = ExecContext::new().with_timeout(Duration::from_secs(1));
        let result = timeout
            .run(&ctx, async {
                time::sleep(Duration::from_secs(10)).await;
            })
            .await;
        assert_eq!(
            result,
            Err(Interruption::Cancelled(CancelReason::DeadlineExceeded))
        );
    }

    #[tokio::test]
    async fn test_already_cancelled_context() {
        let ctx = ExecContext::new();
        ctx.cancel();
        let result = ExecutionTimeout::from_secs(10).run(&ctx, async { 1 }).await;
        assert_eq!(result, Err(Interruption::Cancelled(CancelReason::Cancelled)));
    }
}
