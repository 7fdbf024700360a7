//! Bounded retry execution with a fixed inter-attempt delay

use crate::error::{DagRunError, Result};
use crate::models::{ActionOutput, RetryPolicy};
use std::future::Future;
use tokio::sync::watch;
use tracing::warn;

/// Resolves once the cancel flag flips to `true`; never resolves if the
/// sender is gone (cancellation can no longer arrive).
pub(crate) async fn cancel_signalled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `attempt_fn` under the retry policy.
///
/// Attempts are numbered 1..=max_attempts. On failure the executor waits the
/// policy's fixed delay before the next attempt; exhaustion returns the last
/// error wrapped as [`DagRunError::Action`]. Cancellation is observed before
/// each attempt and during the inter-attempt delay.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    cancel: &mut watch::Receiver<bool>,
    mut attempt_fn: F,
) -> Result<ActionOutput>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<ActionOutput>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if *cancel.borrow() {
            return Err(DagRunError::Cancelled);
        }

        match attempt_fn(attempt).await {
            Ok(output) => return Ok(output),
            Err(err) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    delay = ?policy.delay,
                    error = %err,
                    "attempt failed, retrying after delay"
                );
                tokio::select! {
                    _ = tokio::time::sleep(policy.delay) => {}
                    _ = cancel_signalled(cancel) => return Err(DagRunError::Cancelled),
                }
            }
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "attempts exhausted");
                return Err(DagRunError::Action(err));
            }
        }
    }

    unreachable!("retry loop always returns within max_attempts")
}
