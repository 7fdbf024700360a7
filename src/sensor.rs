//! Sensor polling: evaluate a predicate at a fixed interval until it holds
//! or the timeout budget is spent

use crate::error::{DagRunError, Result};
use crate::models::PollPolicy;
use crate::retry::cancel_signalled;
use std::future::Future;
use tokio::sync::watch;
use tracing::debug;

/// Poll `check` once per interval, starting immediately.
///
/// Returns the number of checks performed on the first `true`. A predicate
/// error fails the sensor at once; no `true` within the timeout yields
/// [`DagRunError::Timeout`]. The worker suspends between polls, and
/// cancellation is observed at every poll boundary.
pub async fn poll<F, Fut>(
    policy: &PollPolicy,
    cancel: &mut watch::Receiver<bool>,
    mut check: F,
) -> Result<u32>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let start = tokio::time::Instant::now();
    let mut polls = 0u32;

    loop {
        if *cancel.borrow() {
            return Err(DagRunError::Cancelled);
        }

        polls += 1;
        match check(polls).await {
            Ok(true) => {
                debug!(polls, elapsed = ?start.elapsed(), "sensor predicate satisfied");
                return Ok(polls);
            }
            Ok(false) => {}
            Err(err) => return Err(DagRunError::Action(err)),
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(DagRunError::Timeout {
                elapsed,
                timeout: policy.timeout,
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.interval) => {}
            _ = cancel_signalled(cancel) => return Err(DagRunError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn policy(interval_ms: u64, timeout_ms: u64) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_mth_poll() {
        let (_tx, mut rx) = watch::channel(false);
        let start = tokio::time::Instant::now();

        let polls = poll(&policy(100, 10_000), &mut rx, |n| async move { Ok(n >= 3) })
            .await
            .unwrap();

        assert_eq!(polls, 3);
        // First check at t=0, third at t=2*interval.
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds() {
        let (_tx, mut rx) = watch::channel(false);
        let start = tokio::time::Instant::now();

        let result = poll(&policy(100, 250), &mut rx, |_n| async { Ok(false) }).await;

        match result {
            Err(DagRunError::Timeout { elapsed, timeout }) => {
                assert_eq!(timeout, Duration::from_millis(250));
                // Fails at the first poll boundary past the budget:
                // elapsed in [timeout, timeout + interval).
                assert!(elapsed >= Duration::from_millis(250));
                assert!(elapsed < Duration::from_millis(350));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_poll_while_suspended() {
        let (_tx, mut rx) = watch::channel(false);
        let checks = Arc::new(AtomicU32::new(0));
        let checks2 = checks.clone();

        let _ = poll(&policy(100, 250), &mut rx, |_n| {
            let checks = checks2.clone();
            async move {
                checks.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;

        // Checks at t=0, 100, 200, 300 only: one per interval.
        assert_eq!(checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_predicate_error_fails_immediately() {
        let (_tx, mut rx) = watch::channel(false);

        let result = poll(&policy(10, 1_000), &mut rx, |_n| async {
            anyhow::bail!("connection refused")
        })
        .await;

        assert!(matches!(result, Err(DagRunError::Action(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_polls() {
        let (tx, mut rx) = watch::channel(false);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(true);
        });

        let result = poll(&policy(100, 10_000), &mut rx, |_n| async { Ok(false) }).await;

        canceller.await.unwrap();
        assert!(matches!(result, Err(DagRunError::Cancelled)));
    }
}
