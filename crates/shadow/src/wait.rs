//! Bounded, poll-based waiting with cancellation.

use std::{future::Future, time::Duration};

use {
    tokio::time::{Instant, sleep},
    tokio_util::sync::CancellationToken,
};

use crate::error::{Error, Result};

/// Result of a bounded wait.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
}

/// Poll `probe` every `interval` until it yields `Some`, `timeout` elapses, or
/// `cancel` fires.
///
/// The probe always runs at least once. Probe errors propagate; callers that
/// want to retry through transient failures map them to `Ok(None)`.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<WaitOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(value) = probe().await? {
            return Ok(WaitOutcome::Ready(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(WaitOutcome::TimedOut);
        }
        let pause = interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = sleep(pause) => {},
        }
    }
}

/// Sleep for `duration` unless cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        () = sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
    };

    #[tokio::test(start_paused = true)]
    async fn returns_once_probe_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&calls);
        let outcome = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(60),
            &cancel,
            || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((n == 3).then_some(n))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_deadline() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let outcome: WaitOutcome<()> = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(12),
            &cancel,
            || async { Ok(None) },
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });
        let result: Result<WaitOutcome<()>> = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(600),
            &cancel,
            || async { Ok(None) },
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn probe_errors_propagate() {
        let cancel = CancellationToken::new();
        let result: Result<WaitOutcome<()>> = poll_until(
            Duration::from_millis(1),
            Duration::from_secs(1),
            &cancel,
            || async { Err(Error::message("api down")) },
        )
        .await;
        assert!(matches!(result, Err(Error::Message { .. })));
    }
}
