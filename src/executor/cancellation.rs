//! Cooperative cancellation for the long-running Prepare/Start operations
//! (spec §4.1). Modeled as a cheap, cloneable handle rather than a future
//! combinator library dependency: callers race the operation against both an
//! optional deadline and an externally-triggered cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// A handle shared between the caller requesting cancellation and the
/// in-flight operation observing it. Cloning shares the same underlying
/// state; cancelling through any clone cancels all of them.
#[derive(Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called. Resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Run `future` to completion unless `deadline` elapses first (when given)
/// or `handle` is cancelled. The losing race drops `future` at its current
/// await point; any [`crate::release::ReleaseStack`] it was holding still
/// unwinds via that type's `Drop` impl, so cancelling mid-`Prepare`/`Start`
/// takes the same undo path a failure would (spec §5), just detached from
/// this call rather than awaited by it.
pub async fn run_with_deadline<F: Future>(
    handle: &CancellationHandle,
    deadline: Option<Duration>,
    future: F,
) -> Result<F::Output, Cancelled> {
    match deadline {
        Some(deadline) => {
            tokio::select! {
                result = future => Ok(result),
                _ = tokio::time::sleep(deadline) => Err(Cancelled),
                _ = handle.cancelled() => Err(Cancelled),
            }
        }
        None => {
            tokio::select! {
                result = future => Ok(result),
                _ = handle.cancelled() => Err(Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_normally_when_not_cancelled() {
        let handle = CancellationHandle::new();
        let result = run_with_deadline(&handle, None, async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn deadline_elapsing_yields_cancelled() {
        let handle = CancellationHandle::new();
        let result = run_with_deadline(&handle, Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn external_cancel_interrupts_in_flight_operation() {
        let handle = CancellationHandle::new();
        let cancel_handle = handle.clone();

        let operation = run_with_deadline(&handle, None, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        tokio::pin!(operation);
        cancel_handle.cancel();
        let result = operation.await;
        assert_eq!(result, Err(Cancelled));
    }
}
