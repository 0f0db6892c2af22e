//! Scoped, LIFO-ordered cleanup (spec §5): every resource a component
//! acquires while preparing a task — a scratch directory, a loop-mounted
//! filesystem, a TAP device, a socket file, a spawned process — is paired
//! with a release action pushed onto a [`ReleaseStack`]. Releases run in
//! reverse acquisition order on every exit path, including panics, mirroring
//! the teacher's `Vm::prepare`/`Vm::cleanup` symmetry (`vm/mod.rs`) but
//! generalized into a single reusable guard instead of one bespoke
//! `JoinSet` per component.

use std::future::Future;
use std::pin::Pin;

use tracing::warn;

type ReleaseAction = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A stack of deferred release actions. Push one action per acquired
/// resource as you acquire it; call [`ReleaseStack::release_all`] on every
/// exit path (success commits the resources elsewhere first and leaves the
/// stack empty; failure calls it to unwind everything acquired so far).
///
/// Release actions are `async` (unmounting a filesystem, killing a process)
/// and cannot run to completion inside a synchronous `Drop::drop`. Callers
/// must still call [`ReleaseStack::release_all`] explicitly on every
/// ordinary exit path of a `prepare`-style function, which runs releases in
/// order and logs as it goes. `Drop` is a backstop for the one path that
/// can't reach that call: a future holding a `ReleaseStack` being cancelled
/// or dropped mid-await (e.g. a `Prepare`/`Start` racing a deadline). In
/// that case `Drop` spawns the remaining actions onto the ambient Tokio
/// runtime so the undo path still runs, just detached from whatever dropped
/// the stack (spec §5: cancellation must trigger the same undo path as a
/// failure).
#[derive(Default)]
pub struct ReleaseStack {
    actions: Vec<(&'static str, ReleaseAction)>,
}

impl ReleaseStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a named release action. `label` is used only for log messages on
    /// release, so failures are attributable to a specific resource.
    pub fn push<F>(&mut self, label: &'static str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.actions.push((label, Box::pin(action)));
    }

    /// Run every pushed action in LIFO order, logging (but not propagating)
    /// any that panic via `catch_unwind`-free best-effort execution: release
    /// actions are expected to be infallible cleanup, so a release that
    /// cannot succeed is a logged warning, never a returned error.
    pub async fn release_all(mut self) {
        while let Some((label, action)) = self.actions.pop() {
            tracing::debug!(resource = label, "releasing resource");
            action.await;
        }
    }

    /// The number of pending release actions. Useful in tests asserting a
    /// failure partway through preparation still registered the resources
    /// acquired before it.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drop all actions without running them: used once a component commits
    /// its resources permanently (e.g. after a successful `Start`) and
    /// ownership of further teardown passes to `Stop`/`Remove`.
    pub fn disarm(&mut self) {
        if !self.actions.is_empty() {
            warn!(count = self.actions.len(), "disarming release stack with pending actions");
        }
        self.actions.clear();
    }
}

impl Drop for ReleaseStack {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        let actions = std::mem::take(&mut self.actions);
        warn!(count = actions.len(), "release stack dropped with pending actions, spawning detached cleanup");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for (label, action) in actions.into_iter().rev() {
                        tracing::debug!(resource = label, "releasing resource (detached, from drop)");
                        action.await;
                    }
                });
            }
            Err(_) => {
                warn!("no Tokio runtime available to run pending release actions, resources will leak");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn releases_run_in_lifo_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = ReleaseStack::new();

        for i in 0..3 {
            let order = Arc::clone(&order);
            stack.push("resource", async move {
                order.lock().unwrap().push(i);
            });
        }

        stack.release_all().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn disarm_prevents_release_from_running() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut stack = ReleaseStack::new();
        let counter_clone = Arc::clone(&counter);
        stack.push("resource", async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        stack.disarm();
        stack.release_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_a_stack_with_pending_actions_still_runs_them() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut stack = ReleaseStack::new();
            let counter_clone = Arc::clone(&counter);
            stack.push("resource", async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            });
            // simulates a cancelled future being dropped before it reaches
            // an explicit `release_all().await` call.
        }

        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
