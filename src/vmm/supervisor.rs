//! Background process supervision (spec §4.5): one watcher task per
//! [`super::VmRecord`], observing the hypervisor process handle and posting
//! an event on unexpected exit.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::capability::ProcessHandle;
use crate::task::TaskId;

use super::VmmRecordState;

/// How often the watcher re-acquires the process lock to poll for exit.
/// Kept short so `stop`'s grace-period SIGKILL (which needs this same lock)
/// is never blocked for long behind the watcher.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `process` for exit without holding its lock between polls, so a
/// concurrent caller (e.g. `VmmManager::stop`'s force-kill) can always get
/// in. Holding the lock across a blocking `wait()` for the process's entire
/// lifetime would starve that caller forever, since the only thing that can
/// make the process exit — SIGKILL — is itself waiting on the same lock.
pub(super) async fn wait_for_exit(process: &Arc<Mutex<Box<dyn ProcessHandle>>>) -> Result<ExitStatus, std::io::Error> {
    loop {
        let polled = process.lock().await.try_wait();
        match polled {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Emitted by the supervisor (and by `Stop`/`Remove`) when a hypervisor
/// process exits, expectedly or not.
#[derive(Debug, Clone)]
pub struct VmExitEvent {
    pub task_id: TaskId,
    pub success: bool,
    pub message: String,
}

/// Spawn a watcher that waits on `process`, writes the final state into
/// `state`, and sends a [`VmExitEvent`] if the exit was not already
/// anticipated (i.e. `state` was still `Running` when the process died).
pub fn spawn_watcher(
    task_id: TaskId,
    process: Arc<Mutex<Box<dyn ProcessHandle>>>,
    state: Arc<Mutex<VmmRecordState>>,
    events: mpsc::UnboundedSender<VmExitEvent>,
) {
    tokio::spawn(async move {
        let wait_result = wait_for_exit(&process).await;

        let mut state_guard = state.lock().await;
        let was_expected = matches!(*state_guard, VmmRecordState::Stopping | VmmRecordState::Exited);

        let (success, message) = match wait_result {
            Ok(exit_status) => {
                let success = exit_status.success();
                (success, format!("VM exited with status {exit_status}"))
            }
            Err(err) => (false, format!("failed to wait on VM process: {err}")),
        };

        *state_guard = VmmRecordState::Exited;
        drop(state_guard);

        if was_expected {
            info!(task_id = %task_id, "supervised process exited as expected");
        } else {
            warn!(task_id = %task_id, %success, "VM exited unexpectedly");
            let _ = events.send(VmExitEvent {
                task_id,
                success,
                message,
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// A process that only reports itself exited once killed, so tests can
    /// observe whether a concurrent caller can still reach `send_sigkill`
    /// while `wait_for_exit` is polling it.
    struct KillableProcess {
        killed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ProcessHandle for KillableProcess {
        fn send_sigkill(&mut self) -> Result<(), std::io::Error> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&mut self) -> Result<ExitStatus, std::io::Error> {
            unreachable!("wait_for_exit polls try_wait instead of calling wait")
        }

        fn try_wait(&mut self) -> Result<Option<ExitStatus>, std::io::Error> {
            Ok(self.killed.load(Ordering::SeqCst).then(|| ExitStatus::from_raw(0)))
        }
    }

    #[tokio::test]
    async fn wait_for_exit_releases_the_lock_between_polls_so_a_kill_can_land() {
        let killed = Arc::new(AtomicBool::new(false));
        let process: Arc<Mutex<Box<dyn ProcessHandle>>> =
            Arc::new(Mutex::new(Box::new(KillableProcess { killed: Arc::clone(&killed) })));

        let waiter = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { wait_for_exit(&process).await })
        };

        // give wait_for_exit a couple of poll cycles to start, then confirm
        // the lock is still reachable: a deadlocked watcher holding it
        // across a blocking wait() would make this time out.
        tokio::time::sleep(POLL_INTERVAL * 2).await;
        let kill_result = tokio::time::timeout(Duration::from_secs(1), async {
            process.lock().await.send_sigkill().unwrap();
        })
        .await;
        assert!(kill_result.is_ok(), "send_sigkill could not acquire the process lock in time");

        let status = waiter.await.unwrap().unwrap();
        assert!(status.success());
    }
}
