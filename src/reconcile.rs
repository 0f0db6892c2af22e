//! Restart reconciliation (spec §7, scenario 6 in spec §8): this crate
//! keeps no durable state of its own beyond the rootfs and socket
//! directories, so on process start it must align its in-memory tables
//! with whatever the host still shows — rootfs files, control sockets, and
//! the live hypervisor processes behind them — before resuming normal
//! operation.
//!
//! This module only classifies; it does not itself call
//! [`crate::executor::Executor::remove`] or delete rootfs files, since the
//! decision of *when* to remove an orphan or reclaim garbage (immediately,
//! or after a grace period so a re-assigned task with the same id can reuse
//! its rootfs) belongs to the worker daemon driving the executor, which is
//! out of this crate's scope (spec §1).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::task::TaskId;
use crate::vmm::control_socket::ControlSocketClient;

/// Classification of everything found under the rootfs and socket
/// directories, relative to the task ids the control plane still claims.
#[derive(Debug, Default, Clone)]
pub struct ReconciliationReport {
    /// Task ids behind a live hypervisor process that the control plane no
    /// longer recognizes (spec §7: "marked orphaned and scheduled for
    /// Remove").
    pub orphaned: Vec<TaskId>,
    /// Rootfs files with no live process and no task (known or orphaned)
    /// claiming them. Garbage; safe to delete after a grace period, or
    /// reused as-is if a task with the same id is re-assigned first.
    pub garbage_rootfs: Vec<PathBuf>,
    /// Control-socket files with no live process behind them. Always safe
    /// to delete immediately; nothing can be reusing a dead socket.
    pub stale_sockets: Vec<PathBuf>,
}

impl ReconciliationReport {
    /// Remove every stale socket file found during reconciliation. Rootfs
    /// garbage is left to the caller, since reclaiming it is time-gated.
    pub async fn delete_stale_sockets(&self) -> std::io::Result<()> {
        for path in &self.stale_sockets {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// Enumerate `rootfs_dir` and `socket_dir`, classifying every entry against
/// `known_task_ids` — the set of task ids the control plane currently
/// assigns to this worker. A missing directory is treated as empty rather
/// than an error: a freshly provisioned worker has not created either yet.
pub async fn reconcile(
    rootfs_dir: &Path,
    socket_dir: &Path,
    known_task_ids: &HashSet<TaskId>,
) -> std::io::Result<ReconciliationReport> {
    let mut report = ReconciliationReport::default();

    match tokio::fs::read_dir(socket_dir).await {
        Ok(mut sockets) => {
            while let Some(entry) = sockets.next_entry().await? {
                let path = entry.path();
                let Some(task_id) = task_id_with_extension(&path, "sock") else {
                    continue;
                };

                if ControlSocketClient::try_connect(&path).await {
                    if known_task_ids.contains(&task_id) {
                        info!(task_id = %task_id, "reconciled: live VM matches a known task");
                    } else {
                        warn!(task_id = %task_id, "reconciled: live VM has no known task, marking orphaned");
                        report.orphaned.push(task_id);
                    }
                } else {
                    warn!(task_id = %task_id, socket = %path.display(), "reconciled: stale control socket");
                    report.stale_sockets.push(path);
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    match tokio::fs::read_dir(rootfs_dir).await {
        Ok(mut rootfs) => {
            while let Some(entry) = rootfs.next_entry().await? {
                let path = entry.path();
                let Some(task_id) = task_id_with_extension(&path, "ext4") else {
                    continue;
                };

                let claimed = known_task_ids.contains(&task_id) || report.orphaned.contains(&task_id);
                if !claimed {
                    info!(task_id = %task_id, "reconciled: rootfs file has no known or orphaned owner, marking garbage");
                    report.garbage_rootfs.push(path);
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    Ok(report)
}

fn task_id_with_extension(path: &Path, extension: &str) -> Option<TaskId> {
    if path.extension().and_then(|e| e.to_str()) != Some(extension) {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str()).map(TaskId::new)
}
