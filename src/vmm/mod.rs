//! Hypervisor process lifecycle (spec §4.5): spawns the Firecracker binary,
//! drives its control-socket API through the boot sequence, and supervises
//! the running process until it exits.

pub(crate) mod control_socket;
mod supervisor;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use crate::capability::{resolve_binary, Clock, CommandRunner, ProcessHandle};
use crate::release::ReleaseStack;
use crate::task::{TaskId, TaskState, TaskStatus};
use crate::translator::VmmConfig;

pub use control_socket::ControlSocketError;
use control_socket::ControlSocketClient;
pub use supervisor::VmExitEvent;

#[derive(Debug, Error)]
pub enum VmmError {
    #[error("a VM for task {0} is already running")]
    AlreadyRunning(String),
    #[error("failed to spawn the hypervisor process: {0}")]
    SpawnFailed(std::io::Error),
    #[error("hypervisor did not open its control socket within {0:?}")]
    StartTimeout(Duration),
    #[error("configuring the hypervisor over the control socket failed: {0}")]
    ConfigError(#[from] ControlSocketError),
    #[error("the hypervisor rejected the start action: {0}")]
    StartError(String),
    #[error("no VM record exists for task {0}")]
    NotFound(String),
    #[error("an I/O error occurred while managing the VM: {0}")]
    Io(#[from] std::io::Error),
}

/// The VMM process state machine (spec §4.5). Transitions are linear except
/// that any state may move to `Exited` on unexpected process death.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmRecordState {
    Spawning,
    Configuring,
    Running,
    Stopping,
    Exited,
}

/// Per-task VMM state (spec §3's VMRecord), owned by [`VmmManager`].
struct VmRecordInner {
    process: Arc<Mutex<Box<dyn ProcessHandle>>>,
    control_socket_path: PathBuf,
    tap_name: String,
    ipv4: Ipv4Addr,
    rootfs_path: PathBuf,
    state: Arc<Mutex<VmmRecordState>>,
    cached_status: Mutex<Option<TaskStatus>>,
}

/// Inputs the VMM manager needs from the rest of the pipeline to start a
/// task's VM: the translated config plus the allocation facts Prepare
/// already established.
pub struct StartRequest<'a> {
    pub task_id: &'a TaskId,
    pub vmm_config: &'a VmmConfig,
    pub tap_name: String,
    pub ipv4: Ipv4Addr,
    pub rootfs_path: PathBuf,
}

pub struct VmmManager<R: CommandRunner> {
    runner: Arc<R>,
    clock: Arc<dyn Clock>,
    socket_dir: PathBuf,
    firecracker_binary: Option<PathBuf>,
    start_timeout: Duration,
    stop_grace_period: Duration,
    records: RwLock<HashMap<TaskId, VmRecordInner>>,
    exit_events: mpsc::UnboundedSender<VmExitEvent>,
}

impl<R: CommandRunner> VmmManager<R> {
    pub fn new(
        runner: Arc<R>,
        clock: Arc<dyn Clock>,
        socket_dir: PathBuf,
        firecracker_binary: Option<PathBuf>,
        start_timeout: Duration,
        stop_grace_period: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<VmExitEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                runner,
                clock,
                socket_dir,
                firecracker_binary,
                start_timeout,
                stop_grace_period,
                records: RwLock::new(HashMap::new()),
                exit_events: tx,
            },
            rx,
        )
    }

    fn socket_path(&self, task_id: &TaskId) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", task_id.as_str()))
    }

    /// Spawn the hypervisor, drive it through the full boot sequence, and
    /// record it as running (spec §4.5 Start protocol). The spawned process
    /// is pushed onto a [`ReleaseStack`] as soon as it exists, so a failure
    /// at any later step — socket not opening, a rejected configure PUT, a
    /// rejected `InstanceStart` — kills it rather than leaking a hypervisor
    /// process with no task bookkeeping behind it (spec §4.5, §5).
    pub async fn start(&self, request: StartRequest<'_>) -> Result<(), VmmError> {
        let task_id = request.task_id.clone();
        let socket_path = self.socket_path(&task_id);

        if self.records.read().await.contains_key(&task_id) {
            return Err(VmmError::AlreadyRunning(task_id.to_string()));
        }

        if socket_path.exists() {
            // A stale socket from a crashed prior run; no live process owns
            // it since we already checked the record table above.
            let _ = tokio::fs::remove_file(&socket_path).await;
        }

        let binary = resolve_binary(self.firecracker_binary.as_deref(), "firecracker")?;
        let socket_arg = socket_path.to_string_lossy().into_owned();
        let process = self
            .runner
            .spawn(&binary.to_string_lossy(), &["--api-sock", &socket_arg])
            .await
            .map_err(VmmError::SpawnFailed)?;

        let process = Arc::new(Mutex::new(process));
        let mut release = ReleaseStack::new();
        {
            let process = Arc::clone(&process);
            release.push("hypervisor-process", async move {
                let _ = process.lock().await.send_sigkill();
            });
        }

        if let Err(err) = self.wait_for_socket(&socket_path).await {
            release.release_all().await;
            return Err(err);
        }

        let client = ControlSocketClient::new(&socket_path);
        if let Err(err) = self.configure(&client, request.vmm_config).await {
            release.release_all().await;
            return Err(err.into());
        }

        if let Err(err) = self.issue_action(&client, "InstanceStart").await {
            release.release_all().await;
            return Err(VmmError::StartError(err.to_string()));
        }

        let state = Arc::new(Mutex::new(VmmRecordState::Running));

        supervisor::spawn_watcher(task_id.clone(), Arc::clone(&process), Arc::clone(&state), self.exit_events.clone());
        release.disarm();

        let record = VmRecordInner {
            process,
            control_socket_path: socket_path,
            tap_name: request.tap_name,
            ipv4: request.ipv4,
            rootfs_path: request.rootfs_path,
            state,
            cached_status: Mutex::new(None),
        };
        self.records.write().await.insert(task_id.clone(), record);

        info!(task_id = %task_id, "hypervisor running");
        Ok(())
    }

    async fn wait_for_socket(&self, socket_path: &Path) -> Result<(), VmmError> {
        let deadline = self.clock.now() + self.start_timeout;
        let mut backoff = Duration::from_millis(10);

        loop {
            if ControlSocketClient::try_connect(socket_path).await {
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(VmmError::StartTimeout(self.start_timeout));
            }
            self.clock.sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(500));
        }
    }

    async fn configure(&self, client: &ControlSocketClient, config: &VmmConfig) -> Result<(), ControlSocketError> {
        client
            .put_json(
                "/boot-source",
                &BootSourceBody {
                    kernel_image_path: &config.boot_source.kernel_image_path,
                    initrd_path: config.boot_source.initrd_path.as_deref(),
                    boot_args: &config.boot_source.boot_args,
                },
            )
            .await?;

        client
            .put_json(
                "/machine-config",
                &MachineConfigBody {
                    vcpu_count: config.machine_config.vcpu_count,
                    mem_size_mib: config.machine_config.mem_size_mib,
                    smt: config.machine_config.smt,
                },
            )
            .await?;

        client
            .put_json(
                &format!("/drives/{}", config.drive.drive_id),
                &DriveBody {
                    drive_id: &config.drive.drive_id,
                    path_on_host: &config.drive.path_on_host,
                    is_root_device: config.drive.is_root_device,
                    is_read_only: config.drive.is_read_only,
                },
            )
            .await?;

        for iface in &config.network_interfaces {
            client
                .put_json(
                    &format!("/network-interfaces/{}", iface.iface_id),
                    &NetworkInterfaceBody {
                        iface_id: &iface.iface_id,
                        host_dev_name: &iface.host_dev_name,
                        guest_mac: &iface.guest_mac,
                    },
                )
                .await?;
        }

        Ok(())
    }

    async fn issue_action(&self, client: &ControlSocketClient, action_type: &str) -> Result<(), ControlSocketError> {
        client.put_json("/actions", &ActionBody { action_type }).await
    }

    /// Request graceful shutdown; force-kill after the configured grace
    /// period (spec §4.5 Stop protocol). Idempotent.
    pub async fn stop(&self, task_id: &TaskId) -> Result<(), VmmError> {
        let (process, state, socket_path) = {
            let records = self.records.read().await;
            let Some(record) = records.get(task_id) else {
                return Ok(());
            };
            (Arc::clone(&record.process), Arc::clone(&record.state), record.control_socket_path.clone())
        };

        {
            let mut state_guard = state.lock().await;
            if matches!(*state_guard, VmmRecordState::Exited) {
                return Ok(());
            }
            *state_guard = VmmRecordState::Stopping;
        }

        let client = ControlSocketClient::new(&socket_path);
        let _ = self.issue_action(&client, "SendCtrlAltDel").await;

        let deadline = self.clock.now() + self.stop_grace_period;
        let exited = loop {
            if matches!(*state.lock().await, VmmRecordState::Exited) {
                break true;
            }
            if self.clock.now() >= deadline {
                break false;
            }
            self.clock.sleep(Duration::from_millis(50)).await;
        };

        if !exited {
            warn!(task_id = %task_id, "graceful shutdown timed out, sending SIGKILL");
            let mut process = process.lock().await;
            let _ = process.send_sigkill();
        }

        let _ = tokio::fs::remove_file(&socket_path).await;
        Ok(())
    }

    /// Block until the hypervisor process exits, returning the final
    /// status. If already reaped, returns the cached status immediately.
    pub async fn wait(&self, task_id: &TaskId) -> Result<TaskStatus, VmmError> {
        let process = {
            let records = self.records.read().await;
            let record = records.get(task_id).ok_or_else(|| VmmError::NotFound(task_id.to_string()))?;
            if let Some(cached) = record.cached_status.lock().await.clone() {
                return Ok(cached);
            }
            Arc::clone(&record.process)
        };

        let exit_status = supervisor::wait_for_exit(&process).await?;
        let status = if exit_status.success() {
            TaskStatus::new(task_id.clone(), TaskState::Complete, "VM exited cleanly")
        } else {
            TaskStatus::new(task_id.clone(), TaskState::Failed, format!("VM exited with {exit_status}"))
                .with_error(exit_status.to_string())
        };

        if let Some(record) = self.records.read().await.get(task_id) {
            *record.cached_status.lock().await = Some(status.clone());
        }

        Ok(status)
    }

    /// Current cached status, without I/O (spec §4.5 Describe).
    pub async fn describe(&self, task_id: &TaskId) -> Option<TaskStatus> {
        let records = self.records.read().await;
        let record = records.get(task_id)?;
        record.cached_status.lock().await.clone()
    }

    /// Kill if running, remove the socket and rootfs file, drop the record
    /// (spec §4.5 Remove). Idempotent.
    pub async fn remove(&self, task_id: &TaskId) -> Result<(), VmmError> {
        self.stop(task_id).await?;

        let record = self.records.write().await.remove(task_id);
        let Some(record) = record else {
            return Ok(());
        };

        let _ = tokio::fs::remove_file(&record.control_socket_path).await;
        let _ = tokio::fs::remove_file(&record.rootfs_path).await;
        info!(task_id = %task_id, "VM record removed");
        Ok(())
    }

    pub async fn get_tap_and_ip(&self, task_id: &TaskId) -> Option<(String, Ipv4Addr)> {
        let records = self.records.read().await;
        records.get(task_id).map(|r| (r.tap_name.clone(), r.ipv4))
    }
}

#[derive(Serialize)]
struct BootSourceBody<'a> {
    kernel_image_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    initrd_path: Option<&'a str>,
    boot_args: &'a str,
}

#[derive(Serialize)]
struct MachineConfigBody {
    vcpu_count: u32,
    mem_size_mib: u64,
    smt: bool,
}

#[derive(Serialize)]
struct DriveBody<'a> {
    drive_id: &'a str,
    path_on_host: &'a str,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Serialize)]
struct NetworkInterfaceBody<'a> {
    iface_id: &'a str,
    host_dev_name: &'a str,
    guest_mac: &'a str,
}

#[derive(Serialize)]
struct ActionBody<'a> {
    action_type: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::TokioCommandRunner;

    /// A [`Clock`] that advances instantly: `sleep` resolves without
    /// actually waiting, so backoff/grace-period loops run at test speed.
    /// Still reports real elapsed time via `now`, so deadline arithmetic
    /// behaves the same as it would under [`crate::capability::SystemClock`].
    #[derive(Clone, Copy, Default)]
    struct InstantClock;

    #[async_trait::async_trait]
    impl Clock for InstantClock {
        fn now(&self) -> std::time::SystemTime {
            std::time::SystemTime::now()
        }

        async fn sleep(&self, _duration: Duration) {}
    }

    fn manager_with_instant_clock(start_timeout: Duration) -> VmmManager<TokioCommandRunner> {
        let (manager, _exit_events) = VmmManager::new(
            Arc::new(TokioCommandRunner),
            Arc::new(InstantClock),
            std::env::temp_dir(),
            None,
            start_timeout,
            Duration::from_secs(10),
        );
        manager
    }

    #[tokio::test]
    async fn wait_for_socket_times_out_against_a_path_nothing_listens_on() {
        let manager = manager_with_instant_clock(Duration::from_millis(50));
        let socket_path = std::env::temp_dir().join(format!("microvm-executor-vmm-test-{}.sock", std::process::id()));

        let result = manager.wait_for_socket(&socket_path).await;

        assert!(matches!(result, Err(VmmError::StartTimeout(_))));
    }

    #[tokio::test]
    async fn wait_for_socket_succeeds_once_the_listener_is_up() {
        let manager = manager_with_instant_clock(Duration::from_secs(5));
        let socket_path = std::env::temp_dir().join(format!(
            "microvm-executor-vmm-test-listening-{}-{}.sock",
            std::process::id(),
            fastrand::u64(..)
        ));
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        let _accept_task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        manager.wait_for_socket(&socket_path).await.unwrap();
    }
}
