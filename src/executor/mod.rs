//! The top-level pipeline (spec §4.1): sequences the translator, image
//! preparer, network manager and VMM manager behind a single
//! Prepare/Start/Wait/Stop/Remove/Describe/Events() surface, keeping each
//! task's status and publishing every transition to subscribers.

pub mod cancellation;
pub mod events;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

use crate::capability::{Clock, CommandRunner, ContainerRuntime};
use crate::config::ExecutorConfig;
use crate::image::{ImagePreparer, ImagePreparerError};
use crate::network::{NetworkError, NetworkManager};
use crate::reconcile::{self, ReconciliationReport};
use crate::release::ReleaseStack;
use crate::task::{Task, TaskId, TaskRuntime, TaskState, TaskStatus};
use crate::translator::{PreparedNetworkInterface, PreparedResources, Translator, TranslationError};
use crate::vmm::{StartRequest, VmmError, VmmManager};

pub use cancellation::{Cancelled, CancellationHandle};
pub use events::TaskEvent;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no task {0} is tracked by this executor")]
    NotFound(String),
    #[error("task {0} is already tracked by this executor")]
    AlreadyExists(String),
    #[error("task {task} is in state {state}, which does not support this operation")]
    InvalidState { task: String, state: TaskState },
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    ImagePreparation(#[from] ImagePreparerError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Vmm(#[from] VmmError),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("reconciling host state failed: {0}")]
    Reconciliation(#[from] std::io::Error),
}

impl From<Cancelled> for ExecutorError {
    fn from(_: Cancelled) -> Self {
        ExecutorError::Cancelled
    }
}

struct TaskBookkeeping {
    task: Task,
    rootfs_path: PathBuf,
}

pub struct Executor<R: CommandRunner, C: ContainerRuntime> {
    config: ExecutorConfig,
    image_preparer: ImagePreparer<R, C>,
    network_manager: NetworkManager<R>,
    vmm_manager: VmmManager<R>,
    tasks: RwLock<HashMap<TaskId, TaskBookkeeping>>,
    statuses: Arc<RwLock<HashMap<TaskId, TaskStatus>>>,
    events: Arc<events::EventBus>,
}

impl<R: CommandRunner, C: ContainerRuntime> Executor<R, C> {
    pub fn new(config: ExecutorConfig, runner: Arc<R>, container_runtime: Arc<C>) -> Self {
        Self::with_clock(config, runner, container_runtime, Arc::new(crate::capability::SystemClock))
    }

    /// As [`Executor::new`], but with the [`Clock`] driving the VMM's
    /// socket-readiness backoff and graceful-shutdown grace period
    /// injected explicitly (spec §9: capability objects over concrete
    /// bindings) — tests use this to avoid racing real wall-clock sleeps.
    pub fn with_clock(config: ExecutorConfig, runner: Arc<R>, container_runtime: Arc<C>, clock: Arc<dyn Clock>) -> Self {
        let image_preparer = ImagePreparer::new(&config, Arc::clone(&runner), container_runtime);
        let network_manager = NetworkManager::new(config.network.clone(), Arc::clone(&runner));
        let (vmm_manager, mut exit_events) = VmmManager::new(
            Arc::clone(&runner),
            clock,
            config.socket_dir.clone(),
            config.firecracker_binary.clone(),
            config.vmm_start_timeout,
            config.init_grace_period,
        );

        let events = Arc::new(events::EventBus::new(config.event_queue_capacity));
        let statuses: Arc<RwLock<HashMap<TaskId, TaskStatus>>> = Arc::new(RwLock::new(HashMap::new()));

        {
            let statuses = Arc::clone(&statuses);
            let events = Arc::clone(&events);
            tokio::spawn(async move {
                while let Some(exit_event) = exit_events.recv().await {
                    let state = if exit_event.success { TaskState::Complete } else { TaskState::Failed };
                    let mut status = TaskStatus::new(exit_event.task_id.clone(), state, exit_event.message.clone());
                    if !exit_event.success {
                        status = status.with_error(exit_event.message);
                    }
                    statuses.write().await.insert(exit_event.task_id.clone(), status.clone());
                    events.publish(status);
                }
            });
        }

        Self {
            config,
            image_preparer,
            network_manager,
            vmm_manager,
            tasks: RwLock::new(HashMap::new()),
            statuses,
            events,
        }
    }

    /// Pull the image, build the rootfs and allocate networking for `task`
    /// (spec §4.1 Prepare). Leaves the task in `Preparing` on success, ready
    /// for [`Executor::start`].
    pub async fn prepare(&self, task: Task, cancellation: &CancellationHandle) -> Result<(), ExecutorError> {
        let task_id = task.id.clone();

        if self.statuses.read().await.contains_key(&task_id) {
            return Err(ExecutorError::AlreadyExists(task_id.to_string()));
        }
        self.publish(task_id.clone(), TaskState::Accepted, "task accepted").await;
        self.publish(task_id.clone(), TaskState::Preparing, "preparing image and network").await;

        let deadline = self.config.image_pull_timeout + self.config.bridge_creation_timeout;
        let outcome = cancellation::run_with_deadline(cancellation, Some(deadline), self.do_prepare(&task)).await;

        match outcome {
            Ok(Ok(bookkeeping)) => {
                self.tasks.write().await.insert(task_id, bookkeeping);
                Ok(())
            }
            Ok(Err(err)) => {
                self.fail(&task_id, err.to_string()).await;
                Err(err)
            }
            Err(Cancelled) => {
                self.fail(&task_id, "prepare cancelled").await;
                Err(ExecutorError::Cancelled)
            }
        }
    }

    async fn do_prepare(&self, task: &Task) -> Result<TaskBookkeeping, ExecutorError> {
        let task_id = &task.id;
        let TaskRuntime::Container(ref spec) = task.runtime;

        let mut release = ReleaseStack::new();

        let rootfs = self.image_preparer.prepare(task_id, &spec.image).await?;
        {
            let rootfs_path = rootfs.path.clone();
            release.push("rootfs-file", async move {
                let _ = tokio::fs::remove_file(&rootfs_path).await;
            });
        }

        let network_result = self.network_manager.prepare_network(task_id).await;
        match network_result {
            Ok(_) => {
                release.disarm();
                Ok(TaskBookkeeping {
                    task: task.clone(),
                    rootfs_path: rootfs.path,
                })
            }
            Err(err) => {
                release.release_all().await;
                Err(err.into())
            }
        }
    }

    /// Translate the prepared task and spawn its hypervisor (spec §4.1
    /// Start). Requires `task_id` to be in `Preparing`.
    pub async fn start(&self, task_id: &TaskId, cancellation: &CancellationHandle) -> Result<(), ExecutorError> {
        self.require_state(task_id, TaskState::Preparing).await?;
        self.publish(task_id.clone(), TaskState::Starting, "starting hypervisor").await;

        let outcome =
            cancellation::run_with_deadline(cancellation, Some(self.config.vmm_start_timeout), self.do_start(task_id))
                .await;

        match outcome {
            Ok(Ok(())) => {
                self.publish(task_id.clone(), TaskState::Running, "hypervisor running").await;
                Ok(())
            }
            Ok(Err(err)) => {
                self.fail(task_id, err.to_string()).await;
                Err(err)
            }
            Err(Cancelled) => {
                self.fail(task_id, "start cancelled").await;
                Err(ExecutorError::Cancelled)
            }
        }
    }

    async fn do_start(&self, task_id: &TaskId) -> Result<(), ExecutorError> {
        let (task, rootfs_path) = {
            let tasks = self.tasks.read().await;
            let bookkeeping = tasks.get(task_id).ok_or_else(|| ExecutorError::NotFound(task_id.to_string()))?;
            (bookkeeping.task.clone(), bookkeeping.rootfs_path.clone())
        };

        let allocation = self
            .network_manager
            .allocation(task_id)
            .await
            .ok_or_else(|| ExecutorError::Internal(format!("no network allocation recorded for task {task_id}")))?;

        let resources = PreparedResources {
            rootfs_path: rootfs_path.to_string_lossy().into_owned(),
            network_interfaces: vec![PreparedNetworkInterface {
                network_id: task.networks.first().map(|n| n.network_id.clone()).unwrap_or_default(),
                tap_name: allocation.tap_name.clone(),
                mac: allocation.mac.clone(),
            }],
        };

        let translator = Translator::new(&self.config);
        let vmm_config = translator.translate(&task, &resources)?;

        let request = StartRequest {
            task_id,
            vmm_config: &vmm_config,
            tap_name: allocation.tap_name,
            ipv4: allocation.ipv4,
            rootfs_path,
        };
        self.vmm_manager.start(request).await?;
        Ok(())
    }

    /// Block until the task's hypervisor process exits (spec §4.1 Wait).
    pub async fn wait(&self, task_id: &TaskId) -> Result<TaskStatus, ExecutorError> {
        let status = self.vmm_manager.wait(task_id).await?;
        self.statuses.write().await.insert(task_id.clone(), status.clone());
        self.events.publish(status.clone());
        Ok(status)
    }

    /// Request graceful shutdown of the task's hypervisor (spec §4.1 Stop).
    /// Idempotent; the final state is observed via [`Executor::wait`] or the
    /// event stream, not this call's return value.
    pub async fn stop(&self, task_id: &TaskId) -> Result<(), ExecutorError> {
        self.vmm_manager.stop(task_id).await?;
        Ok(())
    }

    /// Tear down everything associated with `task_id`: stop the hypervisor,
    /// release its network allocation, delete its rootfs (spec §4.1 Remove).
    /// Idempotent.
    pub async fn remove(&self, task_id: &TaskId) -> Result<(), ExecutorError> {
        self.publish(task_id.clone(), TaskState::Removing, "removing task").await;

        self.vmm_manager.remove(task_id).await?;
        self.network_manager.cleanup_network(task_id).await?;

        self.tasks.write().await.remove(task_id);
        self.statuses.write().await.remove(task_id);
        info!(task_id = %task_id, "task removed");
        Ok(())
    }

    /// Align in-memory state with the host on restart (spec §7, scenario 6
    /// in spec §8): enumerate the rootfs and socket directories, delete
    /// sockets with no live process behind them, and record every task id
    /// with a live hypervisor the control plane no longer recognizes as
    /// `Orphaned` so a caller can follow up with [`Executor::remove`].
    /// Rootfs files classified as garbage are reported but not deleted —
    /// reclaiming them is the grace-period policy of the calling worker
    /// daemon, not this crate (spec §1).
    pub async fn reconcile(&self, known_task_ids: &HashSet<TaskId>) -> Result<ReconciliationReport, ExecutorError> {
        let report = reconcile::reconcile(&self.config.rootfs_dir, &self.config.socket_dir, known_task_ids).await?;
        report.delete_stale_sockets().await?;

        for task_id in &report.orphaned {
            self.publish(task_id.clone(), TaskState::Orphaned, "adopted as orphaned on restart").await;
        }

        Ok(report)
    }

    /// Current cached status, without driving any I/O (spec §4.1 Describe).
    pub async fn describe(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.statuses.read().await.get(task_id).cloned()
    }

    /// Subscribe to the bounded, lossy task-event stream (spec §4.1
    /// Events()).
    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    async fn require_state(&self, task_id: &TaskId, expected: TaskState) -> Result<(), ExecutorError> {
        let status = self
            .statuses
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| ExecutorError::NotFound(task_id.to_string()))?;
        if status.state != expected {
            return Err(ExecutorError::InvalidState {
                task: task_id.to_string(),
                state: status.state,
            });
        }
        Ok(())
    }

    async fn publish(&self, task_id: TaskId, state: TaskState, message: impl Into<String>) {
        let status = TaskStatus::new(task_id.clone(), state, message);
        self.statuses.write().await.insert(task_id, status.clone());
        self.events.publish(status);
    }

    async fn fail(&self, task_id: &TaskId, message: impl Into<String>) {
        let message = message.into();
        error!(task_id = %task_id, %message, "task failed");
        let status = TaskStatus::new(task_id.clone(), TaskState::Failed, message.clone()).with_error(message);
        self.statuses.write().await.insert(task_id.clone(), status.clone());
        self.events.publish(status);
    }
}
