//! The task data model (spec §3): the unit of work assigned by the fleet
//! orchestrator, and the mutable status record the executor maintains for it.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

/// A globally unique task identifier, as assigned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resource requirements a task's hypervisor must be sized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceRequirements {
    pub nano_cpus: u64,
    pub memory_bytes: u64,
}

/// A task's restart policy, as handed down by the orchestrator. The executor
/// itself does not act on this (restart decisions are the orchestrator's),
/// but it is carried through so it can be surfaced in status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub condition: RestartCondition,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCondition {
    Always,
    Never,
    OnFailure,
}

/// A network the task should be attached to, with any addresses the
/// orchestrator pre-assigned (currently unused by the host-local network
/// manager, which allocates addresses itself; carried through for forward
/// compatibility with multi-host overlay networking, which is a Non-goal
/// here).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network_id: String,
    pub addresses: Vec<String>,
}

/// The task's runtime spec. A tagged variant rather than an opaque payload
/// (spec §9): the translator pattern-matches on it, and future runtime kinds
/// (e.g. a raw-kernel runtime with no OCI image at all) add variants here
/// without disturbing `Task` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRuntime {
    Container(ContainerRuntimeSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntimeSpec {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// The unit of work. Immutable after acceptance (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub service_id: String,
    pub runtime: TaskRuntime,
    pub resources: ResourceRequirements,
    pub restart_policy: RestartPolicy,
    pub placement_constraints: Vec<String>,
    pub networks: Vec<NetworkAttachment>,
    /// Free-form annotations that may override per-task executor settings,
    /// e.g. `"init_system" => "dumb-init"` or `"grace_period_secs" => "5"`.
    pub annotations: HashMap<String, String>,
}

impl Task {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// The state set a [`TaskStatus`] moves through (spec §3). Valid transitions
/// form a DAG: `new -> accepted -> preparing -> starting -> running ->
/// {complete, failed}`; any state may transition to `{failed, removing}`;
/// `{complete, failed, rejected, orphaned}` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Starting,
    Running,
    Complete,
    Failed,
    Rejected,
    Removing,
    Orphaned,
}

impl TaskState {
    /// Whether `self` is a terminal state: no further transitions occur.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Failed | TaskState::Rejected | TaskState::Orphaned
        )
    }

    /// Whether transitioning from `self` to `next` is permitted by the DAG in
    /// spec §3. `Failed` and `Removing` are reachable from any state.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;

        if matches!(next, Failed | Removing) {
            return true;
        }

        matches!(
            (self, next),
            (New, Accepted)
                | (Accepted, Preparing)
                | (Preparing, Starting)
                | (Starting, Running)
                | (Running, Complete)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::New => "new",
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Accepted => "accepted",
            TaskState::Preparing => "preparing",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Removing => "removing",
            TaskState::Orphaned => "orphaned",
        };
        write!(f, "{s}")
    }
}

/// Mutable, executor-owned status record for a task (spec §3).
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub timestamp: SystemTime,
    pub message: String,
    pub error: Option<String>,
    /// Opaque runtime-status payload (e.g. the VMM's last reported state),
    /// not interpreted by the executor itself.
    pub runtime_status: Option<String>,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState, message: impl Into<String>) -> Self {
        Self {
            task_id,
            state,
            timestamp: SystemTime::now(),
            message: message.into(),
            error: None,
            runtime_status: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_runtime_status(mut self, runtime_status: impl Into<String>) -> Self {
        self.runtime_status = Some(runtime_status.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_the_documented_four() {
        for state in [
            TaskState::New,
            TaskState::Pending,
            TaskState::Assigned,
            TaskState::Accepted,
            TaskState::Preparing,
            TaskState::Starting,
            TaskState::Running,
            TaskState::Removing,
        ] {
            assert!(!state.is_terminal(), "{state} should not be terminal");
        }
        for state in [
            TaskState::Complete,
            TaskState::Failed,
            TaskState::Rejected,
            TaskState::Orphaned,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
    }

    #[test]
    fn any_state_can_transition_to_failed_or_removing() {
        for state in [
            TaskState::New,
            TaskState::Accepted,
            TaskState::Preparing,
            TaskState::Starting,
            TaskState::Running,
            TaskState::Complete,
        ] {
            assert!(state.can_transition_to(TaskState::Failed));
            assert!(state.can_transition_to(TaskState::Removing));
        }
    }

    #[test]
    fn happy_path_transitions_are_linear() {
        assert!(TaskState::New.can_transition_to(TaskState::Accepted));
        assert!(TaskState::Accepted.can_transition_to(TaskState::Preparing));
        assert!(TaskState::Preparing.can_transition_to(TaskState::Starting));
        assert!(TaskState::Starting.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Complete));

        assert!(!TaskState::New.can_transition_to(TaskState::Running));
        assert!(!TaskState::Complete.can_transition_to(TaskState::Running));
    }
}
