//! The task event stream (spec §4.1 `Events()`). A bounded, lossy broadcast:
//! slow subscribers miss old events rather than backpressuring the executor,
//! mirroring the teacher's `broadcast`-based response buses (e.g.
//! `fs_backend/proxy.rs`) rather than an unbounded queue.

use tokio::sync::broadcast;
use tracing::warn;

use crate::task::TaskStatus;

/// A status change for a single task, published every time the executor
/// records a new [`TaskStatus`].
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub status: TaskStatus,
}

pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events. A subscriber that lags behind by more
    /// than the channel's capacity sees its oldest unread events dropped;
    /// the next `recv()` returns `RecvError::Lagged` rather than blocking.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, status: TaskStatus) {
        // send() errors only when there are zero receivers, which is a
        // normal, non-erroneous state for this executor (nobody is watching
        // yet) rather than a dropped event.
        if self.sender.send(TaskEvent { status }).is_err() {
            warn!("published a task event with no active subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::task::{TaskId, TaskState};

    fn status(state: TaskState) -> TaskStatus {
        TaskStatus {
            task_id: TaskId::new("t1"),
            state,
            timestamp: SystemTime::now(),
            message: "test".into(),
            error: None,
            runtime_status: None,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(status(TaskState::Running));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status.state, TaskState::Running);
    }

    #[tokio::test]
    async fn full_channel_drops_oldest_for_lagging_subscribers() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        bus.publish(status(TaskState::Accepted));
        bus.publish(status(TaskState::Preparing));
        bus.publish(status(TaskState::Starting));

        let result = rx.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }
}
