use super::status::{TaskId, TaskKind, TaskStatus};

/// Change notification emitted by the task tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Added {
        id: TaskId,
        parent: Option<TaskId>,
        kind: TaskKind,
    },
    StatusChanged {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    Progress {
        id: TaskId,
        bytes: u64,
        total: Option<u64>,
    },
    Removed {
        id: TaskId,
    },
}

impl TaskEvent {
    pub fn id(&self) -> TaskId {
        match self {
            TaskEvent::Added { id, .. }
            | TaskEvent::StatusChanged { id, .. }
            | TaskEvent::Progress { id, .. }
            | TaskEvent::Removed { id } => *id,
        }
    }
}

/// Observer of task tree changes, e.g. a table view model.
///
/// Called without the tree lock held, so implementations may query or mutate the manager.
pub trait NetTaskListener: Send + Sync {
    fn on_event(&self, event: &TaskEvent);
}

impl<F> NetTaskListener for F
where
    F: Fn(&TaskEvent) + Send + Sync,
{
    fn on_event(&self, event: &TaskEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
