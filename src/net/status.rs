use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Group,
    Leaf,
}

/// Lifecycle of a network operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Connecting,
    Running,
    Paused,
    Aborted,
    Completed,
    Errored,
}

impl TaskStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Aborted => "Aborted",
            Self::Completed => "Completed",
            Self::Errored => "Errored",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Aborted | Self::Completed | Self::Errored)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Connecting => &[Running, Paused, Aborted, Completed, Errored],
            Running => &[Paused, Aborted, Completed, Errored],
            Paused => &[Connecting, Running, Aborted, Completed, Errored],
            Aborted | Completed | Errored => &[],
        }
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    // Higher wins when folding children into a group status.
    fn group_rank(self) -> u8 {
        match self {
            Self::Running => 5,
            Self::Connecting => 4,
            Self::Paused => 3,
            Self::Errored => 2,
            Self::Aborted => 1,
            Self::Completed => 0,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Status of a group given the statuses of its children. An empty group is Completed.
pub fn aggregate_status<I>(children: I) -> TaskStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    children
        .into_iter()
        .max_by_key(|s| s.group_rank())
        .unwrap_or(TaskStatus::Completed)
}
