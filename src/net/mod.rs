// Network task tracking: a hierarchy of groups and leaves with status propagation.

pub mod event;
pub mod manager;
pub mod status;
pub mod task;

pub use event::{ListenerId, NetTaskListener, TaskEvent};
pub use manager::{NetManager, TaskSnapshot};
pub use status::{aggregate_status, TaskId, TaskKind, TaskStatus};
pub use task::NetTask;
