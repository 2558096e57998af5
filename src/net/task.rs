use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::manager::NetManager;
use super::status::{TaskId, TaskStatus};
use crate::error::FetchError;

/// Worker-side handle of a leaf task.
///
/// The worker reports progress through it and observes pause/abort requests made on the
/// manager. Dropping a handle whose task has not finished marks the task Errored.
pub struct NetTask {
    manager: Arc<NetManager>,
    id: TaskId,
    token: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl NetTask {
    pub(crate) fn new(
        manager: Arc<NetManager>,
        id: TaskId,
        token: CancellationToken,
        paused: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            id,
            token,
            paused,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.manager.status(self.id)
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.manager.leaf_set_total(self.id, total);
    }

    /// Connection established, data is flowing.
    pub fn set_running(&self) {
        self.manager.leaf_set_running(self.id);
    }

    pub fn add_progress(&self, bytes: u64) {
        self.manager.leaf_progress(self.id, bytes);
    }

    pub fn complete(&self) {
        self.manager.leaf_finish(self.id, TaskStatus::Completed, None);
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.manager
            .leaf_finish(self.id, TaskStatus::Errored, Some(message.into()));
    }

    /// Abort this task from the worker side, e.g. on shutdown.
    pub fn abort(&self) {
        self.manager.abort(self.id);
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Resolves once the task is aborted.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Resolves once the task is paused.
    pub async fn paused(&self) {
        let mut paused = self.paused.clone();
        if paused.wait_for(|p| *p).await.is_err() {
            // Sender gone: the node was removed and can never be paused again.
            std::future::pending::<()>().await;
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Block while the task is paused. Fails with `FetchError::Aborted` if it gets aborted.
    pub async fn wait_while_paused(&self) -> Result<(), FetchError> {
        let mut paused = self.paused.clone();
        loop {
            if self.token.is_cancelled() {
                return Err(FetchError::Aborted);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.token.cancelled() => return Err(FetchError::Aborted),
                changed = paused.changed() => {
                    if changed.is_err() {
                        // Sender gone: the node was removed from the tree.
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Drop for NetTask {
    fn drop(&mut self) {
        self.manager.leaf_finish(
            self.id,
            TaskStatus::Errored,
            Some("task handle dropped".to_string()),
        );
    }
}
