// Observable tree of network operations: groups aggregate the state of their leaves.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::event::{ListenerId, NetTaskListener, TaskEvent};
use super::status::{aggregate_status, TaskId, TaskKind, TaskStatus};
use super::task::NetTask;

struct LeafControl {
    token: CancellationToken,
    paused: watch::Sender<bool>,
}

struct Node {
    id: TaskId,
    parent: Option<TaskId>,
    kind: TaskKind,
    title: String,
    url: Option<String>,
    status: TaskStatus,
    /// Status restored by `resume`.
    resume_to: TaskStatus,
    bytes: u64,
    total: Option<u64>,
    error: Option<String>,
    children: Vec<TaskId>,
    finished_at: Option<Instant>,
    control: Option<LeafControl>,
}

impl Node {
    fn snapshot(&self, depth: usize) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            parent: self.parent,
            kind: self.kind,
            title: self.title.clone(),
            url: self.url.clone(),
            status: self.status,
            bytes: self.bytes,
            total: self.total,
            error: self.error.clone(),
            depth,
            children: self.children.clone(),
        }
    }
}

/// Point-in-time view of one node, shaped for a table row.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub kind: TaskKind,
    pub title: String,
    pub url: Option<String>,
    pub status: TaskStatus,
    pub bytes: u64,
    pub total: Option<u64>,
    pub error: Option<String>,
    pub depth: usize,
    pub children: Vec<TaskId>,
}

impl TaskSnapshot {
    /// Completed share in `[0, 1]`, when the total size is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.bytes as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<TaskId, Node>,
    roots: Vec<TaskId>,
}

impl Tree {
    fn insert(&mut self, node: Node, events: &mut Vec<TaskEvent>) -> Result<()> {
        let id = node.id;
        let parent = node.parent;
        match parent {
            Some(parent_id) => {
                let p = self
                    .nodes
                    .get_mut(&parent_id)
                    .ok_or_else(|| anyhow!("unknown parent task {}", parent_id))?;
                if p.kind != TaskKind::Group {
                    return Err(anyhow!("task {} is not a group", parent_id));
                }
                p.children.push(id);
            }
            None => self.roots.push(id),
        }
        events.push(TaskEvent::Added {
            id,
            parent,
            kind: node.kind,
        });
        self.nodes.insert(id, node);
        self.recompute_ancestors(parent, events);
        Ok(())
    }

    fn depth(&self, id: TaskId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(parent) = current {
            depth += 1;
            current = self.nodes.get(&parent).and_then(|n| n.parent);
        }
        depth
    }

    /// Preorder ids of `id` and everything below it.
    fn subtree(&self, id: TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                out.push(current);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    fn leaves(&self, id: TaskId) -> Vec<TaskId> {
        self.subtree(id)
            .into_iter()
            .filter(|n| {
                self.nodes
                    .get(n)
                    .map_or(false, |node| node.kind == TaskKind::Leaf)
            })
            .collect()
    }

    fn detach(&mut self, id: TaskId, parent: Option<TaskId>) {
        match parent {
            Some(parent) => {
                if let Some(p) = self.nodes.get_mut(&parent) {
                    p.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
    }

    fn set_leaf_status(&mut self, id: TaskId, to: TaskStatus, events: &mut Vec<TaskEvent>) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        let from = node.status;
        if from == to {
            return false;
        }
        if !from.can_transition_to(to) {
            debug!("ignoring illegal transition {} -> {} for task {}", from, to, id);
            return false;
        }

        node.status = to;
        if to.is_terminal() {
            node.finished_at = Some(Instant::now());
        }
        if let Some(control) = &node.control {
            control.paused.send_replace(to == TaskStatus::Paused);
            if to == TaskStatus::Aborted {
                control.token.cancel();
            }
        }
        events.push(TaskEvent::StatusChanged { id, from, to });

        let parent = node.parent;
        self.recompute_ancestors(parent, events);
        true
    }

    fn aggregate(&self, node: &Node) -> (TaskStatus, u64, Option<u64>) {
        let mut statuses = Vec::with_capacity(node.children.len());
        let mut bytes = 0u64;
        let mut total = Some(0u64);
        for child in node.children.iter().filter_map(|c| self.nodes.get(c)) {
            statuses.push(child.status);
            bytes += child.bytes;
            total = match (total, child.total) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            };
        }
        (aggregate_status(statuses), bytes, total)
    }

    /// Re-derive group state upward from `start`, stopping once nothing changes.
    fn recompute_ancestors(&mut self, start: Option<TaskId>, events: &mut Vec<TaskEvent>) {
        let mut current = start;
        while let Some(id) = current {
            let (status, bytes, total) = match self.nodes.get(&id) {
                Some(node) => self.aggregate(node),
                None => return,
            };
            let Some(node) = self.nodes.get_mut(&id) else {
                return;
            };

            let mut changed = false;
            if node.status != status {
                events.push(TaskEvent::StatusChanged {
                    id,
                    from: node.status,
                    to: status,
                });
                node.status = status;
                node.finished_at = status.is_terminal().then(Instant::now);
                changed = true;
            }
            if node.bytes != bytes || node.total != total {
                node.bytes = bytes;
                node.total = total;
                events.push(TaskEvent::Progress { id, bytes, total });
                changed = true;
            }
            if !changed {
                return;
            }
            current = node.parent;
        }
    }
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<TaskEvent>,
    running: bool,
}

// Clears the `running` flag if a listener panics mid-drain.
struct DrainGuard<'a> {
    dispatch: &'a Mutex<Dispatch>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dispatch.lock().running = false;
        }
    }
}

/// Registry of every tracked network operation.
///
/// Groups hold no state of their own: status, bytes and total are derived from their
/// children whenever a leaf changes. Events are queued under the tree lock, so listeners
/// see them in mutation order, and delivered after the lock is released.
pub struct NetManager {
    tree: Mutex<Tree>,
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn NetTaskListener>)>>,
    next_listener: AtomicU64,
    dispatch: Mutex<Dispatch>,
}

impl NetManager {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Tree::default()),
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            dispatch: Mutex::new(Dispatch::default()),
        }
    }

    fn allocate_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn apply<R>(&self, f: impl FnOnce(&mut Tree, &mut Vec<TaskEvent>) -> R) -> R {
        let result = {
            let mut tree = self.tree.lock();
            let mut events = Vec::new();
            let result = f(&mut tree, &mut events);
            if !events.is_empty() {
                self.dispatch.lock().queue.extend(events);
            }
            result
        };
        self.drain_events();
        result
    }

    fn drain_events(&self) {
        {
            let mut dispatch = self.dispatch.lock();
            if dispatch.running || dispatch.queue.is_empty() {
                return;
            }
            dispatch.running = true;
        }

        let mut guard = DrainGuard {
            dispatch: &self.dispatch,
            armed: true,
        };
        loop {
            let event = {
                let mut dispatch = self.dispatch.lock();
                match dispatch.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        dispatch.running = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            let listeners: Vec<Arc<dyn NetTaskListener>> = self
                .listeners
                .read()
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in &listeners {
                listener.on_event(&event);
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn NetTaskListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Create a group under `parent` (or at the top level).
    pub fn create_group(&self, parent: Option<TaskId>, title: &str) -> Result<TaskId> {
        let id = self.allocate_id();
        let node = Node {
            id,
            parent,
            kind: TaskKind::Group,
            title: title.to_string(),
            url: None,
            status: TaskStatus::Completed,
            resume_to: TaskStatus::Completed,
            bytes: 0,
            total: Some(0),
            error: None,
            children: Vec::new(),
            finished_at: None,
            control: None,
        };
        self.apply(|tree, events| tree.insert(node, events))?;
        debug!("task group {} created: {}", id, title);
        Ok(id)
    }

    /// Register a new leaf in Connecting state and hand its control handle to the worker.
    pub fn register(
        self: &Arc<Self>,
        parent: Option<TaskId>,
        title: &str,
        url: &str,
    ) -> Result<NetTask> {
        let id = self.allocate_id();
        let token = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let node = Node {
            id,
            parent,
            kind: TaskKind::Leaf,
            title: title.to_string(),
            url: Some(url.to_string()),
            status: TaskStatus::Connecting,
            resume_to: TaskStatus::Connecting,
            bytes: 0,
            total: None,
            error: None,
            children: Vec::new(),
            finished_at: None,
            control: Some(LeafControl {
                token: token.clone(),
                paused: paused_tx,
            }),
        };
        self.apply(|tree, events| tree.insert(node, events))?;
        debug!("net task {} registered url={}", id, url);
        Ok(NetTask::new(Arc::clone(self), id, token, paused_rx))
    }

    /// Pause every connecting or running leaf at or below `id`.
    pub fn pause(&self, id: TaskId) -> bool {
        self.apply(|tree, events| {
            let mut changed = false;
            for leaf in tree.leaves(id) {
                let status = match tree.nodes.get(&leaf) {
                    Some(node) => node.status,
                    None => continue,
                };
                if !matches!(status, TaskStatus::Connecting | TaskStatus::Running) {
                    continue;
                }
                if let Some(node) = tree.nodes.get_mut(&leaf) {
                    node.resume_to = status;
                }
                changed |= tree.set_leaf_status(leaf, TaskStatus::Paused, events);
            }
            changed
        })
    }

    /// Resume every paused leaf at or below `id`.
    pub fn resume(&self, id: TaskId) -> bool {
        self.apply(|tree, events| {
            let mut changed = false;
            for leaf in tree.leaves(id) {
                let resume_to = match tree.nodes.get(&leaf) {
                    Some(node) if node.status == TaskStatus::Paused => node.resume_to,
                    _ => continue,
                };
                changed |= tree.set_leaf_status(leaf, resume_to, events);
            }
            changed
        })
    }

    /// Abort every unfinished leaf at or below `id`, cancelling their workers.
    pub fn abort(&self, id: TaskId) -> bool {
        self.apply(|tree, events| {
            let mut changed = false;
            for leaf in tree.leaves(id) {
                changed |= tree.set_leaf_status(leaf, TaskStatus::Aborted, events);
            }
            changed
        })
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.tree.lock().nodes.get(&id).map(|n| n.status)
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        let tree = self.tree.lock();
        let depth = tree.depth(id);
        tree.nodes.get(&id).map(|n| n.snapshot(depth))
    }

    /// Every node in depth-first order, ready to render as indented rows.
    pub fn tree(&self) -> Vec<TaskSnapshot> {
        let tree = self.tree.lock();
        let mut rows = Vec::with_capacity(tree.nodes.len());
        let mut stack: Vec<(TaskId, usize)> = tree.roots.iter().rev().map(|id| (*id, 0)).collect();
        while let Some((id, depth)) = stack.pop() {
            if let Some(node) = tree.nodes.get(&id) {
                rows.push(node.snapshot(depth));
                stack.extend(node.children.iter().rev().map(|c| (*c, depth + 1)));
            }
        }
        rows
    }

    pub fn roots(&self) -> Vec<TaskId> {
        self.tree.lock().roots.clone()
    }

    pub fn len(&self) -> usize {
        self.tree.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `id` and its subtree. Fails while any leaf below it is still active.
    pub fn remove(&self, id: TaskId) -> Result<bool> {
        self.apply(|tree, events| {
            let Some(parent) = tree.nodes.get(&id).map(|n| n.parent) else {
                return Ok(false);
            };
            let subtree = tree.subtree(id);
            let active = subtree.iter().any(|n| {
                tree.nodes.get(n).map_or(false, |node| {
                    node.kind == TaskKind::Leaf && node.status.is_active()
                })
            });
            if active {
                return Err(anyhow!("task {} still has active transfers", id));
            }

            tree.detach(id, parent);
            for node in subtree.iter().rev() {
                tree.nodes.remove(node);
                events.push(TaskEvent::Removed { id: *node });
            }
            tree.recompute_ancestors(parent, events);
            Ok(true)
        })
    }

    /// Drop finished leaves that ended at least `older_than` ago. Groups are kept.
    pub fn remove_finished(&self, older_than: Duration) -> usize {
        self.apply(|tree, events| {
            let now = Instant::now();
            let mut victims: Vec<(TaskId, Option<TaskId>)> = tree
                .nodes
                .values()
                .filter(|n| n.kind == TaskKind::Leaf && n.status.is_terminal())
                .filter(|n| {
                    n.finished_at
                        .map_or(false, |t| now.duration_since(t) >= older_than)
                })
                .map(|n| (n.id, n.parent))
                .collect();
            victims.sort();

            let mut parents = BTreeSet::new();
            for (id, parent) in &victims {
                tree.detach(*id, *parent);
                tree.nodes.remove(id);
                events.push(TaskEvent::Removed { id: *id });
                if let Some(parent) = parent {
                    parents.insert(*parent);
                }
            }
            for parent in parents {
                tree.recompute_ancestors(Some(parent), events);
            }
            victims.len()
        })
    }

    pub(crate) fn leaf_set_total(&self, id: TaskId, total: Option<u64>) {
        self.apply(|tree, events| {
            let Some(node) = tree.nodes.get_mut(&id) else {
                return;
            };
            if node.status.is_terminal() || node.total == total {
                return;
            }
            node.total = total;
            events.push(TaskEvent::Progress {
                id,
                bytes: node.bytes,
                total,
            });
            let parent = node.parent;
            tree.recompute_ancestors(parent, events);
        })
    }

    pub(crate) fn leaf_set_running(&self, id: TaskId) {
        self.apply(|tree, events| {
            let Some(node) = tree.nodes.get_mut(&id) else {
                return;
            };
            if node.status == TaskStatus::Paused {
                // Takes effect on resume.
                node.resume_to = TaskStatus::Running;
                return;
            }
            tree.set_leaf_status(id, TaskStatus::Running, events);
        })
    }

    pub(crate) fn leaf_progress(&self, id: TaskId, bytes: u64) {
        self.apply(|tree, events| {
            let Some(node) = tree.nodes.get_mut(&id) else {
                return;
            };
            if node.status.is_terminal() {
                return;
            }
            node.bytes += bytes;
            events.push(TaskEvent::Progress {
                id,
                bytes: node.bytes,
                total: node.total,
            });
            let parent = node.parent;
            tree.recompute_ancestors(parent, events);
        })
    }

    pub(crate) fn leaf_finish(&self, id: TaskId, to: TaskStatus, error: Option<String>) -> bool {
        self.apply(|tree, events| {
            let Some(node) = tree.nodes.get_mut(&id) else {
                return false;
            };
            if node.status.is_terminal() {
                return false;
            }
            if error.is_some() {
                node.error = error;
            }
            tree.set_leaf_status(id, to, events)
        })
    }
}

impl Default for NetManager {
    fn default() -> Self {
        Self::new()
    }
}
