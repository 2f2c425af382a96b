//! Canonical in-memory task store.
//!
//! `TaskStore` is plain data plus a change feed: it enforces no ordering
//! rules of its own. Callers (the executor) keep the column invariants.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use taskboard_proto::status::StatusKey;
use taskboard_proto::task::{Task, TaskId, TaskPatch};

use super::BoardError;

/// Notification emitted after every store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A task was inserted or changed.
    Upserted(TaskId),
    /// A task was removed.
    Removed(TaskId),
    /// A whole column was replaced from authoritative state.
    Replaced(StatusKey),
}

/// Owned map of all tasks on the board, keyed by id.
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    changes: broadcast::Sender<StoreChange>,
}

impl TaskStore {
    /// Creates an empty store whose change feed buffers `change_buffer`
    /// notifications per subscriber.
    #[must_use]
    pub fn new(change_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        Self {
            tasks: HashMap::new(),
            changes,
        }
    }

    /// Subscribes to the change feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Every task, in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &Task> + Clone {
        self.tasks.values()
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Looks up a task.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::TaskNotFound`] if the id is unknown.
    pub fn get(&self, id: &TaskId) -> Result<&Task, BoardError> {
        self.tasks.get(id).ok_or(BoardError::TaskNotFound(*id))
    }

    /// Inserts or replaces a task, returning the previous version.
    pub fn upsert(&mut self, task: Task) -> Option<Task> {
        let id = task.id;
        let previous = self.tasks.insert(id, task);
        self.notify(StoreChange::Upserted(id));
        previous
    }

    /// Removes a task, returning it if it existed.
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let removed = self.tasks.remove(id);
        if removed.is_some() {
            self.notify(StoreChange::Removed(*id));
        }
        removed
    }

    /// Sets a task's status and position, leaving every other field alone.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::TaskNotFound`] if the id is unknown.
    pub fn place(
        &mut self,
        id: &TaskId,
        status: StatusKey,
        position: u32,
    ) -> Result<(), BoardError> {
        let task = self.get_mut(id)?;
        task.status = status;
        task.position = position;
        self.notify(StoreChange::Upserted(*id));
        Ok(())
    }

    /// Applies a field patch to a task.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::TaskNotFound`] if the id is unknown.
    pub fn edit(
        &mut self,
        id: &TaskId,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<(), BoardError> {
        self.get_mut(id)?.apply_patch(patch, now);
        self.notify(StoreChange::Upserted(*id));
        Ok(())
    }

    /// Replaces the contents of one column with `fetched`.
    ///
    /// Tasks currently in `status` are dropped and the fetched tasks are
    /// inserted, except for ids for which `keep` returns `true`: those keep
    /// their local version wherever it currently lives. Returns the number
    /// of fetched tasks that were applied.
    pub fn replace_partition(
        &mut self,
        status: &StatusKey,
        fetched: Vec<Task>,
        keep: impl Fn(&TaskId) -> bool,
    ) -> usize {
        let dropped: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status == *status && !keep(&t.id))
            .map(|t| t.id)
            .collect();
        for id in &dropped {
            self.tasks.remove(id);
        }

        let mut applied = 0;
        for task in fetched {
            if keep(&task.id) {
                continue;
            }
            self.tasks.insert(task.id, task);
            applied += 1;
        }

        self.notify(StoreChange::Replaced(status.clone()));
        applied
    }

    fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task, BoardError> {
        self.tasks.get_mut(id).ok_or(BoardError::TaskNotFound(*id))
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}
