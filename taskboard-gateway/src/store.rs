//! Authoritative in-memory task store.
//!
//! The [`BoardStore`] is the single source of truth every client reconciles
//! against. Writes are validated the same way for every client and report the
//! columns they touched so the server can notify the other clients.

use std::collections::HashMap;

use chrono::Utc;
use taskboard_proto::gateway::GatewayFault;
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{Task, TaskId, TaskPatch, validate_title};
use tokio::sync::RwLock;

/// Thread-safe map of every task on the board.
pub struct BoardStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    columns: StatusSet,
}

impl Default for BoardStore {
    fn default() -> Self {
        Self::new(StatusSet::standard())
    }
}

impl BoardStore {
    /// Creates an empty store for the given columns.
    #[must_use]
    pub fn new(columns: StatusSet) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            columns,
        }
    }

    /// Columns configured on this board.
    #[must_use]
    pub const fn columns(&self) -> &StatusSet {
        &self.columns
    }

    /// Number of stored tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Returns a copy of one task.
    pub async fn get(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Tasks in `status`, ordered by position, then creation time, then id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayFault::UnknownStatus`] if `status` is not a column.
    pub async fn fetch_partition(&self, status: &StatusKey) -> Result<Vec<Task>, GatewayFault> {
        self.check_status(status)?;
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == *status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    /// Applies a partial update, returning the columns it touched.
    ///
    /// Applying the same patch twice leaves the task as after the first time
    /// (apart from `updated_at`).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayFault`] if the task is missing, the target column is
    /// unknown, or the new title is invalid.
    pub async fn persist(
        &self,
        task_id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<Vec<StatusKey>, GatewayFault> {
        if let Some(status) = &patch.status {
            self.check_status(status)?;
        }
        if let Some(title) = &patch.title {
            validate_title(title).map_err(|e| GatewayFault::InvalidTask(e.to_string()))?;
        }

        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id).ok_or(GatewayFault::TaskNotFound(*task_id))?;
        let before = task.status.clone();
        task.apply_patch(patch, Utc::now());
        let after = task.status.clone();
        drop(tasks);

        Ok(touched(before, Some(after)))
    }

    /// Creates a task, or overwrites an existing one with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayFault`] if the column is unknown or the title is
    /// invalid.
    pub async fn insert(&self, task: Task) -> Result<Vec<StatusKey>, GatewayFault> {
        self.check_status(&task.status)?;
        validate_title(&task.title).map_err(|e| GatewayFault::InvalidTask(e.to_string()))?;

        let status = task.status.clone();
        let previous = self.tasks.write().await.insert(task.id, task);
        Ok(touched(status, previous.map(|p| p.status)))
    }

    /// Deletes a task. Deleting an absent task succeeds and touches nothing.
    pub async fn remove(&self, task_id: &TaskId) -> Vec<StatusKey> {
        self.tasks
            .write()
            .await
            .remove(task_id)
            .map(|t| vec![t.status])
            .unwrap_or_default()
    }

    fn check_status(&self, status: &StatusKey) -> Result<(), GatewayFault> {
        if self.columns.contains(status) {
            Ok(())
        } else {
            Err(GatewayFault::UnknownStatus(status.clone()))
        }
    }
}

fn touched(first: StatusKey, second: Option<StatusKey>) -> Vec<StatusKey> {
    match second {
        Some(second) if second != first => vec![first, second],
        _ => vec![first],
    }
}
