//! Ordered per-column views derived from the flat task store.

use serde::Serialize;

use taskboard_proto::status::StatusKey;
use taskboard_proto::task::Task;

/// Snapshot of one column in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    /// Column status.
    pub status: StatusKey,
    /// Tasks sorted by position.
    pub tasks: Vec<Task>,
}

impl Column {
    /// Whether positions are exactly `0..len`.
    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.tasks
            .iter()
            .enumerate()
            .all(|(i, t)| usize::try_from(t.position).is_ok_and(|p| p == i))
    }

    /// Task titles in order, handy for logs and assertions.
    #[must_use]
    pub fn titles(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.title.as_str()).collect()
    }
}

/// Tasks with `status`, sorted ascending by position.
///
/// Duplicate positions only occur transiently; they are ordered by creation
/// time and then id so the order is always total.
pub fn by_status<'a>(
    tasks: impl IntoIterator<Item = &'a Task>,
    status: &StatusKey,
) -> Vec<&'a Task> {
    let mut column: Vec<&Task> = tasks.into_iter().filter(|t| t.status == *status).collect();
    column.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    column
}

/// Owned snapshots of the given columns, in the order given.
pub fn snapshot<'a>(
    tasks: impl IntoIterator<Item = &'a Task> + Clone,
    statuses: &[StatusKey],
) -> Vec<Column> {
    statuses
        .iter()
        .map(|status| Column {
            status: status.clone(),
            tasks: by_status(tasks.clone(), status).into_iter().cloned().collect(),
        })
        .collect()
}

/// Whether an ordered column satisfies the density invariant.
#[must_use]
pub fn is_dense(column: &[&Task]) -> bool {
    column
        .iter()
        .enumerate()
        .all(|(i, t)| usize::try_from(t.position).is_ok_and(|p| p == i))
}
