//! Move planning.
//!
//! Pure functions that turn a drag-and-drop gesture into the minimal set of
//! `(task, status, position)` assignments restoring dense ordering in every
//! column the move touches. Nothing here mutates state.

use taskboard_proto::status::StatusKey;
use taskboard_proto::task::{Task, TaskId, TaskPatch};

use super::partition::by_status;

/// Where a dragged task is dropped inside the destination column.
///
/// Indices and neighbours refer to the destination column with the moving
/// task already taken out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropTarget {
    /// Explicit index, clamped to the column length.
    Index(usize),
    /// Immediately before the given task.
    Before(TaskId),
    /// Immediately after the given task.
    After(TaskId),
    /// Bottom of the column.
    End,
}

/// A single placement to apply and persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Task to place.
    pub task_id: TaskId,
    /// Column it belongs to afterwards.
    pub status: StatusKey,
    /// Dense rank it gets afterwards.
    pub position: u32,
}

impl Assignment {
    /// The gateway patch carrying this placement.
    #[must_use]
    pub fn patch(&self) -> TaskPatch {
        TaskPatch::placement(self.status.clone(), self.position)
    }
}

/// Result of planning a move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    /// Task being moved.
    pub task_id: TaskId,
    /// Column the task leaves.
    pub from: StatusKey,
    /// Column the task lands in.
    pub to: StatusKey,
    /// Resolved destination index.
    pub index: usize,
    /// Placements whose status or position actually change.
    pub assignments: Vec<Assignment>,
}

impl MovePlan {
    /// Whether the move changes nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Columns affected by the move: source first, then destination.
    #[must_use]
    pub fn touched_statuses(&self) -> Vec<StatusKey> {
        if self.from == self.to {
            vec![self.from.clone()]
        } else {
            vec![self.from.clone(), self.to.clone()]
        }
    }

    /// Ids of every task the plan repositions.
    #[must_use]
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.assignments.iter().map(|a| a.task_id).collect()
    }
}

/// Plans moving `task` into `target_status` at `target`.
///
/// The moving task is removed from its source column, the source column is
/// renumbered, and the task is inserted into the destination column at the
/// resolved index before renumbering it. A target that cannot be resolved
/// (a neighbour that is not in the destination column, including the moving
/// task itself) places the task at the end. Only assignments that differ
/// from the current state are returned.
pub fn plan_move<'a, I>(
    tasks: I,
    task: &'a Task,
    target_status: &StatusKey,
    target: DropTarget,
) -> MovePlan
where
    I: IntoIterator<Item = &'a Task> + Clone,
{
    let source = without(by_status(tasks.clone(), &task.status), &task.id);
    let mut destination = if *target_status == task.status {
        source.clone()
    } else {
        without(by_status(tasks, target_status), &task.id)
    };

    let index = resolve_index(&destination, target);
    destination.insert(index, task);

    let mut assignments = Vec::new();
    if *target_status != task.status {
        renumber(&source, &task.status, &mut assignments);
    }
    renumber(&destination, target_status, &mut assignments);

    MovePlan {
        task_id: task.id,
        from: task.status.clone(),
        to: target_status.clone(),
        index,
        assignments,
    }
}

/// Plans the renumbering of `task`'s column after the task is deleted.
pub fn plan_removal<'a, I>(tasks: I, task: &Task) -> Vec<Assignment>
where
    I: IntoIterator<Item = &'a Task>,
{
    let remaining = without(by_status(tasks, &task.status), &task.id);
    let mut assignments = Vec::new();
    renumber(&remaining, &task.status, &mut assignments);
    assignments
}

/// Plans renumbering a column back to `0..len` in its current order.
pub fn plan_compaction<'a, I>(tasks: I, status: &StatusKey) -> Vec<Assignment>
where
    I: IntoIterator<Item = &'a Task>,
{
    let column = by_status(tasks, status);
    let mut assignments = Vec::new();
    renumber(&column, status, &mut assignments);
    assignments
}

/// Converts a column index into a stored position.
pub(crate) fn rank(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

fn without<'a>(column: Vec<&'a Task>, id: &TaskId) -> Vec<&'a Task> {
    column.into_iter().filter(|t| t.id != *id).collect()
}

fn resolve_index(destination: &[&Task], target: DropTarget) -> usize {
    let len = destination.len();
    let find = |id: TaskId| destination.iter().position(|t| t.id == id);
    match target {
        DropTarget::Index(index) => index.min(len),
        DropTarget::End => len,
        DropTarget::Before(id) => find(id).unwrap_or(len),
        DropTarget::After(id) => find(id).map_or(len, |i| i + 1),
    }
}

fn renumber(column: &[&Task], status: &StatusKey, out: &mut Vec<Assignment>) {
    for (index, task) in column.iter().enumerate() {
        let position = rank(index);
        if task.status != *status || task.position != position {
            out.push(Assignment {
                task_id: task.id,
                status: status.clone(),
                position,
            });
        }
    }
}
