//! Task model shared by the board engine and the gateway.
//!
//! A [`Task`] is the unit of work on a board. Its [`TaskId`] never changes;
//! moves only rewrite `status` and `position`. Partial updates travel as a
//! [`TaskPatch`], which is also the payload of the gateway's idempotent
//! `persist` call.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::StatusKey;

/// Maximum allowed task title length in characters.
pub const MAX_TASK_TITLE_LENGTH: usize = 256;

/// Unique identifier for a task, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new time-ordered task identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `TaskId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque reference to a user (creator or assignee).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a user reference from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this user reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Can wait.
    Low,
    /// Normal priority.
    #[default]
    Medium,
    /// Should be picked up soon.
    High,
    /// Drop everything.
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

/// Error returned when parsing an unknown priority name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown priority: {0} (expected low, medium, high or urgent)")]
pub struct ParsePriorityError(String);

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}

/// Reasons a task title is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TitleError {
    /// Title is empty.
    #[error("task title cannot be empty")]
    Empty,
    /// Title exceeds [`MAX_TASK_TITLE_LENGTH`] characters.
    #[error("task title too long (max 256 characters)")]
    TooLong,
}

/// Checks a title against the board's title rules.
///
/// Length is counted in characters, not bytes. A whitespace-only title is
/// treated as empty.
///
/// # Errors
///
/// Returns [`TitleError::Empty`] or [`TitleError::TooLong`].
pub fn validate_title(title: &str) -> Result<(), TitleError> {
    if title.trim().is_empty() {
        return Err(TitleError::Empty);
    }
    if title.chars().count() > MAX_TASK_TITLE_LENGTH {
        return Err(TitleError::TooLong);
    }
    Ok(())
}

/// A work item on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity (UUID v7).
    pub id: TaskId,
    /// Non-empty title.
    pub title: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Priority.
    pub priority: Priority,
    /// Column the task belongs to.
    pub status: StatusKey,
    /// Dense rank within the column.
    pub position: u32,
    /// Assigned user, if any.
    pub assignee: Option<UserId>,
    /// Due date, if any.
    pub due_date: Option<NaiveDate>,
    /// Tags (set semantics).
    pub tags: BTreeSet<String>,
    /// User who created the task.
    pub created_by: UserId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Builds a task from creation fields at the given placement.
    #[must_use]
    pub fn from_new(
        id: TaskId,
        fields: NewTask,
        status: StatusKey,
        position: u32,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title: fields.title,
            description: fields.description,
            priority: fields.priority,
            status,
            position,
            assignee: fields.assignee,
            due_date: fields.due_date,
            tags: fields.tags,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies every field present in `patch` and bumps `updated_at`.
    pub fn apply_patch(&mut self, patch: &TaskPatch, now: DateTime<Utc>) {
        if let Some(title) = &patch.title {
            self.title.clone_from(title);
        }
        if let Some(description) = &patch.description {
            self.description.clone_from(description);
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(status) = &patch.status {
            self.status.clone_from(status);
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(assignee) = &patch.assignee {
            self.assignee.clone_from(assignee);
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        if let Some(tags) = &patch.tags {
            self.tags.clone_from(tags);
        }
        self.updated_at = now;
    }
}

/// Fields supplied when creating a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    /// Title (validated with [`validate_title`]).
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Priority.
    pub priority: Priority,
    /// Target column; the board's default column when `None`.
    pub status: Option<StatusKey>,
    /// Optional assignee.
    pub assignee: Option<UserId>,
    /// Optional due date.
    pub due_date: Option<NaiveDate>,
    /// Tags.
    pub tags: BTreeSet<String>,
}

impl NewTask {
    /// Creation fields with just a title.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Sets the target column.
    #[must_use]
    pub fn in_status(mut self, status: StatusKey) -> Self {
        self.status = Some(status);
        self
    }
}

/// Partial update of a task.
///
/// Every field is optional; clearable fields nest a second `Option` so
/// that `Some(None)` clears the value and `None` leaves it alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New description (`Some(None)` clears it).
    pub description: Option<Option<String>>,
    /// New priority.
    pub priority: Option<Priority>,
    /// New column.
    pub status: Option<StatusKey>,
    /// New position.
    pub position: Option<u32>,
    /// New assignee (`Some(None)` unassigns).
    pub assignee: Option<Option<UserId>>,
    /// New due date (`Some(None)` clears it).
    pub due_date: Option<Option<NaiveDate>>,
    /// Replacement tag set.
    pub tags: Option<BTreeSet<String>>,
}

impl TaskPatch {
    /// A patch that only sets status and position.
    #[must_use]
    pub const fn placement(status: StatusKey, position: u32) -> Self {
        Self {
            title: None,
            description: None,
            priority: None,
            status: Some(status),
            position: Some(position),
            assignee: None,
            due_date: None,
            tags: None,
        }
    }

    /// Whether the patch touches status or position.
    #[must_use]
    pub const fn touches_placement(&self) -> bool {
        self.status.is_some() || self.position.is_some()
    }

    /// Whether the patch carries no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
