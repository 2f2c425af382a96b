//! Board columns.
//!
//! The set of status columns is configuration: a [`StatusSet`] lists the
//! columns in board order and names the column new tasks land in. The
//! engine allows every pairwise transition between configured columns.

use serde::{Deserialize, Serialize};

/// Name of a status column, normalised to `lower_snake_case`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusKey(String);

impl StatusKey {
    /// Creates a status key, normalising case and separators.
    ///
    /// `In Progress`, `in-progress` and `in_progress` all name the same column.
    pub fn new(name: impl AsRef<str>) -> Self {
        let normalised = name
            .as_ref()
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_lowercase(),
            })
            .collect();
        Self(normalised)
    }

    /// Returns the normalised name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StatusKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StatusKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Errors raised when building a [`StatusSet`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusSetError {
    /// No columns were given.
    #[error("a board needs at least one status column")]
    Empty,
    /// A column name is blank.
    #[error("status column names cannot be blank")]
    BlankName,
    /// The same column appears twice.
    #[error("duplicate status column: {0}")]
    Duplicate(StatusKey),
    /// The default column is not one of the columns.
    #[error("default column {0} is not a configured column")]
    UnknownDefault(StatusKey),
    /// Unknown preset name.
    #[error("unknown board preset: {0} (expected standard or review)")]
    UnknownPreset(String),
}

/// Ordered set of columns for one board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSet {
    columns: Vec<StatusKey>,
    default: StatusKey,
}

impl StatusSet {
    /// Builds a column set. The default column is the first column unless
    /// `default` names another one.
    ///
    /// # Errors
    ///
    /// Returns a [`StatusSetError`] if the list is empty, contains blank or
    /// duplicate names, or the default is not among the columns.
    pub fn new(
        columns: Vec<StatusKey>,
        default: Option<StatusKey>,
    ) -> Result<Self, StatusSetError> {
        let Some(first) = columns.first().cloned() else {
            return Err(StatusSetError::Empty);
        };
        for (i, column) in columns.iter().enumerate() {
            if column.as_str().is_empty() {
                return Err(StatusSetError::BlankName);
            }
            if columns[..i].contains(column) {
                return Err(StatusSetError::Duplicate(column.clone()));
            }
        }
        let default = default.unwrap_or(first);
        if !columns.contains(&default) {
            return Err(StatusSetError::UnknownDefault(default));
        }
        Ok(Self { columns, default })
    }

    /// `todo`, `in_progress`, `completed`.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            columns: vec![
                StatusKey::new("todo"),
                StatusKey::new("in_progress"),
                StatusKey::new("completed"),
            ],
            default: StatusKey::new("todo"),
        }
    }

    /// `todo`, `in_progress`, `review`, `done`.
    #[must_use]
    pub fn review() -> Self {
        Self {
            columns: vec![
                StatusKey::new("todo"),
                StatusKey::new("in_progress"),
                StatusKey::new("review"),
                StatusKey::new("done"),
            ],
            default: StatusKey::new("todo"),
        }
    }

    /// Looks up a named preset (`standard` or `review`).
    ///
    /// # Errors
    ///
    /// Returns [`StatusSetError::UnknownPreset`] for any other name.
    pub fn preset(name: &str) -> Result<Self, StatusSetError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::standard()),
            "review" => Ok(Self::review()),
            _ => Err(StatusSetError::UnknownPreset(name.to_string())),
        }
    }

    /// Columns in board order.
    #[must_use]
    pub fn columns(&self) -> &[StatusKey] {
        &self.columns
    }

    /// Column that new tasks land in.
    #[must_use]
    pub const fn default_status(&self) -> &StatusKey {
        &self.default
    }

    /// Whether `status` is one of the columns.
    #[must_use]
    pub fn contains(&self, status: &StatusKey) -> bool {
        self.columns.contains(status)
    }
}

impl Default for StatusSet {
    fn default() -> Self {
        Self::standard()
    }
}
