//! Task board ordering engine.
//!
//! Keeps tasks partitioned into status columns and densely ordered within
//! each column. The pieces, leaves first:
//!
//! - [`store::TaskStore`] owns the canonical in-memory tasks.
//! - [`partition`] derives ordered per-column views.
//! - [`planner`] computes the position reassignments for a move (pure).
//! - [`executor::ReorderExecutor`] applies plans optimistically, persists
//!   them through a [`SyncGateway`](crate::gateway::SyncGateway) and
//!   reconciles with the authoritative state when persistence fails or
//!   another client changes a column.

pub mod executor;
pub mod partition;
pub mod planner;
pub mod store;

pub use executor::{
    BoardEvent, BoardWarning, EngineConfig, EventPhase, ReorderExecutor, WarningKind,
};
pub use partition::Column;
pub use planner::{Assignment, DropTarget, MovePlan};
pub use store::{StoreChange, TaskStore};

use taskboard_proto::status::StatusKey;
use taskboard_proto::task::{TaskId, TitleError};
use thiserror::Error;

use crate::gateway::GatewayError;

/// Errors returned synchronously by board operations.
///
/// Everything except [`BoardError::Gateway`] is a precondition violation:
/// the request is rejected before any state changes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoardError {
    /// Task title cannot be empty.
    #[error("task title cannot be empty")]
    TitleEmpty,
    /// Task title exceeds the maximum length.
    #[error("task title too long (max 256 characters)")]
    TitleTooLong,
    /// Task with the given ID was not found.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// Status is not one of the board's columns.
    #[error("unknown status: {0}")]
    UnknownStatus(StatusKey),
    /// Field edits cannot change status or position; use a move.
    #[error("field edits cannot change status or position")]
    PlacementInEdit,
    /// A manual refresh could not reach the gateway.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl From<TitleError> for BoardError {
    fn from(err: TitleError) -> Self {
        match err {
            TitleError::Empty => Self::TitleEmpty,
            TitleError::TooLong => Self::TitleTooLong,
        }
    }
}
