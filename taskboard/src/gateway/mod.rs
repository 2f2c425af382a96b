//! Sync gateway abstraction.
//!
//! Defines the [`SyncGateway`] trait the board engine persists through and
//! refetches from. Concrete implementations:
//! - [`loopback::LoopbackGateway`]: in-process authoritative board for tests
//!   and offline use
//! - [`remote::RemoteGateway`]: WebSocket client for `taskboard-gateway`

pub mod loopback;
pub mod remote;

use tokio::sync::broadcast;

use taskboard_proto::gateway::{GatewayFault, RemoteChange};
use taskboard_proto::status::StatusKey;
use taskboard_proto::task::{Task, TaskId, TaskPatch};

/// Errors that can occur talking to the authoritative store.
///
/// Everything except [`GatewayError::Malformed`] is transient: the engine
/// reverts to authoritative state and carries on. A malformed response is
/// fatal for the columns involved, which are marked stale.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The connection to the gateway has been closed.
    #[error("gateway connection closed")]
    ConnectionClosed,

    /// The request did not complete in time.
    #[error("gateway request timed out")]
    Timeout,

    /// The gateway could not be reached.
    #[error("gateway {0} is unreachable")]
    Unreachable(String),

    /// The gateway refused the request.
    #[error("gateway rejected request: {0}")]
    Rejected(GatewayFault),

    /// The gateway answered with data that violates the protocol.
    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// Whether retrying or refetching cannot fix this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Async interface to the authoritative task store.
///
/// Every operation is idempotent: persisting the same patch twice leaves the
/// same state as persisting it once, inserting an existing id overwrites it,
/// and removing an absent task succeeds.
pub trait SyncGateway: Send + Sync + 'static {
    /// Authoritative contents of one column, sorted by position.
    fn fetch_partition(
        &self,
        status: &StatusKey,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, GatewayError>> + Send;

    /// Applies a partial update to one task.
    fn persist(
        &self,
        task_id: &TaskId,
        patch: &TaskPatch,
    ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send;

    /// Creates (or overwrites) a task.
    fn insert(
        &self,
        task: &Task,
    ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send;

    /// Deletes a task.
    fn remove(
        &self,
        task_id: &TaskId,
    ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send;

    /// Subscribes to change notifications caused by other clients.
    fn subscribe(&self) -> broadcast::Receiver<RemoteChange>;
}
