//! Gateway wire protocol.
//!
//! Clients talk to the authoritative gateway over WebSocket binary frames.
//! Every client frame carries a `request_id` that the server echoes in its
//! reply, so requests may be in flight concurrently. Change notifications
//! ([`ServerFrame::Changed`]) are unsolicited.
//!
//! ```text
//! client                         gateway
//!   ── Hello { client_id } ──────────▶
//!   ◀─────────── Welcome { columns } ──
//!   ── FetchPartition / Persist ─────▶
//!   ◀───────── Partition / Ack / Fault ─
//!   ◀──────────────── Changed(status) ─  (mutations by other clients)
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::status::{StatusKey, StatusSet};
use crate::task::{Task, TaskId, TaskPatch};

/// Notification that another actor changed a task in a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Column whose contents changed.
    pub status: StatusKey,
    /// Client that made the change.
    pub origin: String,
}

/// Requests a client sends to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayRequest {
    /// Identifies the client. Must be the first frame on a connection.
    Hello {
        /// Identity used as the origin of this client's changes.
        client_id: String,
    },
    /// Authoritative ordered contents of one column.
    FetchPartition {
        /// Column to fetch.
        status: StatusKey,
    },
    /// Idempotent partial update of one task.
    Persist {
        /// Task to update.
        task_id: TaskId,
        /// Fields to set.
        patch: TaskPatch,
    },
    /// Create or overwrite a task.
    Insert {
        /// Full task record.
        task: Task,
    },
    /// Delete a task. Deleting an absent task succeeds.
    Remove {
        /// Task to delete.
        task_id: TaskId,
    },
}

/// A request tagged with its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Echoed in the reply.
    pub request_id: u64,
    /// The request.
    pub request: GatewayRequest,
}

/// Reasons the gateway refuses a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum GatewayFault {
    /// The task does not exist on the gateway.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// The status is not a configured column.
    #[error("unknown status: {0}")]
    UnknownStatus(StatusKey),
    /// The task record is invalid (e.g. empty title).
    #[error("invalid task: {0}")]
    InvalidTask(String),
    /// The request frame could not be decoded or was out of sequence.
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Frames the gateway sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Reply to `Hello`.
    Welcome {
        /// Echo of the client identity.
        client_id: String,
        /// Columns configured on the gateway.
        columns: StatusSet,
    },
    /// Reply to `FetchPartition`, tasks sorted by position.
    Partition {
        /// Correlation id.
        request_id: u64,
        /// Column fetched.
        status: StatusKey,
        /// Column contents.
        tasks: Vec<Task>,
    },
    /// Successful reply to `Persist`, `Insert` or `Remove`.
    Ack {
        /// Correlation id.
        request_id: u64,
    },
    /// Refusal of a request.
    Fault {
        /// Correlation id (0 when the request could not be decoded).
        request_id: u64,
        /// What went wrong.
        fault: GatewayFault,
    },
    /// Unsolicited change notification.
    Changed(RemoteChange),
}

impl ServerFrame {
    /// Correlation id of a reply, `None` for unsolicited frames.
    #[must_use]
    pub const fn request_id(&self) -> Option<u64> {
        match self {
            Self::Partition { request_id, .. }
            | Self::Ack { request_id }
            | Self::Fault { request_id, .. } => Some(*request_id),
            Self::Welcome { .. } | Self::Changed(_) => None,
        }
    }
}

/// Encodes a [`ClientFrame`].
///
/// # Errors
///
/// Returns [`CodecError`] if serialization fails.
pub fn encode_client(frame: &ClientFrame) -> Result<Vec<u8>, CodecError> {
    codec::encode(frame)
}

/// Decodes a [`ClientFrame`].
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are not a client frame.
pub fn decode_client(bytes: &[u8]) -> Result<ClientFrame, CodecError> {
    codec::decode(bytes)
}

/// Encodes a [`ServerFrame`].
///
/// # Errors
///
/// Returns [`CodecError`] if serialization fails.
pub fn encode_server(frame: &ServerFrame) -> Result<Vec<u8>, CodecError> {
    codec::encode(frame)
}

/// Decodes a [`ServerFrame`].
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are not a server frame.
pub fn decode_server(bytes: &[u8]) -> Result<ServerFrame, CodecError> {
    codec::decode(bytes)
}
