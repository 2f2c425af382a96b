//! WebSocket client for `taskboard-gateway`.
//!
//! Implements [`SyncGateway`] over a single WebSocket connection. Requests
//! carry a `request_id`; a background reader task routes each reply to the
//! waiting caller and forwards unsolicited change notifications to
//! subscribers, so any number of requests may be in flight at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use taskboard_proto::gateway::{
    self, ClientFrame, GatewayFault, GatewayRequest, RemoteChange, ServerFrame,
};
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{Task, TaskId, TaskPatch};

use super::{GatewayError, SyncGateway};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Replies awaited by callers, keyed by request id.
type Pending = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>>;

/// Connection settings for [`RemoteGateway::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteOptions {
    /// Limit on establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Limit on each request's round trip, including the handshake.
    pub request_timeout: Duration,
    /// Change notifications buffered per subscriber.
    pub change_buffer: usize,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            change_buffer: 256,
        }
    }
}

/// [`SyncGateway`] backed by a `taskboard-gateway` server.
///
/// Created via [`RemoteGateway::connect`], which establishes the WebSocket
/// connection, performs the `Hello`/`Welcome` handshake, and spawns a
/// background reader task.
pub struct RemoteGateway {
    /// Identity announced in `Hello`.
    client_id: String,
    /// The gateway URL (ws:// or wss://).
    url: String,
    /// Columns configured on the gateway.
    columns: StatusSet,
    /// Write half of the WebSocket connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    pending: Pending,
    next_request: AtomicU64,
    changes: broadcast::Sender<RemoteChange>,
    /// Whether the WebSocket connection is active.
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
    /// Handle to the background reader task (kept alive for the gateway's lifetime).
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl RemoteGateway {
    /// Connects to a gateway and identifies as `client_id`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Timeout`] if the connection or handshake times out.
    /// - [`GatewayError::Unreachable`] if the URL cannot be connected.
    /// - [`GatewayError::Rejected`] if the gateway refuses the handshake.
    /// - [`GatewayError::Malformed`] if the handshake reply is not understood.
    pub async fn connect(
        url: &str,
        client_id: &str,
        options: RemoteOptions,
    ) -> Result<Self, GatewayError> {
        let (ws_stream, _response) =
            tokio::time::timeout(options.connect_timeout, connect_async(url))
                .await
                .map_err(|_| {
                    tracing::warn!(url, "gateway WebSocket connect timed out");
                    GatewayError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url, err = %e, "gateway WebSocket connect failed");
                    GatewayError::Unreachable(format!("{url}: {e}"))
                })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = ClientFrame {
            request_id: 0,
            request: GatewayRequest::Hello {
                client_id: client_id.to_string(),
            },
        };
        let bytes =
            gateway::encode_client(&hello).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        ws_sender.send(Message::Binary(bytes.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "failed to send Hello");
            GatewayError::ConnectionClosed
        })?;

        let reply = tokio::time::timeout(options.request_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url, "gateway handshake timed out");
                GatewayError::Timeout
            })?;

        let columns = match reply {
            Some(Ok(Message::Binary(data))) => match gateway::decode_server(&data) {
                Ok(ServerFrame::Welcome { columns, .. }) => {
                    tracing::info!(
                        client_id,
                        url,
                        columns = columns.columns().len(),
                        "connected to gateway"
                    );
                    columns
                }
                Ok(ServerFrame::Fault { fault, .. }) => {
                    tracing::warn!(%fault, "gateway refused handshake");
                    return Err(GatewayError::Rejected(fault));
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected gateway frame during handshake");
                    return Err(GatewayError::Malformed(
                        "unexpected frame during handshake".to_string(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed gateway handshake reply");
                    return Err(GatewayError::Malformed(e.to_string()));
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                tracing::warn!("gateway closed connection during handshake");
                return Err(GatewayError::ConnectionClosed);
            }
            Some(Ok(_)) => {
                return Err(GatewayError::Malformed(
                    "non-binary frame during handshake".to_string(),
                ));
            }
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket error during handshake");
                return Err(GatewayError::ConnectionClosed);
            }
        };

        let pending: Pending = Arc::default();
        let (changes, _) = broadcast::channel(options.change_buffer.max(1));
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&pending),
            changes.clone(),
            Arc::clone(&connected),
        ));

        Ok(Self {
            client_id: client_id.to_string(),
            url: url.to_string(),
            columns,
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            pending,
            next_request: AtomicU64::new(1),
            changes,
            connected,
            request_timeout: options.request_timeout,
            _reader_handle: reader_handle,
        })
    }

    /// Columns the gateway announced in `Welcome`.
    #[must_use]
    pub const fn columns(&self) -> &StatusSet {
        &self.columns
    }

    /// The gateway URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Identity announced to the gateway.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn request(&self, request: GatewayRequest) -> Result<ServerFrame, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::ConnectionClosed);
        }

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let bytes = gateway::encode_client(&ClientFrame { request_id, request })
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let sent = {
            let mut sender = self.ws_sender.lock().await;
            sender.send(Message::Binary(bytes.into())).await
        };
        if let Err(e) = sent {
            tracing::warn!(err = %e, request_id, "gateway send failed");
            self.connected.store(false, Ordering::Relaxed);
            self.pending.lock().remove(&request_id);
            return Err(GatewayError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            // Reader exited and dropped the sender.
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(request_id, "gateway request timed out");
                self.pending.lock().remove(&request_id);
                Err(GatewayError::Timeout)
            }
        }
    }
}

/// Interprets a reply to a write request.
fn expect_ack(frame: ServerFrame) -> Result<(), GatewayError> {
    match frame {
        ServerFrame::Ack { .. } => Ok(()),
        ServerFrame::Fault { fault, .. } => Err(reject(fault)),
        other => Err(GatewayError::Malformed(format!("expected ack, got {other:?}"))),
    }
}

fn reject(fault: GatewayFault) -> GatewayError {
    tracing::debug!(%fault, "gateway refused request");
    GatewayError::Rejected(fault)
}

impl SyncGateway for RemoteGateway {
    async fn fetch_partition(&self, status: &StatusKey) -> Result<Vec<Task>, GatewayError> {
        let frame = self
            .request(GatewayRequest::FetchPartition {
                status: status.clone(),
            })
            .await?;
        match frame {
            ServerFrame::Partition {
                status: fetched, tasks, ..
            } if fetched == *status => Ok(tasks),
            ServerFrame::Partition { status: fetched, .. } => Err(GatewayError::Malformed(format!(
                "asked for partition {status}, got {fetched}"
            ))),
            ServerFrame::Fault { fault, .. } => Err(reject(fault)),
            other => Err(GatewayError::Malformed(format!(
                "expected partition, got {other:?}"
            ))),
        }
    }

    async fn persist(&self, task_id: &TaskId, patch: &TaskPatch) -> Result<(), GatewayError> {
        let frame = self
            .request(GatewayRequest::Persist {
                task_id: *task_id,
                patch: patch.clone(),
            })
            .await?;
        expect_ack(frame)
    }

    async fn insert(&self, task: &Task) -> Result<(), GatewayError> {
        let frame = self
            .request(GatewayRequest::Insert { task: task.clone() })
            .await?;
        expect_ack(frame)
    }

    async fn remove(&self, task_id: &TaskId) -> Result<(), GatewayError> {
        let frame = self
            .request(GatewayRequest::Remove { task_id: *task_id })
            .await?;
        expect_ack(frame)
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }
}

/// Background task that reads WebSocket frames and dispatches them.
///
/// Replies go to the caller waiting on their `request_id`; change
/// notifications go to subscribers. Malformed frames are logged and
/// skipped. On exit every waiting caller is released with
/// [`GatewayError::ConnectionClosed`].
async fn reader_loop(
    mut ws_reader: WsReader,
    pending: Pending,
    changes: broadcast::Sender<RemoteChange>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match gateway::decode_server(&data) {
                Ok(ServerFrame::Changed(change)) => {
                    tracing::debug!(status = %change.status, origin = %change.origin, "gateway change notification");
                    // No subscribers is fine.
                    let _ = changes.send(change);
                }
                Ok(frame) => match frame.request_id() {
                    Some(request_id) => {
                        let waiter = pending.lock().remove(&request_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => tracing::debug!(request_id, "reply for abandoned request"),
                        }
                    }
                    None => tracing::debug!(?frame, "unexpected gateway frame"),
                },
                Err(e) => {
                    tracing::warn!(err = %e, "malformed gateway frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("gateway WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "gateway WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    pending.lock().clear();
    tracing::info!("gateway reader task exiting");
}
