//! Gateway server core: shared state, WebSocket handler, client registry and
//! request dispatch.
//!
//! Each connection identifies itself with `Hello`, then sends requests that
//! are answered in arrival order. Every accepted write is followed by a
//! `Changed` notification, per touched column, to all other connected
//! clients.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use taskboard_proto::gateway::{
    self, ClientFrame, GatewayFault, GatewayRequest, RemoteChange, ServerFrame,
};
use taskboard_proto::status::StatusKey;
use tokio::sync::{RwLock, mpsc};

use crate::store::BoardStore;

/// Default maximum accepted request frame size in bytes (256 KB).
const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Shared gateway state holding the client registry and the board.
pub struct GatewayState {
    /// Maps client id to a channel sender feeding that client's socket writer.
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    /// Authoritative task store.
    pub store: BoardStore,
    /// Maximum accepted request frame size in bytes.
    max_frame_size: usize,
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new(BoardStore::default())
    }
}

impl GatewayState {
    /// Creates gateway state around `store` with the default frame limit.
    #[must_use]
    pub fn new(store: BoardStore) -> Self {
        Self::with_config(DEFAULT_MAX_FRAME_SIZE, store)
    }

    /// Creates gateway state with a custom frame size limit.
    #[must_use]
    pub fn with_config(max_frame_size: usize, store: BoardStore) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            store,
            max_frame_size,
        }
    }

    /// Registers a client, storing the sender half of its outbound channel.
    ///
    /// A client reconnecting under the same id replaces its old connection,
    /// which stops receiving change notifications.
    pub async fn register(
        &self,
        client_id: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections.write().await.insert(client_id.to_string(), sender)
    }

    /// Removes a client, but only if `sender` is still its live connection.
    pub async fn unregister(
        &self,
        client_id: &str,
        sender: &mpsc::UnboundedSender<Message>,
    ) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(client_id).is_some_and(|s| s.same_channel(sender)) {
            conns.remove(client_id);
            true
        } else {
            false
        }
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a WebSocket Close frame to every connected client.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (client_id, sender) in conns.iter() {
            tracing::info!(client_id = %client_id, "sending close frame to client");
            let _ = sender.send(Message::Close(None));
        }
    }

    /// Notifies every client except `origin` that `statuses` changed.
    async fn notify_others(&self, origin: &str, mut statuses: Vec<StatusKey>) {
        statuses.sort();
        statuses.dedup();
        let conns = self.connections.read().await;
        for status in statuses {
            let frame = ServerFrame::Changed(RemoteChange {
                status,
                origin: origin.to_string(),
            });
            let bytes = match gateway::encode_server(&frame) {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode change notification");
                    continue;
                }
            };
            for (client_id, sender) in conns.iter().filter(|(id, _)| id.as_str() != origin) {
                if sender.send(Message::Binary(bytes.clone().into())).is_err() {
                    tracing::debug!(client_id = %client_id, "notification dropped, writer closed");
                }
            }
        }
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Wait for `Hello`.
/// 2. Register the client and reply with `Welcome`.
/// 3. Answer requests until the socket closes.
/// 4. Unregister the client.
pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(client_id) = wait_for_hello(&mut ws_receiver).await else {
        tracing::warn!("connection closed before hello");
        return;
    };

    // Register before the Welcome goes out; notifications queue in the
    // channel until the writer task starts, so Welcome is always first.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if state.register(&client_id, tx.clone()).await.is_some() {
        tracing::info!(client_id = %client_id, "replaced existing connection");
    }

    let welcome = ServerFrame::Welcome {
        client_id: client_id.clone(),
        columns: state.store.columns().clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &welcome).await {
        tracing::error!(client_id = %client_id, error = %e, "failed to send welcome");
        state.unregister(&client_id, &tx).await;
        return;
    }
    tracing::info!(client_id = %client_id, "client connected");

    let writer_client_id = client_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(client_id = %writer_client_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_client_id = client_id.clone();
    let reader_state = Arc::clone(&state);
    let reply_tx = tx.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(&reader_client_id, &data, &reader_state, &reply_tx).await;
                }
                Message::Close(_) => {
                    tracing::info!(client_id = %reader_client_id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(&client_id, &tx).await;
    tracing::info!(client_id = %client_id, "client disconnected");
}

/// Waits for the first binary frame, expecting `Hello`.
///
/// Returns the client id, or `None` if the connection closes or anything
/// other than a well-formed `Hello` arrives.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match gateway::decode_client(&data) {
                    Ok(ClientFrame {
                        request: GatewayRequest::Hello { client_id },
                        ..
                    }) if !client_id.trim().is_empty() => Some(client_id),
                    Ok(other) => {
                        tracing::warn!(frame = ?other, "expected Hello");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode hello");
                        None
                    }
                };
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Decodes, executes and answers one request from a connected client.
async fn handle_binary_message(
    client_id: &str,
    data: &[u8],
    state: &Arc<GatewayState>,
    reply_tx: &mpsc::UnboundedSender<Message>,
) {
    if data.len() > state.max_frame_size {
        tracing::warn!(
            client_id = %client_id,
            size = data.len(),
            max = state.max_frame_size,
            "request exceeds size limit"
        );
        let fault = GatewayFault::Malformed(format!(
            "frame too large: {} bytes (max {})",
            data.len(),
            state.max_frame_size
        ));
        reply(reply_tx, &ServerFrame::Fault { request_id: 0, fault });
        return;
    }

    let frame = match gateway::decode_client(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "failed to decode request");
            let fault = GatewayFault::Malformed(e.to_string());
            reply(reply_tx, &ServerFrame::Fault { request_id: 0, fault });
            return;
        }
    };

    let request_id = frame.request_id;
    match execute(state, request_id, frame.request).await {
        Ok((answer, touched)) => {
            reply(reply_tx, &answer);
            if !touched.is_empty() {
                state.notify_others(client_id, touched).await;
            }
        }
        Err(fault) => {
            tracing::debug!(client_id = %client_id, request_id, fault = %fault, "request refused");
            reply(reply_tx, &ServerFrame::Fault { request_id, fault });
        }
    }
}

/// Runs a request against the store, returning the reply and the columns a
/// write touched.
async fn execute(
    state: &GatewayState,
    request_id: u64,
    request: GatewayRequest,
) -> Result<(ServerFrame, Vec<StatusKey>), GatewayFault> {
    let ack = ServerFrame::Ack { request_id };
    match request {
        GatewayRequest::Hello { .. } => Err(GatewayFault::Malformed("duplicate Hello".to_string())),
        GatewayRequest::FetchPartition { status } => {
            let tasks = state.store.fetch_partition(&status).await?;
            tracing::trace!(%status, count = tasks.len(), "partition fetched");
            let partition = ServerFrame::Partition {
                request_id,
                status,
                tasks,
            };
            Ok((partition, Vec::new()))
        }
        GatewayRequest::Persist { task_id, patch } => {
            let touched = state.store.persist(&task_id, &patch).await?;
            tracing::debug!(%task_id, ?touched, "task persisted");
            Ok((ack, touched))
        }
        GatewayRequest::Insert { task } => {
            let task_id = task.id;
            let touched = state.store.insert(task).await?;
            tracing::debug!(%task_id, ?touched, "task inserted");
            Ok((ack, touched))
        }
        GatewayRequest::Remove { task_id } => {
            let touched = state.store.remove(&task_id).await;
            tracing::debug!(%task_id, ?touched, "task removed");
            Ok((ack, touched))
        }
    }
}

/// Queues a frame on a connection's writer channel.
fn reply(reply_tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    match gateway::encode_server(frame) {
        Ok(bytes) => {
            let _ = reply_tx.send(Message::Binary(bytes.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode server frame"),
    }
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let bytes = gateway::encode_server(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the gateway on the given address with an empty standard board and
/// returns the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(GatewayState::default())).await
}

/// Starts the gateway with pre-built [`GatewayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<GatewayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "gateway server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<GatewayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
