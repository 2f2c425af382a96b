//! Integration tests for the engine over the WebSocket gateway.
//!
//! Starts `taskboard-gateway` in-process and validates:
//! - Hydration, moves, creates, deletes and edits reach the server store
//! - Other clients are notified and reconcile
//! - Server refusals revert local state
//! - Losing the server surfaces as a transient failure

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskboard::board::{EngineConfig, ReorderExecutor, WarningKind};
use taskboard::gateway::remote::{RemoteGateway, RemoteOptions};
use taskboard::gateway::{GatewayError, SyncGateway};
use taskboard_gateway::server::{self, GatewayState};
use taskboard_gateway::store::BoardStore;
use taskboard_proto::gateway::GatewayFault;
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{NewTask, Task, TaskId, TaskPatch, UserId};

fn todo() -> StatusKey {
    StatusKey::new("todo")
}

fn done() -> StatusKey {
    StatusKey::new("done")
}

/// Start a review-column gateway in-process and return a ws:// URL.
async fn start_gateway() -> (String, Arc<GatewayState>, tokio::task::JoinHandle<()>) {
    let state = Arc::new(GatewayState::new(BoardStore::new(StatusSet::review())));
    let (addr, handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start gateway");
    (format!("ws://{addr}/ws"), state, handle)
}

async fn seed(state: &GatewayState, status: &StatusKey, titles: &[&str]) -> Vec<TaskId> {
    let start = state.store.fetch_partition(status).await.unwrap().len();
    let mut ids = Vec::new();
    for (i, title) in titles.iter().enumerate() {
        let task = Task::from_new(
            TaskId::new(),
            NewTask::titled(*title),
            status.clone(),
            u32::try_from(start + i).unwrap(),
            UserId::new("seed"),
            Utc::now(),
        );
        ids.push(task.id);
        state.store.insert(task).await.unwrap();
    }
    ids
}

async fn client(url: &str, client_id: &str) -> ReorderExecutor<RemoteGateway> {
    let gateway = RemoteGateway::connect(url, client_id, RemoteOptions::default())
        .await
        .unwrap();
    let config = EngineConfig {
        statuses: gateway.columns().clone(),
        actor: UserId::new(client_id),
        ..EngineConfig::default()
    };
    let exec = ReorderExecutor::new(gateway, config);
    exec.refresh_all().await.unwrap();
    exec
}

async fn server_titles(state: &GatewayState, status: &StatusKey) -> Vec<String> {
    state
        .store
        .fetch_partition(status)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.title)
        .collect()
}

fn local_titles(exec: &ReorderExecutor<RemoteGateway>, status: &StatusKey) -> Vec<String> {
    exec.list_column(status)
        .unwrap()
        .into_iter()
        .map(|t| t.title)
        .collect()
}

#[tokio::test]
async fn welcome_columns_and_hydration() {
    let (url, state, _handle) = start_gateway().await;
    seed(&state, &todo(), &["A", "B"]).await;

    let exec = client(&url, "alice").await;
    assert_eq!(exec.statuses(), &StatusSet::review());
    assert_eq!(local_titles(&exec, &todo()), ["A", "B"]);
    assert!(exec.gateway().is_connected());
}

#[tokio::test]
async fn move_create_delete_reach_server() {
    let (url, state, _handle) = start_gateway().await;
    let ids = seed(&state, &todo(), &["A", "B", "T"]).await;
    seed(&state, &done(), &["X", "Y"]).await;
    let exec = client(&url, "alice").await;

    exec.move_task(&ids[2], &done(), 1).unwrap();
    exec.settled().await;
    assert_eq!(server_titles(&state, &todo()).await, ["A", "B"]);
    assert_eq!(server_titles(&state, &done()).await, ["X", "T", "Y"]);

    let created = exec.create(NewTask::titled("C")).unwrap();
    exec.settled().await;
    let stored = state.store.get(&created).await.unwrap();
    assert_eq!(stored.position, 2);
    assert_eq!(stored.created_by, UserId::new("alice"));

    exec.delete(&ids[0]).unwrap();
    exec.settled().await;
    assert_eq!(server_titles(&state, &todo()).await, ["B", "C"]);
    let positions: Vec<u32> = state
        .store
        .fetch_partition(&todo())
        .await
        .unwrap()
        .iter()
        .map(|t| t.position)
        .collect();
    assert_eq!(positions, [0, 1]);
}

#[tokio::test]
async fn edit_reaches_server() {
    let (url, state, _handle) = start_gateway().await;
    let ids = seed(&state, &todo(), &["Draft"]).await;
    let exec = client(&url, "alice").await;

    let patch = TaskPatch {
        title: Some("Final".to_string()),
        tags: Some(["docs".to_string()].into_iter().collect()),
        ..TaskPatch::default()
    };
    exec.edit_fields(&ids[0], patch).unwrap();
    exec.settled().await;

    let stored = state.store.get(&ids[0]).await.unwrap();
    assert_eq!(stored.title, "Final");
    assert!(stored.tags.contains("docs"));
}

#[tokio::test]
async fn second_client_follows_changes() {
    let (url, state, _handle) = start_gateway().await;
    let ids = seed(&state, &todo(), &["A", "B", "C"]).await;
    let alice = client(&url, "alice").await;
    let bob = client(&url, "bob").await;
    let _listener = bob.spawn_remote_listener();

    alice.move_task(&ids[2], &todo(), 0).unwrap();
    alice.settled().await;

    for _ in 0..250 {
        if local_titles(&bob, &todo()) == ["C", "A", "B"] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(local_titles(&bob, &todo()), ["C", "A", "B"]);
}

#[tokio::test]
async fn refused_write_reverts_local_state() {
    let (url, state, _handle) = start_gateway().await;
    let ids = seed(&state, &todo(), &["A", "B"]).await;
    let exec = client(&url, "alice").await;
    let mut events = exec.subscribe();

    // The task vanishes on the server behind the client's back.
    state.store.remove(&ids[0]).await;
    exec.move_task(&ids[0], &done(), 0).unwrap();
    exec.settled().await;

    assert!(exec.get(&ids[0]).is_err());
    assert_eq!(local_titles(&exec, &todo()), ["B"]);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.extend(event.warning.map(|w| w.kind));
    }
    assert!(kinds.contains(&WarningKind::PersistFailed));
}

#[tokio::test]
async fn gateway_reports_faults_as_rejections() {
    let (url, _state, _handle) = start_gateway().await;
    let gateway = RemoteGateway::connect(&url, "alice", RemoteOptions::default())
        .await
        .unwrap();

    let missing = TaskId::new();
    let err = gateway
        .persist(&missing, &TaskPatch::placement(todo(), 0))
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Rejected(GatewayFault::TaskNotFound(missing)));

    let err = gateway
        .fetch_partition(&StatusKey::new("archived"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::Rejected(GatewayFault::UnknownStatus(StatusKey::new("archived")))
    );

    // Removing an absent task is not an error.
    gateway.remove(&missing).await.unwrap();
}

#[tokio::test]
async fn closed_connection_fails_requests() {
    let (url, state, _handle) = start_gateway().await;
    let gateway = RemoteGateway::connect(&url, "alice", RemoteOptions::default())
        .await
        .unwrap();

    state.close_all_connections().await;
    for _ in 0..250 {
        if !gateway.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!gateway.is_connected());

    let err = gateway.fetch_partition(&todo()).await.unwrap_err();
    assert_eq!(err, GatewayError::ConnectionClosed);
}
