//! Integration tests for board ordering.
//!
//! Drives the reorder executor against a loopback board and checks:
//! - Same-column and cross-column moves produce dense orderings
//! - Creates append, deletes close the gap
//! - Task identity survives moves and edits
//! - Local and authoritative state agree once operations settle

use std::collections::BTreeSet;
use std::sync::Arc;

use taskboard::board::{DropTarget, EngineConfig, EventPhase, ReorderExecutor};
use taskboard::gateway::loopback::{LoggedWrite, LoopbackBoard, LoopbackGateway};
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{NewTask, Priority, Task, TaskId, TaskPatch};

fn todo() -> StatusKey {
    StatusKey::new("todo")
}

fn in_progress() -> StatusKey {
    StatusKey::new("in_progress")
}

fn done() -> StatusKey {
    StatusKey::new("done")
}

/// Review board seeded column by column, hydrated into an engine.
async fn board_with(
    columns: &[(StatusKey, &[&str])],
) -> (Arc<LoopbackBoard>, ReorderExecutor<LoopbackGateway>, Vec<TaskId>) {
    let board = LoopbackBoard::new(StatusSet::review());
    let mut ids = Vec::new();
    for (status, titles) in columns {
        ids.extend(board.seed_titles(status, titles));
    }
    let config = EngineConfig {
        statuses: StatusSet::review(),
        ..EngineConfig::default()
    };
    let exec = ReorderExecutor::new(board.connect("alice"), config);
    exec.refresh_all().await.unwrap();
    (board, exec, ids)
}

fn titles(tasks: &[Task]) -> Vec<&str> {
    tasks.iter().map(|t| t.title.as_str()).collect()
}

fn positions(tasks: &[Task]) -> Vec<u32> {
    tasks.iter().map(|t| t.position).collect()
}

fn assert_dense(tasks: &[Task]) {
    let expected: Vec<u32> = (0..).take(tasks.len()).collect();
    assert_eq!(positions(tasks), expected, "column is not dense: {:?}", titles(tasks));
}

fn placements(tasks: &[Task]) -> Vec<(TaskId, String, StatusKey, u32)> {
    tasks
        .iter()
        .map(|t| (t.id, t.title.clone(), t.status.clone(), t.position))
        .collect()
}

/// Local columns hold the same tasks in the same places as the
/// authoritative columns.
fn assert_in_sync(board: &LoopbackBoard, exec: &ReorderExecutor<LoopbackGateway>) {
    for status in exec.statuses().columns() {
        let local = exec.list_column(status).unwrap();
        let remote = board.partition(status);
        assert_eq!(placements(&local), placements(&remote), "column {status} diverged");
        assert_dense(&local);
    }
}

#[tokio::test]
async fn same_column_reorder_moves_task_to_top() {
    let (board, exec, ids) =
        board_with(&[(todo(), &["A", "B", "T", "C"]), (in_progress(), &["X"])]).await;
    let before_other = exec.list_column(&in_progress()).unwrap();

    exec.move_task(&ids[2], &todo(), 0).unwrap();

    let column = exec.list_column(&todo()).unwrap();
    assert_eq!(titles(&column), ["T", "A", "B", "C"]);
    assert_dense(&column);
    assert_eq!(exec.list_column(&in_progress()).unwrap(), before_other);

    exec.settled().await;
    assert_in_sync(&board, &exec);
    assert_eq!(placements(&board.partition(&in_progress())), placements(&before_other));
}

#[tokio::test]
async fn cross_column_move_renumbers_both_columns() {
    let (board, exec, ids) = board_with(&[(todo(), &["A", "B", "T"]), (done(), &["X", "Y"])]).await;

    exec.move_task(&ids[2], &done(), 1).unwrap();

    let todo_col = exec.list_column(&todo()).unwrap();
    let done_col = exec.list_column(&done()).unwrap();
    assert_eq!(titles(&todo_col), ["A", "B"]);
    assert_eq!(titles(&done_col), ["X", "T", "Y"]);
    assert_dense(&done_col);
    assert_eq!(exec.get(&ids[2]).unwrap().status, done());

    exec.settled().await;
    assert_in_sync(&board, &exec);
}

#[tokio::test]
async fn move_only_writes_tasks_whose_placement_changed() {
    let (board, exec, ids) = board_with(&[(todo(), &["A", "B", "C", "D"])]).await;

    // B to index 2: only B and C change places.
    exec.move_task(&ids[1], &todo(), 2).unwrap();
    exec.settled().await;

    let written: BTreeSet<TaskId> = board
        .writes()
        .into_iter()
        .map(|w| match w {
            LoggedWrite::Persist { task_id, .. } => task_id,
            other => panic!("unexpected write {other:?}"),
        })
        .collect();
    assert_eq!(written, BTreeSet::from([ids[1], ids[2]]));
    assert_eq!(titles(&board.partition(&todo())), ["A", "C", "B", "D"]);
}

#[tokio::test]
async fn index_past_the_end_appends() {
    let (board, exec, ids) = board_with(&[(todo(), &["A", "B"]), (done(), &["X"])]).await;

    exec.move_task(&ids[0], &done(), 99).unwrap();
    assert_eq!(titles(&exec.list_column(&done()).unwrap()), ["X", "A"]);

    exec.settled().await;
    assert_in_sync(&board, &exec);
}

#[tokio::test]
async fn drop_targets_place_relative_to_anchor() {
    let (board, exec, ids) = board_with(&[(todo(), &["A", "B", "C"]), (done(), &["X", "Y"])]).await;

    exec.move_task_to(&ids[0], &done(), DropTarget::Before(ids[4])).unwrap();
    assert_eq!(titles(&exec.list_column(&done()).unwrap()), ["X", "A", "Y"]);

    exec.move_task_to(&ids[2], &todo(), DropTarget::After(ids[1])).unwrap();
    assert_eq!(titles(&exec.list_column(&todo()).unwrap()), ["B", "C"]);

    exec.move_task_to(&ids[1], &done(), DropTarget::End).unwrap();
    assert_eq!(titles(&exec.list_column(&done()).unwrap()), ["X", "A", "Y", "B"]);

    exec.settled().await;
    assert_in_sync(&board, &exec);
}

#[tokio::test]
async fn create_appends_after_existing_tasks() {
    let (board, exec, _) = board_with(&[(in_progress(), &["A", "B", "C"])]).await;

    let id = exec.create(NewTask::titled("D").in_status(in_progress())).unwrap();
    assert_eq!(exec.get(&id).unwrap().position, 3);
    assert_eq!(titles(&exec.list_column(&in_progress()).unwrap()), ["A", "B", "C", "D"]);

    exec.settled().await;
    assert_eq!(board.get(&id).unwrap().position, 3);
    assert_in_sync(&board, &exec);
}

#[tokio::test]
async fn delete_renumbers_remaining_tasks() {
    let (board, exec, ids) = board_with(&[(todo(), &["A", "B", "C"])]).await;

    exec.delete(&ids[1]).unwrap();
    let column = exec.list_column(&todo()).unwrap();
    assert_eq!(titles(&column), ["A", "C"]);
    assert_eq!(positions(&column), [0, 1]);

    exec.settled().await;
    assert!(board.get(&ids[1]).is_none());
    assert_in_sync(&board, &exec);
}

#[tokio::test]
async fn identity_survives_moves_and_edits() {
    let (board, exec, ids) = board_with(&[(todo(), &["A", "B"]), (done(), &["X"])]).await;
    let original = exec.get(&ids[0]).unwrap();

    exec.move_task(&ids[0], &done(), 0).unwrap();
    exec.edit_fields(
        &ids[0],
        TaskPatch {
            priority: Some(Priority::High),
            ..TaskPatch::default()
        },
    )
    .unwrap();
    exec.move_task(&ids[0], &in_progress(), 0).unwrap();
    exec.settled().await;

    let moved = exec.get(&ids[0]).unwrap();
    assert_eq!(moved.id, original.id);
    assert_eq!(moved.title, original.title);
    assert_eq!(moved.created_at, original.created_at);
    assert_eq!(moved.created_by, original.created_by);
    assert_eq!(moved.priority, Priority::High);
    assert_eq!(moved.status, in_progress());

    let all: BTreeSet<TaskId> = exec
        .columns()
        .into_iter()
        .flat_map(|c| c.tasks)
        .map(|t| t.id)
        .collect();
    assert_eq!(all, ids.iter().copied().collect());
    assert_in_sync(&board, &exec);
}

#[tokio::test]
async fn applied_event_precedes_settled_event() {
    let (board, exec, ids) = board_with(&[(todo(), &["A", "B"])]).await;
    let mut events = exec.subscribe();
    board.pause();

    exec.move_task(&ids[1], &todo(), 0).unwrap();
    let applied = events.recv().await.unwrap();
    assert_eq!(applied.phase, EventPhase::Applied);
    assert_eq!(applied.columns.len(), 1);
    assert_eq!(applied.columns[0].titles(), ["B", "A"]);
    assert!(applied.warning.is_none());

    board.resume();
    let settled = events.recv().await.unwrap();
    assert_eq!(settled.phase, EventPhase::Settled);
    assert!(settled.warning.is_none());
}

#[tokio::test]
async fn repeated_moves_of_one_task_persist_in_order() {
    let (board, exec, ids) = board_with(&[(todo(), &["A", "B", "C"])]).await;
    board.pause();

    exec.move_task(&ids[0], &done(), 0).unwrap();
    exec.move_task(&ids[0], &in_progress(), 0).unwrap();
    exec.move_task(&ids[0], &todo(), 1).unwrap();
    assert_eq!(titles(&exec.list_column(&todo()).unwrap()), ["B", "A", "C"]);

    board.resume();
    exec.settled().await;
    assert_eq!(titles(&board.partition(&todo())), ["B", "A", "C"]);
    assert_in_sync(&board, &exec);
}
