//! Property-based tests for board ordering.
//!
//! Uses proptest to drive random sequences of moves, creates and deletes
//! through the reorder executor against a loopback board and verify:
//! 1. Every column stays densely numbered, locally and on the board.
//! 2. Local state matches the board once operations settle.
//! 3. No task is lost or duplicated by moves.
//! 4. The above still hold when individual writes fail.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use taskboard::board::{EngineConfig, ReorderExecutor};
use taskboard::gateway::loopback::{LoopbackBoard, LoopbackGateway};
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{NewTask, Task, TaskId};

/// One step against the board. Indices are reduced modulo whatever exists
/// when the step runs.
#[derive(Debug, Clone)]
enum Step {
    Move {
        task: usize,
        status: usize,
        index: usize,
    },
    Create {
        status: usize,
    },
    Delete {
        task: usize,
    },
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (any::<usize>(), 0usize..4, 0usize..8)
            .prop_map(|(task, status, index)| Step::Move { task, status, index }),
        1 => (0usize..4).prop_map(|status| Step::Create { status }),
        1 => any::<usize>().prop_map(|task| Step::Delete { task }),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

async fn seeded(
    counts: &[usize],
) -> (Arc<LoopbackBoard>, ReorderExecutor<LoopbackGateway>, Vec<TaskId>) {
    let statuses = StatusSet::review();
    let board = LoopbackBoard::new(statuses.clone());
    let mut ids = Vec::new();
    for (status, count) in statuses.columns().iter().zip(counts) {
        let titles: Vec<String> = (0..*count).map(|i| format!("{status}-{i}")).collect();
        let titles: Vec<&str> = titles.iter().map(String::as_str).collect();
        ids.extend(board.seed_titles(status, &titles));
    }
    let config = EngineConfig {
        statuses,
        ..EngineConfig::default()
    };
    let exec = ReorderExecutor::new(board.connect("prop"), config);
    exec.refresh_all().await.expect("hydration failed");
    (board, exec, ids)
}

fn all_ids(exec: &ReorderExecutor<LoopbackGateway>) -> Vec<TaskId> {
    exec.columns()
        .into_iter()
        .flat_map(|c| c.tasks)
        .map(|t| t.id)
        .collect()
}

fn column_key(exec: &ReorderExecutor<LoopbackGateway>, index: usize) -> StatusKey {
    let columns = exec.statuses().columns();
    columns[index % columns.len()].clone()
}

/// Applies one step. Returns the created id, if any, and the deleted id, if
/// any.
fn apply(
    exec: &ReorderExecutor<LoopbackGateway>,
    step: &Step,
) -> (Option<TaskId>, Option<TaskId>) {
    let ids = all_ids(exec);
    match *step {
        Step::Move {
            task,
            status,
            index,
        } if !ids.is_empty() => {
            let id = ids[task % ids.len()];
            let status = column_key(exec, status);
            exec.move_task(&id, &status, index).expect("move rejected");
            (None, None)
        }
        Step::Create { status } => {
            let fields = NewTask::titled("created").in_status(column_key(exec, status));
            (Some(exec.create(fields).expect("create rejected")), None)
        }
        Step::Delete { task } if !ids.is_empty() => {
            let id = ids[task % ids.len()];
            exec.delete(&id).expect("delete rejected");
            (None, Some(id))
        }
        _ => (None, None),
    }
}

fn is_dense(tasks: &[Task]) -> bool {
    tasks.iter().zip(0u32..).all(|(t, i)| t.position == i)
}

fn placements(tasks: &[Task]) -> Vec<(TaskId, StatusKey, u32)> {
    tasks
        .iter()
        .map(|t| (t.id, t.status.clone(), t.position))
        .collect()
}

/// Checks density on both sides and that local state mirrors the board.
fn check_converged(
    board: &LoopbackBoard,
    exec: &ReorderExecutor<LoopbackGateway>,
) -> Result<(), TestCaseError> {
    for status in exec.statuses().columns() {
        let local = exec.list_column(status).expect("configured column");
        let remote = board.partition(status);
        prop_assert!(is_dense(&local), "local {} not dense", status);
        prop_assert!(is_dense(&remote), "board {} not dense", status);
        prop_assert_eq!(placements(&local), placements(&remote));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Steps issued back to back, without waiting for persistence, converge
    /// to dense columns that match the board and keep every task.
    #[test]
    fn interleaved_steps_converge(
        counts in prop::collection::vec(0usize..5, 4),
        steps in prop::collection::vec(arb_step(), 1..24),
    ) {
        runtime().block_on(async {
            let (board, exec, ids) = seeded(&counts).await;
            let mut expected: BTreeSet<TaskId> = ids.into_iter().collect();

            for step in &steps {
                let (created, deleted) = apply(&exec, step);
                expected.extend(created);
                if let Some(id) = deleted {
                    expected.remove(&id);
                }
                for status in exec.statuses().columns() {
                    let local = exec.list_column(status).expect("configured column");
                    prop_assert!(is_dense(&local), "local {} not dense after {:?}", status, step);
                }
            }
            exec.settled().await;

            check_converged(&board, &exec)?;
            let local: BTreeSet<TaskId> = all_ids(&exec).into_iter().collect();
            prop_assert_eq!(local, expected);
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Steps whose first write may fail still leave dense columns that match
    /// the board once each step settles.
    #[test]
    fn failed_writes_still_converge(
        counts in prop::collection::vec(0usize..5, 4),
        steps in prop::collection::vec((arb_step(), any::<bool>()), 1..16),
    ) {
        runtime().block_on(async {
            let (board, exec, _) = seeded(&counts).await;

            for (step, fail) in &steps {
                if *fail {
                    match step {
                        Step::Move { .. } => board.fail_next_persists(1),
                        Step::Create { .. } => board.fail_next_inserts(1),
                        Step::Delete { .. } => board.fail_next_removes(1),
                    }
                }
                apply(&exec, step);
                exec.settled().await;
                check_converged(&board, &exec)?;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
