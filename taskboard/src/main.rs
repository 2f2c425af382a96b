//! Command-line client for the Kanban task board.
//!
//! Runs one board command against a `taskboard-gateway` server, or against
//! an in-process demo board when no gateway is configured. Configuration via
//! CLI flags, environment variables, or config file
//! (`~/.config/taskboard/config.toml`).
//!
//! ```bash
//! # Offline demo mode
//! cargo run --bin taskboard -- list
//!
//! # Against a gateway
//! cargo run --bin taskboard -- --gateway-url ws://127.0.0.1:9100/ws \
//!     move 0190f3a2-... in_progress 0
//!
//! # Follow changes made by other clients
//! TASKBOARD_GATEWAY=ws://127.0.0.1:9100/ws cargo run --bin taskboard -- watch
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;

use chrono::NaiveDate;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

use taskboard::board::{
    BoardError, BoardEvent, Column, DropTarget, EventPhase, ReorderExecutor,
};
use taskboard::config::{CliArgs, ClientConfig, Command};
use taskboard::gateway::loopback::LoopbackBoard;
use taskboard::gateway::remote::RemoteGateway;
use taskboard::gateway::{GatewayError, SyncGateway};
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{
    NewTask, ParsePriorityError, Priority, Task, TaskId, TaskPatch, UserId,
};

/// Errors reported by the CLI.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Board(#[from] BoardError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Priority(#[from] ParsePriorityError),

    #[error("{reference}: {reason}")]
    TaskRef { reference: String, reason: &'static str },

    #[error("invalid due date {0} (expected YYYY-MM-DD)")]
    DueDate(String),

    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The command was applied locally but the gateway did not accept it.
    #[error("not saved: {0}")]
    NotSaved(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(client_id = %config.client_id, "taskboard starting");

    let command = cli.command.clone().unwrap_or_default();
    let result = match config.gateway_url.clone() {
        Some(url) => run_remote(&url, &config, command, cli.json).await,
        None => {
            tracing::info!("no gateway configured, using offline demo board");
            let board = demo_board(&config.statuses);
            let gateway = board.connect(config.client_id.clone());
            let exec = ReorderExecutor::new(gateway, config.engine_config());
            run(&exec, command, cli.json).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging to stderr, or to a file when `file_path` is given.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> WorkerGuard {
    let (writer, guard) = match file_path.and_then(|p| Some((p.parent()?, p.file_name()?))) {
        Some((dir, name)) => {
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    guard
}

async fn run_remote(
    url: &str,
    config: &ClientConfig,
    command: Command,
    json: bool,
) -> Result<(), CliError> {
    let gateway = RemoteGateway::connect(url, &config.client_id, config.remote_options()).await?;

    let mut engine = config.engine_config();
    if gateway.columns() != &engine.statuses {
        tracing::warn!(
            configured = ?engine.statuses.columns(),
            gateway = ?gateway.columns().columns(),
            "gateway columns differ from configuration, using the gateway's"
        );
        engine.statuses = gateway.columns().clone();
    }

    let exec = ReorderExecutor::new(gateway, engine);
    run(&exec, command, json).await
}

/// Offline board seeded with a few sample tasks.
fn demo_board(statuses: &StatusSet) -> std::sync::Arc<LoopbackBoard> {
    let board = LoopbackBoard::new(statuses.clone());
    let samples: [&[&str]; 3] = [
        &["Sketch the board layout", "Write the move planner", "Wire up the gateway"],
        &["Reconcile failed moves"],
        &["Set up the workspace"],
    ];
    for (status, titles) in statuses.columns().iter().zip(samples) {
        board.seed_titles(status, titles);
    }
    board
}

async fn run<G: SyncGateway>(
    exec: &ReorderExecutor<G>,
    command: Command,
    json: bool,
) -> Result<(), CliError> {
    exec.refresh_all().await?;
    let mut events = exec.subscribe();

    match command {
        Command::List { status } => {
            let columns = match status {
                Some(status) => {
                    let status = StatusKey::new(status);
                    let tasks = exec.list_column(&status)?;
                    vec![Column { status, tasks }]
                }
                None => exec.columns(),
            };
            print_columns(&columns, json)?;
        }
        Command::Create {
            title,
            status,
            priority,
            assignee,
            due,
            tags,
            description,
        } => {
            let fields = NewTask {
                title,
                description,
                priority: priority
                    .as_deref()
                    .map(Priority::from_str)
                    .transpose()?
                    .unwrap_or_default(),
                status: status.map(StatusKey::new),
                assignee: assignee.map(UserId::new),
                due_date: due.as_deref().map(parse_due).transpose()?,
                tags: tags.into_iter().collect(),
            };
            let id = exec.create(fields)?;
            exec.settled().await;
            check_saved(&mut events)?;
            print_task(&exec.get(&id)?, json)?;
        }
        Command::Move {
            task,
            status,
            index,
            before,
            after,
        } => {
            let id = resolve_task(exec, &task)?;
            let target = match (before, after, index) {
                (Some(before), _, _) => DropTarget::Before(resolve_task(exec, &before)?),
                (None, Some(after), _) => DropTarget::After(resolve_task(exec, &after)?),
                (None, None, Some(index)) => DropTarget::Index(index),
                (None, None, None) => DropTarget::End,
            };
            let from = exec.get(&id)?.status;
            let to = StatusKey::new(status);
            exec.move_task_to(&id, &to, target)?;
            exec.settled().await;
            check_saved(&mut events)?;
            print_statuses(exec, &[from, to], json)?;
        }
        Command::Delete { task } => {
            let id = resolve_task(exec, &task)?;
            let status = exec.get(&id)?.status;
            exec.delete(&id)?;
            exec.settled().await;
            check_saved(&mut events)?;
            print_statuses(exec, &[status], json)?;
        }
        Command::Edit {
            task,
            title,
            priority,
            assignee,
            unassign,
            due,
            no_due,
            description,
            tags,
        } => {
            let id = resolve_task(exec, &task)?;
            let patch = TaskPatch {
                title,
                description: description.map(Some),
                priority: priority.as_deref().map(Priority::from_str).transpose()?,
                assignee: if unassign {
                    Some(None)
                } else {
                    assignee.map(|a| Some(UserId::new(a)))
                },
                due_date: if no_due {
                    Some(None)
                } else {
                    due.as_deref().map(parse_due).transpose()?.map(Some)
                },
                tags: (!tags.is_empty()).then(|| tags.into_iter().collect()),
                ..TaskPatch::default()
            };
            exec.edit_fields(&id, patch)?;
            exec.settled().await;
            check_saved(&mut events)?;
            print_task(&exec.get(&id)?, json)?;
        }
        Command::Watch => {
            let _listener = exec.spawn_remote_listener();
            print_columns(&exec.columns(), json)?;
            loop {
                match events.recv().await {
                    Ok(event) => print_event(&event, json)?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "board events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}

/// Finds a task by full id or by a unique trailing fragment of its id.
fn resolve_task<G: SyncGateway>(
    exec: &ReorderExecutor<G>,
    reference: &str,
) -> Result<TaskId, CliError> {
    if let Ok(id) = TaskId::from_str(reference) {
        return Ok(id);
    }
    let needle = reference.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return Err(CliError::TaskRef {
            reference: reference.to_string(),
            reason: "empty task reference",
        });
    }
    let matches: Vec<TaskId> = exec
        .columns()
        .into_iter()
        .flat_map(|c| c.tasks)
        .map(|t| t.id)
        .filter(|id| id.to_string().ends_with(&needle))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(CliError::TaskRef {
            reference: reference.to_string(),
            reason: "no such task",
        }),
        _ => Err(CliError::TaskRef {
            reference: reference.to_string(),
            reason: "ambiguous task reference",
        }),
    }
}

fn parse_due(raw: &str) -> Result<NaiveDate, CliError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| CliError::DueDate(raw.to_string()))
}

/// Fails if any event published so far carries a warning.
fn check_saved(events: &mut broadcast::Receiver<BoardEvent>) -> Result<(), CliError> {
    while let Ok(event) = events.try_recv() {
        if let Some(warning) = event.warning {
            return Err(CliError::NotSaved(warning.message));
        }
    }
    Ok(())
}

fn print_statuses<G: SyncGateway>(
    exec: &ReorderExecutor<G>,
    statuses: &[StatusKey],
    json: bool,
) -> Result<(), CliError> {
    let mut columns = Vec::new();
    for status in statuses {
        if columns.iter().any(|c: &Column| c.status == *status) {
            continue;
        }
        columns.push(Column {
            status: status.clone(),
            tasks: exec.list_column(status)?,
        });
    }
    print_columns(&columns, json)
}

fn print_columns(columns: &[Column], json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(columns)?);
        return Ok(());
    }
    for column in columns {
        println!("{} ({})", column.status, column.tasks.len());
        for task in &column.tasks {
            println!("  {}", task_line(task));
        }
    }
    Ok(())
}

fn print_task(task: &Task, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(task)?);
    } else {
        println!("{}  {}", task.status, task_line(task));
    }
    Ok(())
}

fn print_event(event: &BoardEvent, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let phase = match event.phase {
        EventPhase::Applied => "applied",
        EventPhase::Settled => "settled",
        EventPhase::Refreshed => "refreshed",
    };
    for column in &event.columns {
        let titles = column.titles().join(", ");
        println!("[{phase}] {}: {titles}", column.status);
    }
    if let Some(warning) = &event.warning {
        println!("[warning] {:?}: {}", warning.kind, warning.message);
    }
    Ok(())
}

fn task_line(task: &Task) -> String {
    let mut line = format!("{:>2}  [{}] {}  {}", task.position, task.priority, task.title, task.id);
    if let Some(assignee) = &task.assignee {
        line.push_str(&format!("  @{assignee}"));
    }
    if let Some(due) = task.due_date {
        line.push_str(&format!("  due {due}"));
    }
    line
}
