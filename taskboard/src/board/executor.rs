//! Reorder executor.
//!
//! Applies planned moves and other mutations to the local store
//! optimistically, persists them through a [`SyncGateway`] in the
//! background, and reconciles with the authoritative state afterwards.
//!
//! # Ordering
//!
//! Every mutation becomes an operation with a monotonically increasing
//! sequence number. Operations touching the same task persist in issue
//! order: each one waits for the previous operation on any of its tasks to
//! finish (including that operation's reconciliation) before writing.
//! Operations on disjoint tasks persist concurrently.
//!
//! # Reconciliation
//!
//! When a write fails, or a confirmed column turns out not to be dense, the
//! affected columns are refetched and replaced. Tasks with an in-flight
//! operation other than the one reconciling keep their local version, and
//! so do tasks touched by any operation issued after the fetch started,
//! whether or not it has settled since. A stale reconciliation therefore
//! never clobbers a newer change. Remote change notifications are handled
//! the same way, protecting every task that has any operation in flight.
//!
//! Only an explicit refresh clears a column's stale mark.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use taskboard_proto::gateway::RemoteChange;
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{NewTask, Task, TaskId, TaskPatch, UserId, validate_title};

use super::BoardError;
use super::partition::{self, Column};
use super::planner::{self, Assignment, DropTarget};
use super::store::{StoreChange, TaskStore};
use crate::gateway::{GatewayError, SyncGateway};

/// Default capacity of the board event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Default capacity of the store change channel.
pub const DEFAULT_CHANGE_BUFFER: usize = 1024;

/// Settings for a [`ReorderExecutor`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Board columns.
    pub statuses: StatusSet,
    /// Recorded as `created_by` on tasks created locally.
    pub actor: UserId,
    /// Board events buffered per subscriber.
    pub event_buffer: usize,
    /// Store changes buffered per subscriber.
    pub change_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            statuses: StatusSet::default(),
            actor: UserId::new("local"),
            event_buffer: DEFAULT_EVENT_BUFFER,
            change_buffer: DEFAULT_CHANGE_BUFFER,
        }
    }
}

/// Which stage of an operation an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    /// Local state changed optimistically.
    Applied,
    /// The operation finished: confirmed, or reverted to gateway state.
    Settled,
    /// Columns were replaced from gateway state outside any local operation.
    Refreshed,
}

/// Kind of non-fatal problem surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// A write failed; local state was reverted.
    PersistFailed,
    /// Authoritative state could not be fetched; columns are stale.
    RefetchFailed,
    /// The gateway sent data violating the protocol; columns are stale.
    MalformedResponse,
}

/// Problem report attached to a [`BoardEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardWarning {
    /// What went wrong.
    pub kind: WarningKind,
    /// Columns affected.
    pub statuses: Vec<StatusKey>,
    /// Human-readable detail.
    pub message: String,
}

impl BoardWarning {
    fn new(kind: WarningKind, statuses: &[StatusKey], err: &GatewayError) -> Self {
        Self {
            kind,
            statuses: statuses.to_vec(),
            message: err.to_string(),
        }
    }
}

/// Snapshot of changed columns, published after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardEvent {
    /// Stage being reported.
    pub phase: EventPhase,
    /// Current contents of the affected columns.
    pub columns: Vec<Column>,
    /// Problem to show the user, if any.
    pub warning: Option<BoardWarning>,
}

/// The write an operation sends to the gateway.
enum Write {
    Placements(Vec<Assignment>),
    Insert(Task),
    Remove { task_id: TaskId, renumber: Vec<Assignment> },
    Edit { task_id: TaskId, patch: TaskPatch },
}

/// An issued operation waiting to persist.
struct Op {
    seq: u64,
    statuses: Vec<StatusKey>,
    /// Completion signals of earlier operations on the same tasks.
    waits: Vec<watch::Receiver<bool>>,
    done: watch::Sender<bool>,
    /// Compaction ops never trigger further compaction.
    repair: bool,
}

struct EngineState {
    store: TaskStore,
    next_seq: u64,
    /// Latest operation issued per task. Kept after the operation settles
    /// until no fetch that started before it is still running.
    latest_op: HashMap<TaskId, u64>,
    /// Completion signal of the latest operation per task.
    gates: HashMap<TaskId, watch::Receiver<bool>>,
    /// Fetches in progress, keyed by `next_seq` when they started.
    fetches: BTreeMap<u64, usize>,
    stale: HashSet<StatusKey>,
}

/// Which local versions a reconciliation leaves alone.
#[derive(Debug, Clone, Copy)]
struct Keep {
    /// Operation being reconciled (`None` outside any operation). Its own
    /// tasks take the fetched version.
    current: Option<u64>,
    /// Operations numbered above this were issued after the fetch started.
    since: u64,
}

fn gate_open(gate: &watch::Receiver<bool>) -> bool {
    *gate.borrow() || gate.has_changed().is_err()
}

/// Whether a task must keep its local version during a reconciliation.
fn is_protected(
    gates: &HashMap<TaskId, watch::Receiver<bool>>,
    latest_op: &HashMap<TaskId, u64>,
    id: &TaskId,
    keep: Keep,
) -> bool {
    let latest = latest_op.get(id).copied();
    if latest.is_some_and(|seq| seq > keep.since) {
        return true;
    }
    match gates.get(id) {
        Some(gate) if !gate_open(gate) => latest != keep.current,
        _ => false,
    }
}

impl EngineState {
    fn begin(&mut self, ids: &[TaskId], statuses: Vec<StatusKey>, repair: bool) -> Op {
        self.prune();


        self.next_seq += 1;
        let seq = self.next_seq;
        let (done, gate) = watch::channel(false);
        let mut waits = Vec::new();
        for id in ids {
            if let Some(previous) = self.gates.insert(*id, gate.clone()) {
                waits.push(previous);
            }
            self.latest_op.insert(*id, seq);
        }
        Op {
            seq,
            statuses,
            waits,
            done,
            repair,
        }
    }

    /// Forgets finished operations no running fetch can predate.
    fn prune(&mut self) {
        self.gates.retain(|_, gate| !gate_open(gate));
        let floor = self.fetches.keys().next().copied().unwrap_or(self.next_seq);
        let gates = &self.gates;
        self.latest_op.retain(|id, seq| *seq > floor || gates.contains_key(id));
    }

    /// Keep rule for a check that involves no fetch.
    const fn settled_keep(&self, current: u64) -> Keep {
        Keep {
            current: Some(current),
            since: self.next_seq,
        }
    }

    fn open_fetch(&mut self) -> u64 {
        let since = self.next_seq;
        *self.fetches.entry(since).or_default() += 1;
        since
    }

    fn close_fetch(&mut self, since: u64) {
        if let Some(count) = self.fetches.get_mut(&since) {
            *count -= 1;
            if *count == 0 {
                self.fetches.remove(&since);
            }
        }
    }

    fn protected(&self, id: &TaskId, keep: Keep) -> bool {
        is_protected(&self.gates, &self.latest_op, id, keep)
    }

    fn apply(&mut self, assignments: &[Assignment]) -> Result<(), BoardError> {
        for a in assignments {
            self.store.place(&a.task_id, a.status.clone(), a.position)?;
        }
        Ok(())
    }

    fn replace(&mut self, status: &StatusKey, fetched: Vec<Task>, keep: Keep) {
        let gates = &self.gates;
        let latest_op = &self.latest_op;
        self.store
            .replace_partition(status, fetched, |id| is_protected(gates, latest_op, id, keep));
    }

    fn snapshot(&self, statuses: &[StatusKey]) -> Vec<Column> {
        partition::snapshot(self.store.all(), statuses)
    }

    /// Columns among `statuses` that are not dense and have no protected
    /// task.
    fn uneven(&self, statuses: &[StatusKey], keep: Keep) -> Vec<StatusKey> {
        statuses
            .iter()
            .filter(|status| {
                let column = partition::by_status(self.store.all(), status);
                !partition::is_dense(&column) && column.iter().all(|t| !self.protected(&t.id, keep))
            })
            .cloned()
            .collect()
    }
}

struct Inner<G> {
    gateway: G,
    statuses: StatusSet,
    actor: UserId,
    state: Mutex<EngineState>,
    events: broadcast::Sender<BoardEvent>,
    in_flight: watch::Sender<usize>,
}

/// Keeps the in-flight counter raised while alive.
struct Busy<G: SyncGateway>(Arc<Inner<G>>);

impl<G: SyncGateway> Busy<G> {
    fn new(inner: &Arc<Inner<G>>) -> Self {
        inner.in_flight.send_modify(|n| *n += 1);
        Self(Arc::clone(inner))
    }
}

impl<G: SyncGateway> Drop for Busy<G> {
    fn drop(&mut self) {
        self.0.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Registers a running fetch while alive, so operations issued after it
/// started stay remembered.
struct FetchWindow<'a> {
    state: &'a Mutex<EngineState>,
    since: u64,
}

impl<'a> FetchWindow<'a> {
    fn open(state: &'a Mutex<EngineState>) -> Self {
        let since = state.lock().open_fetch();
        Self { state, since }
    }
}

impl Drop for FetchWindow<'_> {
    fn drop(&mut self) {
        self.state.lock().close_fetch(self.since);
    }
}

/// Optimistic board engine over a [`SyncGateway`].
///
/// Mutating operations validate their preconditions, apply the change to
/// the local store and publish an [`EventPhase::Applied`] event before
/// returning. Persistence and reconciliation continue in the background;
/// use [`settled`](Self::settled) to wait for them.
///
/// Cloning is cheap and yields a handle on the same engine. Must be used
/// from within a tokio runtime.
pub struct ReorderExecutor<G: SyncGateway> {
    inner: Arc<Inner<G>>,
}

impl<G: SyncGateway> Clone for ReorderExecutor<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: SyncGateway> ReorderExecutor<G> {
    /// Creates an engine with an empty local store.
    ///
    /// Call [`refresh_all`](Self::refresh_all) to load the board.
    pub fn new(gateway: G, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (in_flight, _) = watch::channel(0);
        let state = EngineState {
            store: TaskStore::new(config.change_buffer),
            next_seq: 0,
            latest_op: HashMap::new(),
            gates: HashMap::new(),
            fetches: BTreeMap::new(),
            stale: HashSet::new(),
        };
        Self {
            inner: Arc::new(Inner {
                gateway,
                statuses: config.statuses,
                actor: config.actor,
                state: Mutex::new(state),
                events,
                in_flight,
            }),
        }
    }

    /// The board's columns.
    #[must_use]
    pub fn statuses(&self) -> &StatusSet {
        &self.inner.statuses
    }

    /// The gateway this engine persists through.
    #[must_use]
    pub fn gateway(&self) -> &G {
        &self.inner.gateway
    }

    /// Subscribes to board events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribes to raw store changes.
    #[must_use]
    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.state.lock().store.subscribe()
    }

    /// Tasks in one column, sorted by position.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::UnknownStatus`] for a status that is not a column.
    pub fn list_column(&self, status: &StatusKey) -> Result<Vec<Task>, BoardError> {
        self.ensure_status(status)?;
        let state = self.inner.state.lock();
        Ok(partition::by_status(state.store.all(), status)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Snapshot of every column in board order.
    #[must_use]
    pub fn columns(&self) -> Vec<Column> {
        self.inner.state.lock().snapshot(self.inner.statuses.columns())
    }

    /// Local version of one task.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::TaskNotFound`] if the task is not on the board.
    pub fn get(&self, id: &TaskId) -> Result<Task, BoardError> {
        self.inner.state.lock().store.get(id).cloned()
    }

    /// Whether a column could not be reconciled and may be out of date.
    #[must_use]
    pub fn is_stale(&self, status: &StatusKey) -> bool {
        self.inner.state.lock().stale.contains(status)
    }

    /// Moves a task to `index` in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::TaskNotFound`] or [`BoardError::UnknownStatus`];
    /// in both cases nothing changes.
    pub fn move_task(
        &self,
        id: &TaskId,
        status: &StatusKey,
        index: usize,
    ) -> Result<(), BoardError> {
        self.move_task_to(id, status, DropTarget::Index(index))
    }

    /// Moves a task to a drop target in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::TaskNotFound`] or [`BoardError::UnknownStatus`];
    /// in both cases nothing changes.
    pub fn move_task_to(
        &self,
        id: &TaskId,
        status: &StatusKey,
        target: DropTarget,
    ) -> Result<(), BoardError> {
        self.ensure_status(status)?;
        let (op, plan, columns) = {
            let mut state = self.inner.state.lock();
            let task = state.store.get(id)?;
            let plan = planner::plan_move(state.store.all(), task, status, target);
            if plan.is_noop() {
                tracing::debug!(task_id = %id, %status, "move changes nothing");
                return Ok(());
            }
            let touched = plan.touched_statuses();
            let op = state.begin(&plan.task_ids(), touched.clone(), false);
            state.apply(&plan.assignments)?;
            let columns = state.snapshot(&touched);
            (op, plan, columns)
        };

        tracing::info!(
            task_id = %id,
            from = %plan.from,
            to = %plan.to,
            index = plan.index,
            seq = op.seq,
            assignments = plan.assignments.len(),
            "task moved"
        );
        self.publish(EventPhase::Applied, columns, None);
        self.launch(op, Write::Placements(plan.assignments));
        Ok(())
    }

    /// Creates a task at the end of its column (the default column unless
    /// `fields.status` names one).
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::TitleEmpty`], [`BoardError::TitleTooLong`] or
    /// [`BoardError::UnknownStatus`].
    pub fn create(&self, fields: NewTask) -> Result<TaskId, BoardError> {
        validate_title(&fields.title)?;
        let status = fields
            .status
            .clone()
            .unwrap_or_else(|| self.inner.statuses.default_status().clone());
        self.ensure_status(&status)?;

        let id = TaskId::new();
        let (op, task, columns) = {
            let mut state = self.inner.state.lock();
            let position = planner::rank(partition::by_status(state.store.all(), &status).len());
            let task = Task::from_new(
                id,
                fields,
                status.clone(),
                position,
                self.inner.actor.clone(),
                Utc::now(),
            );
            let touched = vec![status.clone()];
            let op = state.begin(&[id], touched.clone(), false);
            state.store.upsert(task.clone());
            let columns = state.snapshot(&touched);
            (op, task, columns)
        };

        tracing::info!(task_id = %id, %status, position = task.position, seq = op.seq, "task created");
        self.publish(EventPhase::Applied, columns, None);
        self.launch(op, Write::Insert(task));
        Ok(id)
    }

    /// Deletes a task and closes the gap it leaves.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::TaskNotFound`].
    pub fn delete(&self, id: &TaskId) -> Result<(), BoardError> {
        let (op, renumber, columns) = {
            let mut state = self.inner.state.lock();
            let task = state.store.get(id)?;
            let status = task.status.clone();
            let renumber = planner::plan_removal(state.store.all(), task);

            let mut ids = vec![*id];
            ids.extend(renumber.iter().map(|a| a.task_id));
            let touched = vec![status];
            let op = state.begin(&ids, touched.clone(), false);
            state.store.remove(id);
            state.apply(&renumber)?;
            let columns = state.snapshot(&touched);
            (op, renumber, columns)
        };

        tracing::info!(task_id = %id, shifted = renumber.len(), seq = op.seq, "task deleted");
        self.publish(EventPhase::Applied, columns, None);
        self.launch(op, Write::Remove { task_id: *id, renumber });
        Ok(())
    }

    /// Edits non-placement fields of a task.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::PlacementInEdit`] if the patch sets status or
    /// position, a title error for an invalid new title, or
    /// [`BoardError::TaskNotFound`].
    pub fn edit_fields(&self, id: &TaskId, patch: TaskPatch) -> Result<(), BoardError> {
        if patch.touches_placement() {
            return Err(BoardError::PlacementInEdit);
        }
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }
        let (op, columns) = {
            let mut state = self.inner.state.lock();
            let status = state.store.get(id)?.status.clone();
            if patch.is_empty() {
                return Ok(());
            }
            let touched = vec![status];
            let op = state.begin(&[*id], touched.clone(), false);
            state.store.edit(id, &patch, Utc::now())?;
            let columns = state.snapshot(&touched);
            (op, columns)
        };

        tracing::info!(task_id = %id, seq = op.seq, "task edited");
        self.publish(EventPhase::Applied, columns, None);
        self.launch(op, Write::Edit { task_id: *id, patch });
        Ok(())
    }

    /// Replaces one column with the gateway's version.
    ///
    /// Tasks with operations still in flight keep their local version. On
    /// success the column is no longer stale.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::UnknownStatus`], or [`BoardError::Gateway`] if
    /// the column could not be fetched (it is then marked stale).
    pub async fn refresh(&self, status: &StatusKey) -> Result<(), BoardError> {
        self.ensure_status(status)?;
        self.reconcile(None, &[status.clone()], None, false, true, EventPhase::Refreshed)
            .await
            .map_err(BoardError::from)
    }

    /// Replaces every column with the gateway's version and clears the stale
    /// mark of each column fetched.
    ///
    /// # Errors
    ///
    /// Returns the first fetch failure; the other columns are still applied.
    pub async fn refresh_all(&self) -> Result<(), BoardError> {
        let statuses = self.inner.statuses.columns().to_vec();
        self.reconcile(None, &statuses, None, false, true, EventPhase::Refreshed)
            .await
            .map_err(BoardError::from)
    }

    /// Waits until every issued operation, and any reconciliation it
    /// triggered, has finished.
    pub async fn settled(&self) {
        let mut in_flight = self.inner.in_flight.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = in_flight.wait_for(|n| *n == 0).await;
    }

    /// Starts reconciling columns changed by other clients.
    ///
    /// Runs until the gateway's change feed closes; abort the handle to stop
    /// earlier. If notifications were dropped, the whole board is refetched.
    pub fn spawn_remote_listener(&self) -> JoinHandle<()> {
        let mut changes = self.inner.gateway.subscribe();
        let exec = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => exec.on_remote_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed remote changes, refetching board");
                        let _busy = Busy::new(&exec.inner);
                        let statuses = exec.inner.statuses.columns().to_vec();
                        let _ = exec
                            .reconcile(None, &statuses, None, false, false, EventPhase::Refreshed)
                            .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("remote change feed closed");
                        break;
                    }
                }
            }
        })
    }

    async fn on_remote_change(&self, change: RemoteChange) {
        if !self.inner.statuses.contains(&change.status) {
            tracing::debug!(status = %change.status, "ignoring change to unknown column");
            return;
        }
        tracing::debug!(status = %change.status, origin = %change.origin, "remote change");
        let _busy = Busy::new(&self.inner);
        let _ = self
            .reconcile(None, &[change.status], None, false, false, EventPhase::Refreshed)
            .await;
    }

    fn ensure_status(&self, status: &StatusKey) -> Result<(), BoardError> {
        if self.inner.statuses.contains(status) {
            Ok(())
        } else {
            Err(BoardError::UnknownStatus(status.clone()))
        }
    }

    fn publish(&self, phase: EventPhase, columns: Vec<Column>, warning: Option<BoardWarning>) {
        // No subscribers is fine.
        let _ = self.inner.events.send(BoardEvent {
            phase,
            columns,
            warning,
        });
    }

    fn emit(&self, phase: EventPhase, statuses: &[StatusKey], warning: Option<BoardWarning>) {
        let columns = self.inner.state.lock().snapshot(statuses);
        self.publish(phase, columns, warning);
    }

    /// Persists an issued operation in the background.
    fn launch(&self, op: Op, write: Write) {
        let busy = Busy::new(&self.inner);
        let exec = self.clone();
        tokio::spawn(async move {
            let Op {
                seq,
                statuses,
                waits,
                done,
                repair,
            } = op;
            for mut previous in waits {
                // A dropped sender means the earlier operation is gone too.
                let _ = previous.wait_for(|finished| *finished).await;
            }

            let outcome = exec.write(&write).await;
            exec.settle(seq, &statuses, &write, repair, outcome).await;

            done.send_replace(true);
            drop(busy);
        });
    }

    async fn write(&self, write: &Write) -> Result<(), GatewayError> {
        let gateway = &self.inner.gateway;
        match write {
            Write::Placements(assignments) => persist_all(gateway, assignments).await,
            Write::Insert(task) => gateway.insert(task).await,
            Write::Remove { task_id, renumber } => {
                gateway.remove(task_id).await?;
                persist_all(gateway, renumber).await
            }
            Write::Edit { task_id, patch } => gateway.persist(task_id, patch).await,
        }
    }

    async fn settle(
        &self,
        seq: u64,
        statuses: &[StatusKey],
        write: &Write,
        repair: bool,
        outcome: Result<(), GatewayError>,
    ) {
        match outcome {
            Ok(()) => {
                let uneven = {
                    let state = self.inner.state.lock();
                    state.uneven(statuses, state.settled_keep(seq))
                };
                if uneven.is_empty() {
                    tracing::debug!(seq, "operation confirmed");
                    self.emit(EventPhase::Settled, statuses, None);
                } else {
                    tracing::info!(seq, ?uneven, "confirmed columns are not dense, refetching");
                    let _ = self
                        .reconcile(Some(seq), &uneven, None, repair, false, EventPhase::Settled)
                        .await;
                }
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(seq, error = %err, ?statuses, "malformed gateway response, marking columns stale");
                self.inner.state.lock().stale.extend(statuses.iter().cloned());
                let warning = BoardWarning::new(WarningKind::MalformedResponse, statuses, &err);
                self.emit(EventPhase::Settled, statuses, Some(warning));
            }
            Err(err) => {
                tracing::warn!(seq, error = %err, "persistence failed, reverting to gateway state");
                let warning = BoardWarning::new(WarningKind::PersistFailed, statuses, &err);

                if let Write::Insert(task) = write {
                    let uneven = {
                        let mut state = self.inner.state.lock();
                        if state.latest_op.get(&task.id) == Some(&seq) {
                            state.store.remove(&task.id);
                        }
                        state.uneven(statuses, state.settled_keep(seq))
                    };
                    if uneven.is_empty() {
                        self.emit(EventPhase::Settled, statuses, Some(warning));
                        return;
                    }
                }

                let _ = self
                    .reconcile(
                        Some(seq),
                        statuses,
                        Some(warning),
                        repair,
                        false,
                        EventPhase::Settled,
                    )
                    .await;
            }
        }
    }

    /// Refetches `statuses` and replaces them locally, then repairs any
    /// column left uneven. Returns the first fetch failure.
    ///
    /// With `clear_stale`, columns fetched successfully lose their stale mark.
    async fn reconcile(
        &self,
        current: Option<u64>,
        statuses: &[StatusKey],
        warning: Option<BoardWarning>,
        repair: bool,
        clear_stale: bool,
        phase: EventPhase,
    ) -> Result<(), GatewayError> {
        let window = FetchWindow::open(&self.inner.state);
        let keep = Keep {
            current,
            since: window.since,
        };
        let mut fetches = Vec::with_capacity(statuses.len());
        for status in statuses {
            fetches.push(self.fetch_checked(status));
        }
        let fetched = join_all(fetches).await;

        let mut failed = Vec::new();
        let mut first_err = None;
        let uneven = {
            let mut state = self.inner.state.lock();
            for (status, result) in statuses.iter().zip(fetched) {
                match result {
                    Ok(tasks) => {
                        state.replace(status, tasks, keep);
                        if clear_stale {
                            state.stale.remove(status);
                        }
                    }
                    Err(err) => {
                        state.stale.insert(status.clone());
                        failed.push(status.clone());
                        first_err.get_or_insert(err);
                    }
                }
            }
            let replaced: Vec<StatusKey> = statuses
                .iter()
                .filter(|s| !failed.contains(s))
                .cloned()
                .collect();
            state.uneven(&replaced, keep)
        };
        drop(window);

        let warning = match &first_err {
            Some(err) => {
                let kind = if err.is_fatal() {
                    WarningKind::MalformedResponse
                } else {
                    WarningKind::RefetchFailed
                };
                tracing::warn!(error = %err, ?failed, "refetch failed, columns are stale");
                Some(BoardWarning::new(kind, &failed, err))
            }
            None => warning,
        };
        self.emit(phase, statuses, warning);

        if !uneven.is_empty() {
            if repair {
                tracing::warn!(?uneven, "columns still uneven after repair");
            } else {
                self.compact(&uneven);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Fetches a column and checks it is well-formed.
    async fn fetch_checked(&self, status: &StatusKey) -> Result<Vec<Task>, GatewayError> {
        let tasks = self.inner.gateway.fetch_partition(status).await?;
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if task.status != *status {
                return Err(GatewayError::Malformed(format!(
                    "task {} in partition {status} has status {}",
                    task.id, task.status
                )));
            }
            if !seen.insert(task.id) {
                return Err(GatewayError::Malformed(format!(
                    "task {} appears twice in partition {status}",
                    task.id
                )));
            }
        }
        Ok(tasks)
    }

    /// Issues one repair operation renumbering each uneven column.
    fn compact(&self, statuses: &[StatusKey]) {
        for status in statuses {
            let issued = {
                let mut state = self.inner.state.lock();
                let assignments = planner::plan_compaction(state.store.all(), status);
                if assignments.is_empty() {
                    None
                } else {
                    let ids: Vec<TaskId> = assignments.iter().map(|a| a.task_id).collect();
                    let touched = vec![status.clone()];
                    let op = state.begin(&ids, touched.clone(), true);
                    match state.apply(&assignments) {
                        Ok(()) => Some((op, assignments, state.snapshot(&touched))),
                        Err(err) => {
                            tracing::warn!(error = %err, %status, "compaction plan went stale");
                            None
                        }
                    }
                }
            };
            if let Some((op, assignments, columns)) = issued {
                tracing::info!(%status, seq = op.seq, assignments = assignments.len(), "compacting column");
                self.publish(EventPhase::Applied, columns, None);
                self.launch(op, Write::Placements(assignments));
            }
        }
    }
}

/// Persists placements concurrently, preferring a fatal error if any.
async fn persist_all<G: SyncGateway>(
    gateway: &G,
    assignments: &[Assignment],
) -> Result<(), GatewayError> {
    let patches: Vec<(TaskId, TaskPatch)> = assignments
        .iter()
        .map(|a| (a.task_id, a.patch()))
        .collect();
    let mut writes = Vec::with_capacity(patches.len());
    for (id, patch) in &patches {
        writes.push(gateway.persist(id, patch));
    }
    let results = join_all(writes).await;

    let mut first = None;
    for result in results {
        if let Err(err) = result {
            if err.is_fatal() {
                return Err(err);
            }
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}
