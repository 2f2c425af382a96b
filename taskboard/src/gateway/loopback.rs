//! Loopback gateway for testing and offline use.
//!
//! A [`LoopbackBoard`] is an in-process authoritative store. Every
//! [`LoopbackGateway`] obtained from [`LoopbackBoard::connect`] is one client
//! of it: mutations made through one handle are announced to the
//! subscribers of every other handle, just like the network gateway does.
//!
//! The board can also misbehave on request (failed writes, failed or
//! corrupted fetches, paused persistence) so reconciliation paths can be
//! exercised deterministically.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use taskboard_proto::gateway::{GatewayFault, RemoteChange};
use taskboard_proto::status::{StatusKey, StatusSet};
use taskboard_proto::task::{NewTask, Task, TaskId, TaskPatch, UserId, validate_title};

use super::{GatewayError, SyncGateway};
use crate::board::partition;

/// Capacity of each client's change feed.
const CHANGE_BUFFER: usize = 64;

/// A write as the authoritative board received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggedWrite {
    /// A partial update.
    Persist {
        /// Client that sent it.
        origin: String,
        /// Task updated.
        task_id: TaskId,
        /// Fields set.
        patch: TaskPatch,
    },
    /// A create or overwrite.
    Insert {
        /// Client that sent it.
        origin: String,
        /// Task written.
        task_id: TaskId,
    },
    /// A delete.
    Remove {
        /// Client that sent it.
        origin: String,
        /// Task deleted.
        task_id: TaskId,
    },
}

#[derive(Debug, Default)]
struct Faults {
    persists: usize,
    inserts: usize,
    removes: usize,
    fetches: usize,
    corrupt_fetches: usize,
    malformed_writes: usize,
}

/// In-process authoritative board shared by any number of clients.
pub struct LoopbackBoard {
    statuses: StatusSet,
    tasks: Mutex<HashMap<TaskId, Task>>,
    clients: Mutex<Vec<(String, broadcast::Sender<RemoteChange>)>>,
    faults: Mutex<Faults>,
    writes: Mutex<Vec<LoggedWrite>>,
    /// `false` while writes are paused.
    open: watch::Sender<bool>,
}

impl LoopbackBoard {
    /// Creates an empty board with the given columns.
    #[must_use]
    pub fn new(statuses: StatusSet) -> Arc<Self> {
        let (open, _) = watch::channel(true);
        Arc::new(Self {
            statuses,
            tasks: Mutex::new(HashMap::new()),
            clients: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            writes: Mutex::new(Vec::new()),
            open,
        })
    }

    /// Columns configured on this board.
    #[must_use]
    pub const fn statuses(&self) -> &StatusSet {
        &self.statuses
    }

    /// Connects a new client handle.
    pub fn connect(self: &Arc<Self>, client_id: impl Into<String>) -> LoopbackGateway {
        let client_id = client_id.into();
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        self.clients.lock().push((client_id.clone(), changes.clone()));
        LoopbackGateway {
            board: Arc::clone(self),
            client_id,
            changes,
        }
    }

    /// Inserts tasks directly, without logging or notifying anyone.
    pub fn seed(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut stored = self.tasks.lock();
        for task in tasks {
            stored.insert(task.id, task);
        }
    }

    /// Seeds one task per title into `status`, positioned in order.
    pub fn seed_titles(&self, status: &StatusKey, titles: &[&str]) -> Vec<TaskId> {
        let start = self.partition(status).len();
        let created_by = UserId::new("seed");
        let now = Utc::now();
        let tasks: Vec<Task> = titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                Task::from_new(
                    TaskId::new(),
                    NewTask::titled(*title),
                    status.clone(),
                    crate::board::planner::rank(start + i),
                    created_by.clone(),
                    now,
                )
            })
            .collect();
        let ids = tasks.iter().map(|t| t.id).collect();
        self.seed(tasks);
        ids
    }

    /// Authoritative contents of a column, sorted by position.
    #[must_use]
    pub fn partition(&self, status: &StatusKey) -> Vec<Task> {
        let tasks = self.tasks.lock();
        partition::by_status(tasks.values(), status)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Authoritative version of one task.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }

    /// Number of tasks on the board.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether the board holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Every write received so far, in arrival order.
    #[must_use]
    pub fn writes(&self) -> Vec<LoggedWrite> {
        self.writes.lock().clone()
    }

    /// Makes the next `count` persists fail with a timeout.
    pub fn fail_next_persists(&self, count: usize) {
        self.faults.lock().persists = count;
    }

    /// Makes the next `count` inserts fail with a timeout.
    pub fn fail_next_inserts(&self, count: usize) {
        self.faults.lock().inserts = count;
    }

    /// Makes the next `count` removes fail with a timeout.
    pub fn fail_next_removes(&self, count: usize) {
        self.faults.lock().removes = count;
    }

    /// Makes the next `count` fetches fail with a timeout.
    pub fn fail_next_fetches(&self, count: usize) {
        self.faults.lock().fetches = count;
    }

    /// Makes the next `count` fetches return a partition with duplicate or
    /// foreign tasks in it.
    pub fn corrupt_next_fetches(&self, count: usize) {
        self.faults.lock().corrupt_fetches = count;
    }

    /// Makes the next `count` writes of any kind answer with a malformed
    /// response. The write is not applied.
    pub fn malformed_next_writes(&self, count: usize) {
        self.faults.lock().malformed_writes = count;
    }

    /// Holds every write until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.open.send_replace(false);
    }

    /// Releases held writes.
    pub fn resume(&self) {
        self.open.send_replace(true);
    }

    async fn wait_open(&self) {
        let mut open = self.open.subscribe();
        // The sender lives as long as the board.
        let _ = open.wait_for(|open| *open).await;
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut usize) -> bool {
        let mut faults = self.faults.lock();
        let remaining = pick(&mut faults);
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }

    /// Consumes a write fault, the kind-specific timeout first.
    fn write_fault(
        &self,
        pick: impl FnOnce(&mut Faults) -> &mut usize,
    ) -> Result<(), GatewayError> {
        if self.take_fault(pick) {
            return Err(GatewayError::Timeout);
        }
        if self.take_fault(|f| &mut f.malformed_writes) {
            return Err(GatewayError::Malformed("garbled write acknowledgement".to_string()));
        }
        Ok(())
    }

    fn check_status(&self, status: &StatusKey) -> Result<(), GatewayError> {
        if self.statuses.contains(status) {
            Ok(())
        } else {
            Err(GatewayError::Rejected(GatewayFault::UnknownStatus(status.clone())))
        }
    }

    fn notify(&self, origin: &str, mut statuses: Vec<StatusKey>) {
        statuses.sort();
        statuses.dedup();
        let clients = self.clients.lock();
        for (client_id, changes) in clients.iter().filter(|(id, _)| id != origin) {
            for status in &statuses {
                tracing::trace!(client_id, %status, "notifying loopback client");
                let _ = changes.send(RemoteChange {
                    status: status.clone(),
                    origin: origin.to_string(),
                });
            }
        }
    }

    fn fetch(&self, status: &StatusKey) -> Result<Vec<Task>, GatewayError> {
        self.check_status(status)?;
        if self.take_fault(|f| &mut f.fetches) {
            return Err(GatewayError::Timeout);
        }
        let mut tasks = self.partition(status);
        if self.take_fault(|f| &mut f.corrupt_fetches) {
            let bogus = tasks.first().cloned().unwrap_or_else(|| {
                Task::from_new(
                    TaskId::new(),
                    NewTask::titled("corrupt"),
                    StatusKey::new("corrupt"),
                    0,
                    UserId::new("loopback"),
                    Utc::now(),
                )
            });
            tasks.push(bogus);
        }
        Ok(tasks)
    }

    async fn persist(
        &self,
        origin: &str,
        task_id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<(), GatewayError> {
        self.wait_open().await;
        self.write_fault(|f| &mut f.persists)?;
        if let Some(status) = &patch.status {
            self.check_status(status)?;
        }
        if let Some(title) = &patch.title {
            validate_title(title)
                .map_err(|e| GatewayError::Rejected(GatewayFault::InvalidTask(e.to_string())))?;
        }

        let touched = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .get_mut(task_id)
                .ok_or(GatewayError::Rejected(GatewayFault::TaskNotFound(*task_id)))?;
            let before = task.status.clone();
            task.apply_patch(patch, Utc::now());
            vec![before, task.status.clone()]
        };

        self.writes.lock().push(LoggedWrite::Persist {
            origin: origin.to_string(),
            task_id: *task_id,
            patch: patch.clone(),
        });
        self.notify(origin, touched);
        Ok(())
    }

    async fn insert(&self, origin: &str, task: &Task) -> Result<(), GatewayError> {
        self.wait_open().await;
        self.write_fault(|f| &mut f.inserts)?;
        self.check_status(&task.status)?;
        validate_title(&task.title)
            .map_err(|e| GatewayError::Rejected(GatewayFault::InvalidTask(e.to_string())))?;

        let mut touched = vec![task.status.clone()];
        if let Some(previous) = self.tasks.lock().insert(task.id, task.clone()) {
            touched.push(previous.status);
        }

        self.writes.lock().push(LoggedWrite::Insert {
            origin: origin.to_string(),
            task_id: task.id,
        });
        self.notify(origin, touched);
        Ok(())
    }

    async fn remove(&self, origin: &str, task_id: &TaskId) -> Result<(), GatewayError> {
        self.wait_open().await;
        self.write_fault(|f| &mut f.removes)?;
        let removed = self.tasks.lock().remove(task_id);

        self.writes.lock().push(LoggedWrite::Remove {
            origin: origin.to_string(),
            task_id: *task_id,
        });
        if let Some(task) = removed {
            self.notify(origin, vec![task.status]);
        }
        Ok(())
    }
}

/// One client's handle on a [`LoopbackBoard`].
pub struct LoopbackGateway {
    board: Arc<LoopbackBoard>,
    client_id: String,
    changes: broadcast::Sender<RemoteChange>,
}

impl LoopbackGateway {
    /// Identity used as the origin of this handle's writes.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The shared board behind this handle.
    #[must_use]
    pub const fn board(&self) -> &Arc<LoopbackBoard> {
        &self.board
    }
}

impl SyncGateway for LoopbackGateway {
    async fn fetch_partition(&self, status: &StatusKey) -> Result<Vec<Task>, GatewayError> {
        self.board.fetch(status)
    }

    async fn persist(&self, task_id: &TaskId, patch: &TaskPatch) -> Result<(), GatewayError> {
        self.board.persist(&self.client_id, task_id, patch).await
    }

    async fn insert(&self, task: &Task) -> Result<(), GatewayError> {
        self.board.insert(&self.client_id, task).await
    }

    async fn remove(&self, task_id: &TaskId) -> Result<(), GatewayError> {
        self.board.remove(&self.client_id, task_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }
}
