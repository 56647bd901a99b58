//! In-memory task registry.
//!
//! Every job gets one [`TaskEntry`]. The walker running the job is the only
//! writer of its snapshot; pollers read it through the registry at any time.
//! State lives for the lifetime of the process only.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        TaskId(value)
    }
}

/// Primary task state. Pause is a flag on the entry, not a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of a task, as returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    /// 0..=100, never decreases.
    pub progress: u8,
    pub status: TaskStatus,
    pub paused: bool,
    /// Nodes fully handled so far.
    pub processed: usize,
    /// Nodes in the source tree; known once the survey is done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    pub uploaded: usize,
    /// Documents that could not be watermarked and were left out.
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            progress: 0,
            status: TaskStatus::Running,
            paused: false,
            processed: 0,
            total: None,
            uploaded: 0,
            skipped: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// One job's shared state plus its cooperative control signals.
#[derive(Debug)]
pub struct TaskEntry {
    id: TaskId,
    state: watch::Sender<TaskSnapshot>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl TaskEntry {
    fn new(id: TaskId) -> Self {
        let (state, _) = watch::channel(TaskSnapshot::new(id.clone()));
        let (paused, _) = watch::channel(false);
        Self {
            id,
            state,
            paused,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.state.borrow().clone()
    }

    /// Change feed for pollers that prefer push over polling.
    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.state.subscribe()
    }

    pub fn status(&self) -> TaskStatus {
        self.state.borrow().status
    }

    // ─── Control (callers) ──────────────────────────────────────────────────

    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn resume(&self) {
        self.set_paused(false);
    }

    fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
        self.state.send_modify(|s| s.paused = paused);
    }

    /// Cancellation is sticky; the walker notices it at its next check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Resolves once the task reaches a terminal status.
    pub async fn finished(&self) -> TaskSnapshot {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let result = rx.wait_for(|s| s.status.is_terminal()).await;
        match result {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    // ─── Walker side ────────────────────────────────────────────────────────

    /// Waits at a checkpoint: returns `false` if the task was cancelled,
    /// blocking (without polling) while the pause flag is set.
    pub async fn checkpoint(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let mut paused = self.paused.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = paused.wait_for(|p| !*p) => res.is_ok(),
        }
    }

    pub fn set_total(&self, total: usize) {
        self.state.send_modify(|s| s.total = Some(total));
    }

    /// Records one finished node and recomputes progress against the total.
    pub fn advance(&self, uploaded: bool, skipped: bool) {
        self.state.send_modify(|s| {
            s.processed += 1;
            if uploaded {
                s.uploaded += 1;
            }
            if skipped {
                s.skipped += 1;
            }
            if let Some(total) = s.total.filter(|t| *t > 0) {
                let pct = (s.processed.min(total) * 100 / total) as u8;
                s.progress = s.progress.max(pct);
            }
        });
    }

    /// Moves to a terminal status. Only the first transition out of
    /// `Running` sticks.
    pub fn finish(&self, status: TaskStatus, error: Option<String>) -> bool {
        self.state.send_if_modified(|s| {
            if s.status.is_terminal() || !status.is_terminal() {
                return false;
            }
            s.status = status;
            s.error = error;
            s.finished_at = Some(Utc::now());
            if status == TaskStatus::Completed {
                s.progress = 100;
            }
            true
        })
    }
}

/// Process-wide table of tasks. Cheap to clone; clones share the table.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<TaskId, Arc<TaskEntry>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh running task under a new unique id.
    pub fn create(&self) -> Arc<TaskEntry> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let mut id = TaskId::generate();
        while tasks.contains_key(&id) {
            id = TaskId::generate();
        }
        let entry = Arc::new(TaskEntry::new(id.clone()));
        tasks.insert(id, Arc::clone(&entry));
        entry
    }

    pub fn get(&self, id: &TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn snapshot(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.get(id).map(|entry| entry.snapshot())
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a task regardless of its state. A walker still holding the
    /// entry keeps running; it is simply no longer visible to pollers.
    pub fn remove(&self, id: &TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// Eviction hook: drops terminal tasks that finished before `cutoff`.
    /// Returns how many were removed.
    pub fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let before = tasks.len();
        tasks.retain(|_, entry| {
            let s = entry.state.borrow();
            !(s.status.is_terminal() && s.finished_at.is_some_and(|t| t < cutoff))
        });
        before - tasks.len()
    }
}
