//! Migration task identities and per-store sub-task state.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::slots::SlotBitmap;
use crate::topology::NodeName;

/// A migration task id: the 40-hex sender name plus a 2-hex sequence,
/// 42 characters total. Unique per sender until 256 concurrent tasks,
/// which is far past the task-count gate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(sender: &NodeName, seq: u64) -> Self {
        Self(format!("{}{:02x}", sender.as_str(), seq % 256))
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 42 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one per-store transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet admitted to the pool (waiting).
    Start,
    /// Streaming the point-in-time snapshot.
    Snapshot,
    /// Tailing the binlog until the lag closes.
    Binlog,
    /// Final drain and two-phase ack.
    Commit,
    /// Terminal: transferred and acknowledged.
    Succ,
    /// Terminal: gave up after errors or an epoch conflict.
    Fail,
    /// Frozen at a batch boundary; RESTART resumes from the checkpoint.
    Stopped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succ | TaskState::Fail)
    }

    /// States that count as live work in the operator counters.
    pub fn is_running(self) -> bool {
        matches!(self, TaskState::Snapshot | TaskState::Binlog | TaskState::Commit)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Start => "start",
            TaskState::Snapshot => "snapshot",
            TaskState::Binlog => "binlog",
            TaskState::Commit => "commit",
            TaskState::Succ => "succ",
            TaskState::Fail => "fail",
            TaskState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Mutable progress of one per-store transfer, shared between the manager
/// table and the running task.
#[derive(Debug)]
pub struct SubTaskInfo {
    pub store_id: u32,
    /// Slots of the parent task that live on this store.
    pub slots: SlotBitmap,
    pub state: TaskState,
    /// Snapshot checkpoint: slots fully streamed. RESTART skips these.
    pub slots_done: SlotBitmap,
    /// Binlog checkpoint: last forwarded offset.
    pub binlog_pos: u64,
    pub bytes_sent: u64,
    pub entries_sent: u64,
    pub last_error: Option<String>,
}

impl SubTaskInfo {
    pub fn new(store_id: u32, slots: SlotBitmap) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            store_id,
            slots,
            state: TaskState::Start,
            slots_done: SlotBitmap::new(),
            binlog_pos: 0,
            bytes_sent: 0,
            entries_sent: 0,
            last_error: None,
        }))
    }
}

pub type SharedSubTask = Arc<Mutex<SubTaskInfo>>;

/// Sender-side parent task: one per `SETSLOT MIGRATING` instruction.
pub struct MigrateTask {
    pub id: TaskId,
    pub dst: NodeName,
    pub slots: SlotBitmap,
    pub sub_tasks: Vec<SharedSubTask>,
    /// Stop signal observed by every sub-task at batch boundaries.
    pub stop: watch::Sender<bool>,
    /// Set once ownership transfer has been applied.
    pub finalized: bool,
    /// Wall-clock ms when the task was created / reached a terminal state.
    pub created: u64,
    pub finished: u64,
}

impl MigrateTask {
    pub fn states(&self) -> Vec<TaskState> {
        self.sub_tasks
            .iter()
            .map(|s| s.lock().unwrap().state)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.states().iter().all(|s| *s == TaskState::Succ)
    }

    pub fn any_failed(&self) -> bool {
        self.states().iter().any(|s| *s == TaskState::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_shape() {
        let name = NodeName::parse(&"ab".repeat(20)).unwrap();
        let id = TaskId::new(&name, 0x1f);
        assert_eq!(id.as_str().len(), 42);
        assert!(id.as_str().starts_with(name.as_str()));
        assert!(TaskId::parse(id.as_str()).is_some());
        assert!(TaskId::parse("nope").is_none());
    }

    #[test]
    fn state_predicates() {
        assert!(TaskState::Succ.is_terminal());
        assert!(TaskState::Fail.is_terminal());
        assert!(!TaskState::Stopped.is_terminal());
        assert!(TaskState::Snapshot.is_running());
        assert!(!TaskState::Start.is_running());
        assert!(!TaskState::Stopped.is_running());
    }
}
