use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which channel an [`OutputChunk`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Supervisor notes (silence, escalation, evidence summary).
    System,
    /// Spawn details: binary, pid, working directory.
    Spawn,
    Preflight,
    Timeout,
    /// Synthetic state transitions written by `end_task`.
    State,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::System => "system",
            StreamKind::Spawn => "spawn",
            StreamKind::Preflight => "preflight",
            StreamKind::Timeout => "timeout",
            StreamKind::State => "state",
        }
    }

    /// Whether chunks on this stream come from the child process itself.
    pub fn is_process_output(self) -> bool {
        matches!(self, StreamKind::Stdout | StreamKind::Stderr)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted piece of output. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub timestamp: DateTime<Utc>,
    pub task_id: Uuid,
    pub session_id: Option<String>,
    pub project_id: Option<String>,
    pub stream: StreamKind,
    pub text: String,
    pub sequence: u64,
}

/// Per-task bookkeeping for active-task summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTaskInfo {
    pub task_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub last_output_time: DateTime<Utc>,
}

/// The status written as the final synthetic chunk of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndStatus {
    AwaitingResponse,
    Error,
    Complete,
}

impl EndStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EndStatus::AwaitingResponse => "AWAITING_RESPONSE",
            EndStatus::Error => "ERROR",
            EndStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for EndStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
