//! Fail-closed staleness check for displayed output.
//!
//! A chunk is shown only when it can be positively tied to the viewer's
//! current task and session. Everything else is treated as stale.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::chunk::OutputChunk;

/// Phrases agents print when replaying output from an earlier run.
const LEFTOVER_PHRASES: &[&str] = &[
    "from a previous session",
    "from previous session",
    "from a previous run",
    "from the previous task",
    "resuming previous session",
    "[stale]",
];

/// What the viewer currently considers "its" task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleContext {
    pub task_id: Uuid,
    pub session_id: String,
    pub task_created_at: DateTime<Utc>,
}

/// Returns `true` when `chunk` must be hidden from a viewer in `context`.
pub fn is_stale(chunk: &OutputChunk, context: Option<&StaleContext>) -> bool {
    let Some(ctx) = context else {
        return true;
    };

    if chunk.task_id != ctx.task_id {
        return true;
    }

    match chunk.session_id.as_deref() {
        Some(session) if session == ctx.session_id => {}
        _ => return true,
    }

    if chunk.timestamp < ctx.task_created_at {
        return true;
    }

    let lowered = chunk.text.to_lowercase();
    LEFTOVER_PHRASES.iter().any(|p| lowered.contains(p))
}
