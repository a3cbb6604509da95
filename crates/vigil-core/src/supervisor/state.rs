//! Execution phases and the guard that makes the first terminal phase stick.

use std::fmt;

use tracing::debug;

/// Phase of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPhase {
    NotStarted,
    Preflight,
    Running,
    Blocked,
    Error,
    Complete,
    Incomplete,
    NoEvidence,
}

impl ExecutionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionPhase::Blocked
                | ExecutionPhase::Error
                | ExecutionPhase::Complete
                | ExecutionPhase::Incomplete
                | ExecutionPhase::NoEvidence
        )
    }

    /// Check whether `from -> to` is an edge of the phase graph.
    pub fn is_valid_transition(from: ExecutionPhase, to: ExecutionPhase) -> bool {
        matches!(
            (from, to),
            (ExecutionPhase::NotStarted, ExecutionPhase::Preflight)
                | (ExecutionPhase::NotStarted, ExecutionPhase::Running)
                | (ExecutionPhase::Preflight, ExecutionPhase::Running)
                | (ExecutionPhase::Preflight, ExecutionPhase::Error)
                | (ExecutionPhase::Running, ExecutionPhase::Blocked)
                | (ExecutionPhase::Running, ExecutionPhase::Error)
                | (ExecutionPhase::Running, ExecutionPhase::Complete)
                | (ExecutionPhase::Running, ExecutionPhase::Incomplete)
                | (ExecutionPhase::Running, ExecutionPhase::NoEvidence)
        )
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionPhase::NotStarted => "NOT_STARTED",
            ExecutionPhase::Preflight => "PREFLIGHT",
            ExecutionPhase::Running => "RUNNING",
            ExecutionPhase::Blocked => "BLOCKED",
            ExecutionPhase::Error => "ERROR",
            ExecutionPhase::Complete => "COMPLETE",
            ExecutionPhase::Incomplete => "INCOMPLETE",
            ExecutionPhase::NoEvidence => "NO_EVIDENCE",
        };
        f.write_str(s)
    }
}

/// Tracks the phase of one execution. Once a terminal phase is reached,
/// later transitions are rejected.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: ExecutionPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: ExecutionPhase::NotStarted,
        }
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    /// Move to `to`. Returns `true` when the transition was applied;
    /// `false` for invalid edges and for anything after a terminal phase.
    pub fn advance(&mut self, to: ExecutionPhase) -> bool {
        if self.phase.is_terminal() {
            debug!(from = %self.phase, to = %to, "ignoring transition after terminal phase");
            return false;
        }
        if !ExecutionPhase::is_valid_transition(self.phase, to) {
            debug!(from = %self.phase, to = %to, "invalid phase transition");
            return false;
        }
        self.phase = to;
        true
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
