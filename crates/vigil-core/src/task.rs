//! Task and result types shared by the supervisor, the evidence verifier,
//! and callers consuming the result contract.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a task is allowed to do to its working directory.
///
/// Read-only kinds never need file changes to complete; the supervisor
/// writes an evidence artifact for them instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// The agent is expected to create or edit files.
    Modify,
    /// Inspect code and report findings.
    Analyze,
    /// Review existing changes.
    Review,
    /// Answer a question about the codebase.
    Question,
}

impl TaskKind {
    pub fn is_read_only(self) -> bool {
        !matches!(self, TaskKind::Modify)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Modify => "modify",
            TaskKind::Analyze => "analyze",
            TaskKind::Review => "review",
            TaskKind::Question => "question",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modify" => Ok(TaskKind::Modify),
            "analyze" | "analysis" => Ok(TaskKind::Analyze),
            "review" => Ok(TaskKind::Review),
            "question" => Ok(TaskKind::Question),
            other => Err(format!(
                "unknown task kind {other:?} (expected modify, analyze, review or question)"
            )),
        }
    }
}

/// A unit of work submitted to the supervisor. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub selected_model: Option<String>,
    pub kind: TaskKind,
}

impl Task {
    /// Create a task with a fresh id and no model override.
    pub fn new(prompt: impl Into<String>, working_directory: impl Into<PathBuf>, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            working_directory: working_directory.into(),
            selected_model: None,
            kind,
        }
    }

    /// Set the model passed to the agent CLI.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.selected_model = Some(model.into());
        self
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Complete,
    Incomplete,
    NoEvidence,
    Error,
    Blocked,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Complete => "COMPLETE",
            Status::Incomplete => "INCOMPLETE",
            Status::NoEvidence => "NO_EVIDENCE",
            Status::Error => "ERROR",
            Status::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

/// Why an execution ended without a normal evidence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockedReason {
    PreflightCliNotAvailable,
    PreflightAuthFailed,
    InteractivePrompt,
    Timeout,
}

impl fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockedReason::PreflightCliNotAvailable => "PREFLIGHT_CLI_NOT_AVAILABLE",
            BlockedReason::PreflightAuthFailed => "PREFLIGHT_AUTH_FAILED",
            BlockedReason::InteractivePrompt => "INTERACTIVE_PROMPT",
            BlockedReason::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// The last signal the supervisor had to send to end the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminatedBy {
    Sigterm,
    Sigkill,
}

/// A file whose existence was confirmed (or refuted) by reading the disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedFile {
    /// Path relative to the task's working directory.
    pub path: String,
    pub exists: bool,
    pub size: Option<u64>,
    pub preview: Option<String>,
}

/// The result contract returned once per `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub status: Status,
    pub output: String,
    pub error_text: Option<String>,
    pub modified_files: Vec<String>,
    pub verified_files: Vec<VerifiedFile>,
    pub unverified_files: Vec<String>,
    pub duration_ms: u64,
    pub working_directory: PathBuf,
    pub blocked: bool,
    pub blocked_reason: Option<BlockedReason>,
    pub terminated_by: Option<TerminatedBy>,
    pub exit_code: Option<i32>,
    /// Set when the failure is transient and the same task may be retried
    /// unchanged.
    pub retryable: bool,
}

impl ExecutionResult {
    /// An empty result for `task` with the given status; callers fill in
    /// the rest.
    pub(crate) fn for_task(task: &Task, status: Status) -> Self {
        Self {
            task_id: task.id,
            status,
            output: String::new(),
            error_text: None,
            modified_files: Vec::new(),
            verified_files: Vec::new(),
            unverified_files: Vec::new(),
            duration_ms: 0,
            working_directory: task.working_directory.clone(),
            blocked: false,
            blocked_reason: None,
            terminated_by: None,
            exit_code: None,
            retryable: false,
        }
    }

    /// True when at least one verified file actually exists on disk.
    pub fn has_existing_evidence(&self) -> bool {
        self.verified_files.iter().any(|f| f.exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_kinds() {
        assert!(!TaskKind::Modify.is_read_only());
        assert!(TaskKind::Analyze.is_read_only());
        assert!(TaskKind::Review.is_read_only());
        assert!(TaskKind::Question.is_read_only());
    }

    #[test]
    fn task_kind_parses_case_insensitively() {
        assert_eq!("Modify".parse::<TaskKind>().unwrap(), TaskKind::Modify);
        assert_eq!("analysis".parse::<TaskKind>().unwrap(), TaskKind::Analyze);
        assert!("deploy".parse::<TaskKind>().is_err());
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&Status::NoEvidence).unwrap();
        assert_eq!(json, "\"NO_EVIDENCE\"");
        let json = serde_json::to_string(&BlockedReason::PreflightCliNotAvailable).unwrap();
        assert_eq!(json, "\"PREFLIGHT_CLI_NOT_AVAILABLE\"");
    }

    #[test]
    fn display_matches_serialized_form() {
        for reason in [
            BlockedReason::PreflightCliNotAvailable,
            BlockedReason::PreflightAuthFailed,
            BlockedReason::InteractivePrompt,
            BlockedReason::Timeout,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json.trim_matches('"'), reason.to_string());
        }
    }

    #[test]
    fn has_existing_evidence_ignores_missing_files() {
        let task = Task::new("p", "/tmp", TaskKind::Modify);
        let mut result = ExecutionResult::for_task(&task, Status::Complete);
        result.verified_files.push(VerifiedFile {
            path: "gone.txt".into(),
            exists: false,
            size: None,
            preview: None,
        });
        assert!(!result.has_existing_evidence());
        result.verified_files[0].exists = true;
        assert!(result.has_existing_evidence());
    }
}
