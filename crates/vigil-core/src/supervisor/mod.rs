//! Process supervisor: runs one task through preflight, a sanitized child
//! process, timers and prompt detection, and the evidence check.
//!
//! ```text
//! execute(task)
//!   PREFLIGHT  version probe, auth probe          -> ERROR on failure
//!   RUNNING    snapshot, spawn, stream + timers   -> BLOCKED on prompt / overall timeout
//!              child exits, drain, evidence       -> decision table
//!   terminal   COMPLETE | INCOMPLETE | NO_EVIDENCE | ERROR | BLOCKED
//! ```
//!
//! Every chunk of child output, and every supervisor note, goes through the
//! shared [`OutputBroadcaster`].

pub mod decision;
pub mod reader;
pub(crate) mod signal;
pub mod state;
pub mod timers;

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::broadcast::{EndStatus, OutputBroadcaster, StreamKind};
use crate::config::SupervisorConfig;
use crate::env::{sanitized_command, sanitized_env};
use crate::error::SupervisorError;
use crate::evidence::{self, EvidenceReport, Snapshot};
use crate::harness::Harness;
use crate::preflight;
use crate::prompt;
use crate::task::{ExecutionResult, Status, Task};

use decision::{Decision, DecisionInput};
use reader::chunk_stream;
use state::{ExecutionPhase, PhaseTracker};
use timers::{TimerEvent, TimerSet};

/// Characters of each stream's recent output scanned for prompts, so a
/// prompt split across two reads is still caught.
const PROMPT_WINDOW_CHARS: usize = 256;

/// Runs tasks against one agent CLI.
///
/// Cheap to share: executions are independent and may run concurrently,
/// all emitting into the same broadcaster.
#[derive(Clone)]
pub struct ProcessSupervisor {
    harness: Arc<dyn Harness>,
    broadcaster: OutputBroadcaster,
    config: SupervisorConfig,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("harness", &self.harness.name())
            .field("config", &self.config)
            .finish()
    }
}

/// How the running phase ended.
enum Ending {
    Exited(ExitStatus),
    Prompt { pattern: &'static str, excerpt: String },
    OverallTimeout,
}

impl ProcessSupervisor {
    pub fn new(harness: Arc<dyn Harness>, broadcaster: OutputBroadcaster, config: SupervisorConfig) -> Self {
        Self {
            harness,
            broadcaster,
            config,
        }
    }

    pub fn harness(&self) -> &dyn Harness {
        self.harness.as_ref()
    }

    pub fn broadcaster(&self) -> &OutputBroadcaster {
        &self.broadcaster
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run `task` to a terminal status.
    ///
    /// Never fails: every error, including a panic inside the run, becomes
    /// an [`ExecutionResult`].
    pub async fn execute(&self, task: &Task) -> ExecutionResult {
        let started = Instant::now();
        info!(
            task_id = %task.id,
            kind = %task.kind,
            harness = self.harness.name(),
            dir = %task.working_directory.display(),
            "starting execution"
        );
        self.broadcaster.start_task(task.id);

        let mut phase = PhaseTracker::new();
        let mut output = String::new();

        let outcome = std::panic::AssertUnwindSafe(self.run(task, &mut phase, &mut output))
            .catch_unwind()
            .await;

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                if !phase.phase().is_terminal() {
                    phase.advance(ExecutionPhase::Error);
                }
                failure_result(task, &err, output)
            }
            Err(_) => {
                error!(task_id = %task.id, "execution panicked");
                let mut result = ExecutionResult::for_task(task, Status::Error);
                result.output = output;
                result.error_text = Some("internal error: execution panicked".to_string());
                result
            }
        };
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let end = match result.status {
            Status::Complete => EndStatus::Complete,
            Status::Blocked => EndStatus::AwaitingResponse,
            _ => EndStatus::Error,
        };
        self.broadcaster.end_task(task.id, end);

        info!(
            task_id = %task.id,
            status = %result.status,
            duration_ms = result.duration_ms,
            verified = result.verified_files.len(),
            unverified = result.unverified_files.len(),
            "execution finished"
        );
        result
    }

    fn emit(&self, task: &Task, stream: StreamKind, text: impl Into<String>) {
        self.broadcaster.emit(task.id, stream, text, None);
    }

    async fn run(
        &self,
        task: &Task,
        phase: &mut PhaseTracker,
        output: &mut String,
    ) -> Result<ExecutionResult, SupervisorError> {
        // -- Preflight ------------------------------------------------------

        if self.config.preflight {
            phase.advance(ExecutionPhase::Preflight);
            match self.harness.preflight(&self.config).await {
                Ok(report) => {
                    self.emit(
                        task,
                        StreamKind::Preflight,
                        format!("{} ready ({})", self.harness.binary(), report.version),
                    );
                }
                Err(failure) => {
                    warn!(task_id = %task.id, error = %failure, "preflight failed");
                    self.emit(task, StreamKind::Preflight, failure.to_string());
                    phase.advance(ExecutionPhase::Error);
                    return Err(failure.into());
                }
            }
        }
        phase.advance(ExecutionPhase::Running);

        let root = task.working_directory.clone();
        if !root.is_dir() {
            return Err(SupervisorError::Process(format!(
                "working directory {} does not exist",
                root.display()
            )));
        }
        let before = capture(root.clone()).await?;
        debug!(task_id = %task.id, files = before.len(), "captured pre-run snapshot");

        // -- Spawn ------------------------------------------------------------

        let env = sanitized_env();
        let binary = self.harness.binary().to_string();
        let mut cmd = sanitized_command(&binary, self.harness.task_args(task), &env);
        cmd.current_dir(&root).stdin(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            binary: binary.clone(),
            source,
        })?;
        // Close stdin right away: anything that tries to read gets EOF.
        drop(child.stdin.take());

        let pid = child.id();
        info!(task_id = %task.id, pid = ?pid, binary = %binary, "agent spawned");
        self.emit(
            task,
            StreamKind::Spawn,
            format!(
                "spawned {binary} (pid {}) in {}",
                pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
                root.display()
            ),
        );

        let mut outputs = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => {
                chunk_stream(out, StreamKind::Stdout).merge(chunk_stream(err, StreamKind::Stderr))
            }
            _ => {
                let _ = child.kill().await;
                return Err(SupervisorError::Process("child output pipes were not captured".to_string()));
            }
        };

        // -- Supervise --------------------------------------------------------

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::arm(&self.config, timer_tx);
        let mut windows = PromptWindows::default();
        let mut output_open = true;

        let ending = loop {
            tokio::select! {
                // Output first: a prompt printed just before exit must still block.
                biased;

                item = outputs.next(), if output_open => match item {
                    Some((stream, text)) => {
                        timers.record_output();
                        output.push_str(&text);
                        let window = windows.push(stream, &text);
                        self.emit(task, stream, text);
                        if let Some(pattern) = prompt::detect_prompt(&window) {
                            break Ending::Prompt { pattern, excerpt: window.trim().to_string() };
                        }
                    }
                    None => output_open = false,
                },
                status = child.wait() => match status {
                    Ok(status) => break Ending::Exited(status),
                    Err(e) => {
                        timers.disarm();
                        let _ = child.kill().await;
                        return Err(SupervisorError::Process(format!("failed to wait on agent: {e}")));
                    }
                },
                Some(event) = timer_rx.recv() => match event {
                    TimerEvent::SoftTimeout { elapsed } => {
                        info!(task_id = %task.id, elapsed_secs = elapsed.as_secs(), "soft timeout reached, still running");
                        self.emit(
                            task,
                            StreamKind::Timeout,
                            format!("soft timeout: running for {}s, continuing", elapsed.as_secs()),
                        );
                    }
                    TimerEvent::Silence { silent_for } => {
                        info!(task_id = %task.id, silent_secs = silent_for.as_secs(), "no output from agent");
                        self.emit(
                            task,
                            StreamKind::System,
                            format!("no output for {}s, still waiting", silent_for.as_secs()),
                        );
                    }
                    TimerEvent::OverallTimeout { .. } => break Ending::OverallTimeout,
                },
            }
        };

        timers.disarm();

        let status = match ending {
            Ending::Exited(status) => status,
            Ending::Prompt { pattern, excerpt } => {
                return Err(self.block_on_prompt(task, &mut child, phase, pattern, excerpt).await);
            }
            Ending::OverallTimeout => {
                let timeout_secs = self.config.overall_timeout.as_secs();
                warn!(task_id = %task.id, timeout_secs, "overall timeout exceeded, terminating agent");
                let terminated_by = signal::escalate(&mut child, self.config.termination_grace).await;
                self.emit(
                    task,
                    StreamKind::Timeout,
                    format!("overall timeout of {timeout_secs}s exceeded; terminated by {terminated_by:?}"),
                );
                phase.advance(ExecutionPhase::Blocked);
                return Err(SupervisorError::Timeout {
                    timeout_secs,
                    terminated_by,
                });
            }
        };

        // -- Drain ------------------------------------------------------------

        let mut drained_prompt = None;
        if output_open {
            let drain_until = tokio::time::Instant::now() + self.config.output_drain_timeout;
            loop {
                match tokio::time::timeout_at(drain_until, outputs.next()).await {
                    Ok(Some((stream, text))) => {
                        output.push_str(&text);
                        let window = windows.push(stream, &text);
                        self.emit(task, stream, text);
                        if let Some(pattern) = prompt::detect_prompt(&window) {
                            drained_prompt = Some((pattern, window.trim().to_string()));
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        // A descendant still holds the pipes open.
                        debug!(task_id = %task.id, "output drain timed out, killing leftover processes");
                        if let Some(pid) = pid {
                            signal::signal_group(pid, signal::SIGKILL);
                        }
                        break;
                    }
                }
            }
        }
        drop(outputs);

        if let Some((pattern, excerpt)) = drained_prompt {
            // The child is gone; only descendants may still be running.
            if let Some(pid) = pid {
                signal::signal_group(pid, signal::SIGKILL);
            }
            return Err(self.block_on_prompt(task, &mut child, phase, pattern, excerpt).await);
        }

        let exit_code = preflight::exit_code(&status);
        info!(task_id = %task.id, exit_code = ?exit_code, "agent exited");

        // -- Evidence ---------------------------------------------------------

        let after = capture(root.clone()).await?;
        let report = {
            let root = root.clone();
            let text = output.clone();
            tokio::task::spawn_blocking(move || evidence::collect_evidence(&root, &before, &after, &text))
                .await
                .map_err(|e| SupervisorError::Process(format!("evidence task failed: {e}")))?
                .map_err(|e| SupervisorError::Process(format!("{e:#}")))?
        };

        let mut result = self.decide(task, exit_code, report, output, timers.elapsed()).await;
        result.output = output.clone();

        let reached = match result.status {
            Status::Complete => ExecutionPhase::Complete,
            Status::Incomplete => ExecutionPhase::Incomplete,
            Status::NoEvidence => ExecutionPhase::NoEvidence,
            Status::Error | Status::Blocked => ExecutionPhase::Error,
        };
        phase.advance(reached);

        self.emit(
            task,
            StreamKind::System,
            format!(
                "{}: {} verified, {} unverified",
                result.status,
                result.verified_files.len(),
                result.unverified_files.len()
            ),
        );
        Ok(result)
    }

    /// Terminate a child that printed an interactive prompt and build the
    /// BLOCKED error. A child that already exited is reported as SIGTERM.
    async fn block_on_prompt(
        &self,
        task: &Task,
        child: &mut Child,
        phase: &mut PhaseTracker,
        pattern: &'static str,
        excerpt: String,
    ) -> SupervisorError {
        warn!(task_id = %task.id, pattern, "interactive prompt detected, terminating agent");
        let terminated_by = signal::escalate(child, self.config.termination_grace).await;
        self.emit(
            task,
            StreamKind::System,
            format!("blocked on interactive prompt; terminated by {terminated_by:?}"),
        );
        phase.advance(ExecutionPhase::Blocked);
        SupervisorError::InteractivePrompt {
            excerpt,
            terminated_by,
        }
    }

    /// Apply the decision table to a run that exited on its own.
    async fn decide(
        &self,
        task: &Task,
        exit_code: Option<i32>,
        report: EvidenceReport,
        output: &str,
        elapsed: std::time::Duration,
    ) -> ExecutionResult {
        let input = DecisionInput {
            exit_ok: exit_code == Some(0),
            has_unverified: report.has_unverified(),
            has_verified: report.has_verified(),
            read_only: task.kind.is_read_only(),
        };
        let (decision, rule) = decision::decide(&input);
        debug!(task_id = %task.id, ?decision, rule, "status decided");

        let mut result = ExecutionResult::for_task(task, Status::Error);
        result.exit_code = exit_code;
        result.modified_files = report.modified_files;
        result.verified_files = report.verified_files;
        result.unverified_files = report.unverified_files;

        match decision {
            Decision::Error => {
                result.status = Status::Error;
                result.error_text = Some(match exit_code {
                    Some(code) => format!("agent exited with code {code}"),
                    None => "agent exited without an exit code".to_string(),
                });
            }
            Decision::NoEvidence => {
                let err = SupervisorError::EvidenceMismatch(result.unverified_files.join(", "));
                result.status = err.status();
                result.error_text = Some(err.to_string());
            }
            Decision::Complete => result.status = Status::Complete,
            Decision::WriteArtifact => {
                let task_owned = task.clone();
                let text = output.to_string();
                let written = tokio::task::spawn_blocking(move || {
                    evidence::write_evidence_artifact(&task_owned, &text, elapsed)
                })
                .await;
                match written {
                    Ok(Ok(file)) => {
                        info!(task_id = %task.id, path = %file.path, "evidence artifact recorded");
                        result.verified_files.push(file);
                        result.status = Status::Complete;
                    }
                    Ok(Err(e)) => {
                        warn!(task_id = %task.id, error = %e, "evidence artifact write failed");
                        result.status = Status::NoEvidence;
                        result.error_text = Some(format!("could not write evidence artifact: {e:#}"));
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "evidence artifact task failed");
                        result.status = Status::NoEvidence;
                        result.error_text = Some(format!("could not write evidence artifact: {e}"));
                    }
                }
            }
            Decision::JudgeOutput => {
                if decision::sounds_successful(output) {
                    result.status = Status::Incomplete;
                    result.error_text =
                        Some("agent reported success but no file changes were found".to_string());
                } else {
                    result.status = Status::NoEvidence;
                    result.error_text = Some("no file changes were found".to_string());
                }
            }
        }
        debug_assert!(
            result.status != Status::Complete || result.has_existing_evidence(),
            "COMPLETE without an existing verified file"
        );
        result
    }
}

/// Snapshot `root` off the async runtime.
async fn capture(root: PathBuf) -> Result<Snapshot, SupervisorError> {
    tokio::task::spawn_blocking(move || Snapshot::capture(&root))
        .await
        .map_err(|e| SupervisorError::Process(format!("snapshot task failed: {e}")))?
        .map_err(|e| SupervisorError::Process(format!("{e:#}")))
}

/// Build the result for a run that ended with `err`.
fn failure_result(task: &Task, err: &SupervisorError, output: String) -> ExecutionResult {
    let status = err.status();
    let mut result = ExecutionResult::for_task(task, status);
    result.output = output;
    result.error_text = Some(err.to_string());
    result.blocked = status == Status::Blocked;
    result.blocked_reason = err.blocked_reason();
    result.terminated_by = err.terminated_by();
    result.retryable = err.is_retryable();
    result
}

/// Recent text per stream, for prompt detection across read boundaries.
#[derive(Default)]
struct PromptWindows {
    stdout: String,
    stderr: String,
}

impl PromptWindows {
    /// Append `text` to the window for `stream` and return the window.
    fn push(&mut self, stream: StreamKind, text: &str) -> String {
        let window = match stream {
            StreamKind::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        };
        window.push_str(text);
        let count = window.chars().count();
        if count > PROMPT_WINDOW_CHARS {
            *window = window.chars().skip(count - PROMPT_WINDOW_CHARS).collect();
        }
        window.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PreflightFailure;
    use crate::task::{BlockedReason, TaskKind, TerminatedBy};

    #[test]
    fn prompt_window_joins_split_reads() {
        let mut windows = PromptWindows::default();
        assert!(prompt::detect_prompt(&windows.push(StreamKind::Stdout, "Do you want to ")).is_none());
        let window = windows.push(StreamKind::Stdout, "proceed");
        assert!(prompt::detect_prompt(&window).is_some());
        // Streams are tracked separately.
        assert_eq!(windows.push(StreamKind::Stderr, "warn"), "warn");
    }

    #[test]
    fn prompt_window_is_bounded() {
        let mut windows = PromptWindows::default();
        let window = windows.push(StreamKind::Stdout, &"x".repeat(PROMPT_WINDOW_CHARS * 3));
        assert_eq!(window.chars().count(), PROMPT_WINDOW_CHARS);
    }

    #[test]
    fn failure_result_for_retryable_auth() {
        let task = Task::new("p", "/tmp", TaskKind::Modify);
        let err = SupervisorError::from(PreflightFailure::AuthFailed {
            message: "killed. log in".into(),
            retryable: true,
        });
        let result = failure_result(&task, &err, String::new());
        assert_eq!(result.status, Status::Error);
        assert!(!result.blocked);
        assert_eq!(result.blocked_reason, Some(BlockedReason::PreflightAuthFailed));
        assert!(result.retryable);
        assert!(result.error_text.unwrap().contains("log in"));
    }

    #[test]
    fn failure_result_for_prompt_block() {
        let task = Task::new("p", "/tmp", TaskKind::Modify);
        let err = SupervisorError::InteractivePrompt {
            excerpt: "Proceed? (y/n)".into(),
            terminated_by: TerminatedBy::Sigterm,
        };
        let result = failure_result(&task, &err, "Proceed? (y/n)".into());
        assert_eq!(result.status, Status::Blocked);
        assert!(result.blocked);
        assert_eq!(result.blocked_reason, Some(BlockedReason::InteractivePrompt));
        assert_eq!(result.terminated_by, Some(TerminatedBy::Sigterm));
        assert!(result.verified_files.is_empty());
    }
}
