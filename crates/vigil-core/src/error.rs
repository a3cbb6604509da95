//! Typed failures that map onto an [`ExecutionResult`] status.
//!
//! Everything else inside the crate propagates `anyhow::Error`; these enums
//! exist where the caller needs to tell failures apart.

use thiserror::Error;

use crate::task::{BlockedReason, Status, TerminatedBy};

/// The agent CLI could not be used at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreflightFailure {
    /// The version probe failed, exited non-zero, or hung.
    #[error("agent CLI not available: {0}")]
    CliNotAvailable(String),

    /// The auth probe failed, hung, or printed an auth-failure message.
    #[error("agent CLI authentication failed: {message}")]
    AuthFailed {
        message: String,
        /// The probe was killed (exit 137); retrying unchanged may work.
        retryable: bool,
    },
}

impl PreflightFailure {
    pub fn blocked_reason(&self) -> BlockedReason {
        match self {
            PreflightFailure::CliNotAvailable(_) => BlockedReason::PreflightCliNotAvailable,
            PreflightFailure::AuthFailed { .. } => BlockedReason::PreflightAuthFailed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PreflightFailure::AuthFailed { retryable: true, .. })
    }
}

/// Failures raised while supervising one execution.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Preflight(#[from] PreflightFailure),

    /// The child was terminated because it asked for input.
    #[error("agent blocked on an interactive prompt: {excerpt}")]
    InteractivePrompt {
        excerpt: String,
        terminated_by: TerminatedBy,
    },

    #[error("overall timeout of {timeout_secs}s exceeded")]
    Timeout {
        timeout_secs: u64,
        terminated_by: TerminatedBy,
    },

    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent process failed: {0}")]
    Process(String),

    /// Output claimed files that disk inspection could not find.
    #[error("claimed files not found on disk: {0}")]
    EvidenceMismatch(String),
}

impl SupervisorError {
    /// Status reported for this failure.
    pub fn status(&self) -> Status {
        match self {
            SupervisorError::Preflight(_) => Status::Error,
            SupervisorError::InteractivePrompt { .. } | SupervisorError::Timeout { .. } => {
                Status::Blocked
            }
            SupervisorError::Spawn { .. } | SupervisorError::Process(_) => Status::Error,
            SupervisorError::EvidenceMismatch(_) => Status::NoEvidence,
        }
    }

    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        match self {
            SupervisorError::Preflight(p) => Some(p.blocked_reason()),
            SupervisorError::InteractivePrompt { .. } => Some(BlockedReason::InteractivePrompt),
            SupervisorError::Timeout { .. } => Some(BlockedReason::Timeout),
            _ => None,
        }
    }

    pub fn terminated_by(&self) -> Option<TerminatedBy> {
        match self {
            SupervisorError::InteractivePrompt { terminated_by, .. }
            | SupervisorError::Timeout { terminated_by, .. } => Some(*terminated_by),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SupervisorError::Preflight(p) if p.is_retryable())
    }
}
