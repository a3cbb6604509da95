//! Supervised execution of non-interactive coding-agent CLIs.
//!
//! A [`ProcessSupervisor`] runs one [`Task`] through an agent CLI described by
//! a [`Harness`], streams every chunk of output through an
//! [`OutputBroadcaster`], and decides the final [`Status`] from what is
//! actually on disk rather than from what the agent says it did.

pub mod broadcast;
pub mod config;
pub mod env;
pub mod error;
pub mod evidence;
pub mod harness;
pub mod preflight;
pub mod prompt;
pub mod supervisor;
pub mod task;

pub use broadcast::{OutputBroadcaster, OutputChunk, StreamKind, Subscriber, Subscription};
pub use config::{BroadcastConfig, SupervisorConfig};
pub use error::{PreflightFailure, SupervisorError};
pub use harness::{ClaudeCodeAdapter, Harness, HarnessRegistry};
pub use supervisor::ProcessSupervisor;
pub use task::{BlockedReason, ExecutionResult, Status, Task, TaskKind, TerminatedBy, VerifiedFile};
