//! The `Harness` trait -- what the supervisor needs to know about one agent CLI.
//!
//! A harness is declarative: it names the binary and builds argument lists.
//! Spawning, environment sanitization, timers, and signalling stay in the
//! supervisor so every agent gets identical treatment.

use async_trait::async_trait;

use crate::config::SupervisorConfig;
use crate::error::PreflightFailure;
use crate::preflight::{self, PreflightReport};
use crate::task::Task;

/// Adapter interface for a non-interactive coding-agent CLI.
///
/// # Object Safety
///
/// This trait is object-safe so harnesses can be stored as
/// `Arc<dyn Harness>` and looked up through [`super::HarnessRegistry`].
#[async_trait]
pub trait Harness: Send + Sync {
    /// Registry name (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Binary to execute, resolved through the sanitized `PATH`.
    fn binary(&self) -> &str;

    /// Arguments for running `task` non-interactively.
    fn task_args(&self, task: &Task) -> Vec<String>;

    /// Arguments for the version probe.
    fn version_args(&self) -> Vec<String> {
        vec!["--version".to_string()]
    }

    /// Arguments for a minimal invocation that fails fast when the CLI is
    /// not authenticated.
    fn auth_probe_args(&self) -> Vec<String>;

    /// Lowercase substrings that mark auth-probe output as an auth failure.
    fn auth_failure_patterns(&self) -> &[&str];

    /// What the user should do when authentication fails.
    fn recovery_instructions(&self) -> String;

    /// Verify the CLI is installed and authenticated.
    async fn preflight(&self, config: &SupervisorConfig) -> Result<PreflightReport, PreflightFailure> {
        preflight::run_preflight(self, config).await
    }
}

// Compile-time assertion: Harness must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Harness) {}
};
