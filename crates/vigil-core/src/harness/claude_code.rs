//! Claude Code harness adapter.
//!
//! Runs `claude -p` in print mode with permission prompts disabled and a
//! fixed tool allow-list, so a healthy run never waits on a human.

use async_trait::async_trait;

use super::trait_def::Harness;
use crate::task::Task;

/// Tools the agent may use without asking.
pub const ALLOWED_TOOLS: &str = "Bash,Read,Edit,Write,Glob,Grep";

const AUTH_FAILURE_PATTERNS: &[&str] = &[
    "invalid api key",
    "api key not found",
    "not logged in",
    "please run /login",
    "please log in",
    "authentication_error",
    "authentication failed",
    "unauthorized",
    "oauth token has expired",
    "credit balance is too low",
];

/// Harness adapter for [Claude Code](https://docs.anthropic.com/en/docs/claude-code).
#[derive(Clone)]
pub struct ClaudeCodeAdapter {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    claude_binary_path: String,
}

impl std::fmt::Debug for ClaudeCodeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeCodeAdapter")
            .field("claude_binary_path", &self.claude_binary_path)
            .finish()
    }
}

impl ClaudeCodeAdapter {
    /// Create a new adapter that will look for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Create a new adapter with a custom binary path.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            claude_binary_path: path.into(),
        }
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Harness for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    fn binary(&self) -> &str {
        &self.claude_binary_path
    }

    fn task_args(&self, task: &Task) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--allowedTools".to_string(),
            ALLOWED_TOOLS.to_string(),
            "--no-session-persistence".to_string(),
        ];
        if let Some(model) = task.selected_model.as_deref().filter(|m| !m.trim().is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.push(task.prompt.clone());
        args
    }

    fn auth_probe_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            "--no-session-persistence".to_string(),
            "--max-turns".to_string(),
            "1".to_string(),
            "Reply with OK.".to_string(),
        ]
    }

    fn auth_failure_patterns(&self) -> &[&str] {
        AUTH_FAILURE_PATTERNS
    }

    fn recovery_instructions(&self) -> String {
        format!(
            "Claude Code is not authenticated. Run `{bin}` once in a terminal and \
             complete `/login` so credentials are stored under $HOME, then retry. \
             API keys in the environment are not passed to the agent.",
            bin = self.claude_binary_path
        )
    }
}
