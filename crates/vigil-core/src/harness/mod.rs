//! Harness adapter interface for coding-agent CLIs.
//!
//! ```text
//! HarnessRegistry --get("claude-code")--> Arc<dyn Harness>
//!                                              |
//! ProcessSupervisor::execute(task)             |
//!     preflight(config) -----------------------+
//!     binary() + task_args(task) --> sanitized child process
//! ```

pub mod claude_code;
pub mod registry;
pub mod trait_def;

pub use claude_code::ClaudeCodeAdapter;
pub use registry::HarnessRegistry;
pub use trait_def::Harness;
