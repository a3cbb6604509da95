//! Shared test utilities for vigil integration tests.
//!
//! Real agent CLIs are replaced by small shell scripts. [`FakeAgent`] builds
//! one that answers the version probe, the auth probe, and the task run
//! with separate snippets, so each test only spells out the part it cares
//! about.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use vigil_core::broadcast::{OutputChunk, StreamKind, Subscriber};
use vigil_core::{ClaudeCodeAdapter, SupervisorConfig};

/// Write an executable script at `dir/name` and return its path.
pub fn write_script(dir: &Path, name: &str, contents: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents).with_context(|| format!("failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("failed to chmod {}", path.display()))?;
    }

    Ok(path)
}

/// Builder for a fake agent CLI script.
///
/// The generated script treats `--version` as the version probe, any
/// invocation containing `--max-turns` as the auth probe, and everything
/// else as a task run. Each body is an arbitrary shell snippet.
#[derive(Debug, Clone)]
pub struct FakeAgent {
    version: String,
    auth: String,
    run: String,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self {
            version: "echo 'fake-agent 1.0.0'".to_string(),
            auth: "echo OK".to_string(),
            run: "echo 'nothing to do'".to_string(),
        }
    }

    /// Snippet answering `--version`.
    pub fn version(mut self, body: impl Into<String>) -> Self {
        self.version = body.into();
        self
    }

    /// Snippet answering the auth probe.
    pub fn auth(mut self, body: impl Into<String>) -> Self {
        self.auth = body.into();
        self
    }

    /// Snippet executed for the task itself, in the task's working directory.
    pub fn run(mut self, body: impl Into<String>) -> Self {
        self.run = body.into();
        self
    }

    pub fn script(&self) -> String {
        format!(
            "#!/bin/sh\n\
             version_probe() {{\n{version}\n}}\n\
             auth_probe() {{\n{auth}\n}}\n\
             task_run() {{\n{run}\n}}\n\
             if [ \"$1\" = \"--version\" ]; then\n  version_probe\n  exit $?\nfi\n\
             for arg in \"$@\"; do\n  if [ \"$arg\" = \"--max-turns\" ]; then\n    auth_probe\n    exit $?\n  fi\ndone\n\
             task_run\n",
            version = self.version,
            auth = self.auth,
            run = self.run,
        )
    }

    /// Write the script into `dir` as `fake-agent`.
    pub fn install(&self, dir: &Path) -> Result<PathBuf> {
        write_script(dir, "fake-agent", &self.script())
    }

    /// Install into `dir` and return an adapter pointing at the script.
    pub fn adapter(&self, dir: &Path) -> Result<ClaudeCodeAdapter> {
        let path = self.install(dir)?;
        let path = path
            .to_str()
            .context("script path is not valid UTF-8")?
            .to_string();
        Ok(ClaudeCodeAdapter::with_binary(path))
    }
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervisor settings scaled down for tests.
pub fn fast_config() -> SupervisorConfig {
    use std::time::Duration;

    SupervisorConfig {
        soft_timeout: Duration::from_secs(60),
        silence_check_interval: Duration::from_secs(5),
        silence_log_after: Duration::from_secs(10),
        overall_timeout: Duration::from_secs(30),
        termination_grace: Duration::from_millis(500),
        version_probe_timeout: Duration::from_secs(5),
        auth_probe_timeout: Duration::from_secs(5),
        output_drain_timeout: Duration::from_millis(500),
        ..SupervisorConfig::default()
    }
}

/// A subscriber that keeps every chunk it sees.
#[derive(Debug, Clone, Default)]
pub struct CollectingSubscriber {
    chunks: Arc<Mutex<Vec<OutputChunk>>>,
}

impl CollectingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<OutputChunk> {
        self.chunks.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Concatenated text of every chunk on `stream`.
    pub fn text_of(&self, stream: StreamKind) -> String {
        self.chunks()
            .into_iter()
            .filter(|c| c.stream == stream)
            .map(|c| c.text)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Subscriber for CollectingSubscriber {
    fn on_chunk(&self, chunk: &OutputChunk) -> Result<()> {
        self.chunks
            .lock()
            .map_err(|_| anyhow::anyhow!("collector lock poisoned"))?
            .push(chunk.clone());
        Ok(())
    }
}
