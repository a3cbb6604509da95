//! Harness registry -- the agent CLIs the supervisor can drive, keyed by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::claude_code::ClaudeCodeAdapter;
use super::trait_def::Harness;

/// A collection of registered [`Harness`] implementations.
#[derive(Default, Clone)]
pub struct HarnessRegistry {
    harnesses: BTreeMap<String, Arc<dyn Harness>>,
}

impl HarnessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in adapters, with Claude Code using
    /// `claude_binary`.
    pub fn with_builtin(claude_binary: impl Into<String>) -> Self {
        let mut registry = Self::new();
        registry.register(ClaudeCodeAdapter::with_binary(claude_binary));
        registry
    }

    /// Register a harness under [`Harness::name`], returning any harness it
    /// replaced.
    pub fn register(&mut self, harness: impl Harness + 'static) -> Option<Arc<dyn Harness>> {
        let name = harness.name().to_string();
        self.harnesses.insert(name, Arc::new(harness))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Harness>> {
        self.harnesses.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.harnesses.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.harnesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.harnesses.is_empty()
    }
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessRegistry")
            .field("harnesses", &self.list())
            .finish()
    }
}
