//! Class name to handler lookup.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::builtin::{EchoJob, FailJob, ShellJob, SleepJob};
use super::job::JobHandler;

/// Handlers addressable by class name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

impl JobRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `echo`, `sleep`, `fail` and `shell`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(EchoJob);
        registry.register(SleepJob);
        registry.register(FailJob);
        registry.register(ShellJob);
        registry
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register<H: JobHandler + 'static>(&mut self, handler: H) -> &mut Self {
        let name = handler.name();
        debug!(class = name, "Registered job handler");
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(class).cloned()
    }

    pub fn contains(&self, class: &str) -> bool {
        self.handlers.contains_key(class)
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = JobRegistry::with_builtins();
        assert_eq!(registry.classes(), vec!["echo", "fail", "shell", "sleep"]);
        assert!(registry.get("echo").is_some());
        assert!(!registry.contains("missing"));
    }
}
