//! Handler registry -- a tag-keyed collection of task-body handlers.
//!
//! The executor resolves a handler for a task by walking the task's tags
//! in order and taking the first tag with a registered handler.

use std::collections::HashMap;
use std::sync::Arc;

use drover_store::Task;

use super::trait_def::TaskHandler;

/// A collection of registered [`TaskHandler`]s, keyed by tag.
///
/// Handlers are stored as `Arc` so a resolved handler can be moved into a
/// spawned execution without borrowing the registry.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the tag it reports.
    ///
    /// If a handler with the same tag is already registered, it is replaced
    /// and the old one is returned.
    pub fn register(&mut self, handler: impl TaskHandler + 'static) -> Option<Arc<dyn TaskHandler>> {
        let tag = handler.tag().to_string();
        self.handlers.insert(tag, Arc::new(handler))
    }

    /// Look up a handler by exact tag.
    pub fn get(&self, tag: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(tag).cloned()
    }

    /// Resolve the handler for a task: the first of the task's tags with a
    /// registered handler.
    pub fn resolve(&self, task: &Task) -> Option<Arc<dyn TaskHandler>> {
        task.tags.iter().find_map(|tag| self.get(tag))
    }

    /// List the registered tags. Order is not guaranteed.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tags", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
