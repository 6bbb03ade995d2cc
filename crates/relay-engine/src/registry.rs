//! Type-keyed handler registry, built at the composition root.

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::EventHandler;

/// Immutable-after-startup mapping from event type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous entry.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}
