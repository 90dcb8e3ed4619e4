/// Engine name → running process engine
///
/// Owned by the platform instead of living in a process-wide static, so two
/// registries in one process (tests) never see each other's engines.

use crate::engine::runtime::ProcessEngine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Running engines by name
#[derive(Debug, Default)]
pub struct RuntimeDirectory {
    engines: RwLock<HashMap<String, Arc<ProcessEngine>>>,
}

impl RuntimeDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a running engine
    pub fn register(&self, engine: Arc<ProcessEngine>) {
        tracing::debug!("📒 Registering process engine '{}' in runtime directory", engine.name());
        self.engines.write().insert(engine.name().to_string(), engine);
    }

    /// Remove an engine
    pub fn deregister(&self, name: &str) -> Option<Arc<ProcessEngine>> {
        self.engines.write().remove(name)
    }

    /// Engine by name
    pub fn get(&self, name: &str) -> Option<Arc<ProcessEngine>> {
        self.engines.read().get(name).cloned()
    }

    /// Sorted engine names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of engines
    pub fn len(&self) -> usize {
        self.engines.read().len()
    }

    /// Whether no engine is published
    pub fn is_empty(&self) -> bool {
        self.engines.read().is_empty()
    }
}
