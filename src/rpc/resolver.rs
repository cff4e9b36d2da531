//! Per-connection resolver registry.
//!
//! While a cluster invocation runs, the execution resolver of its project is
//! registered here under a deterministic id derived from the working
//! directory, making identifiers defined by the remote build resolvable on
//! this side of the connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::build::project::ExecutionResolver;

#[derive(Default)]
pub struct ResolverRegistry {
    entries: Mutex<HashMap<String, Arc<ExecutionResolver>>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, resolver: Arc<ExecutionResolver>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id.into(), resolver);
        }
    }

    /// Remove the registration, but only while it still maps to `resolver`;
    /// a concurrent re-registration under the same id is left in place.
    pub fn unregister(&self, id: &str, resolver: &Arc<ExecutionResolver>) {
        if let Ok(mut entries) = self.entries.lock()
            && let Some(current) = entries.get(id)
            && Arc::ptr_eq(current, resolver)
        {
            entries.remove(id);
        }
    }

    pub fn resolve(&self, id: &str) -> Option<Arc<ExecutionResolver>> {
        self.entries.lock().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::PathKey;
    use crate::build::project::ProjectCache;
    use uuid::Uuid;

    #[test]
    fn unregister_requires_the_same_resolver() {
        let registry = ResolverRegistry::new();
        let first = ProjectCache::new(PathKey::new(Uuid::new_v4(), "/a")).execution_resolver();
        let second = ProjectCache::new(PathKey::new(Uuid::new_v4(), "/b")).execution_resolver();

        registry.register("execclasses:x", Arc::clone(&first));
        registry.unregister("execclasses:x", &second);
        assert!(registry.resolve("execclasses:x").is_some());

        registry.unregister("execclasses:x", &first);
        assert!(registry.resolve("execclasses:x").is_none());
    }
}
