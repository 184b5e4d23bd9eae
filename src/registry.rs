//! Definition and step body registries.
//!
//! The workflow registry is shared and read-mostly: lookups take a read
//! lock, registration takes the single write lock and rejects duplicate
//! (id, version) pairs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::model::{StepBody, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Workflow registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryInner {
    definitions: HashMap<(String, i32), Arc<WorkflowDefinition>>,
    /// Highest registered version per workflow id.
    latest: HashMap<String, i32>,
}

/// Registry of workflow definitions keyed by (id, version).
#[derive(Default)]
pub struct WorkflowRegistry {
    inner: RwLock<RegistryInner>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Duplicate (id, version) pairs and step-less
    /// definitions are rejected.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<()> {
        if definition.steps.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "workflow {} version {} has no steps",
                definition.id, definition.version
            )));
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let key = (definition.id.clone(), definition.version);
        if inner.definitions.contains_key(&key) {
            return Err(Error::DuplicateDefinition {
                id: definition.id,
                version: definition.version,
            });
        }

        let current_latest = inner.latest.get(&definition.id).copied();
        if current_latest.is_none_or(|v| v <= definition.version) {
            inner.latest.insert(definition.id.clone(), definition.version);
        }
        inner.definitions.insert(key, Arc::new(definition));
        Ok(())
    }

    /// Remove a definition; the latest-version index is recomputed.
    pub fn deregister(&self, id: &str, version: i32) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner
            .definitions
            .remove(&(id.to_string(), version))
            .is_none()
        {
            return;
        }

        if inner.latest.get(id) == Some(&version) {
            inner.latest.remove(id);
            let next_latest = inner
                .definitions
                .keys()
                .filter(|(def_id, _)| def_id == id)
                .map(|(_, v)| *v)
                .max();
            if let Some(v) = next_latest {
                inner.latest.insert(id.to_string(), v);
            }
        }
    }

    /// Look up by exact version, or the latest version when `None`.
    pub fn get(&self, id: &str, version: Option<i32>) -> Option<Arc<WorkflowDefinition>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let version = match version {
            Some(v) => v,
            None => *inner.latest.get(id)?,
        };
        inner.definitions.get(&(id.to_string(), version)).cloned()
    }

    pub fn is_registered(&self, id: &str, version: i32) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.definitions.contains_key(&(id.to_string(), version))
    }

    pub fn all(&self) -> Vec<Arc<WorkflowDefinition>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.definitions.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Service registry
// ---------------------------------------------------------------------------

type BodyFactory = Arc<dyn Fn() -> Box<dyn StepBody> + Send + Sync>;

/// Named step body factories — the service-provider side of body
/// construction. Steps using `BodySource::Service` resolve here.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: RwLock<HashMap<String, BodyFactory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body factory under `name`, replacing any existing one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn StepBody> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.insert(name.into(), Arc::new(factory));
    }

    /// Construct a body for `name`, or `None` if unregistered.
    pub fn resolve(&self, name: &str) -> Option<Box<dyn StepBody>> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.get(name).map(|f| f.as_ref()())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodySource, WorkflowStep};
    use crate::steps::inline;
    use crate::model::ExecutionResult;

    fn definition(id: &str, version: i32) -> WorkflowDefinition {
        WorkflowDefinition::new(id, version)
            .with_step(WorkflowStep::new(0, noop_body()))
    }

    fn noop_body() -> BodySource {
        inline(|_ctx| Ok(ExecutionResult::next()))
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = WorkflowRegistry::new();
        registry.register(definition("order", 1)).unwrap();

        let err = registry.register(definition("order", 1)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::DuplicateDefinition { version: 1, .. }
        ));
    }

    #[test]
    fn lookup_without_version_returns_latest() {
        let registry = WorkflowRegistry::new();
        registry.register(definition("order", 1)).unwrap();
        registry.register(definition("order", 3)).unwrap();
        registry.register(definition("order", 2)).unwrap();

        assert_eq!(registry.get("order", None).unwrap().version, 3);
        assert_eq!(registry.get("order", Some(1)).unwrap().version, 1);
        assert!(registry.get("order", Some(9)).is_none());
    }

    #[test]
    fn deregistering_latest_falls_back_to_previous() {
        let registry = WorkflowRegistry::new();
        registry.register(definition("order", 1)).unwrap();
        registry.register(definition("order", 2)).unwrap();

        registry.deregister("order", 2);
        assert_eq!(registry.get("order", None).unwrap().version, 1);

        registry.deregister("order", 1);
        assert!(registry.get("order", None).is_none());
    }

    #[test]
    fn empty_definition_is_rejected() {
        let registry = WorkflowRegistry::new();
        let err = registry
            .register(WorkflowDefinition::new("empty", 1))
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidDefinition(_)));
    }
}
