/// Process applications and their bindings to deployments
///
/// A process application owns deployed resources and may contribute its own
/// expression resolver. The engine only keeps weak references: once the
/// application is dropped, resolving it fails with `Unavailable`.

use crate::error::{PlatformError, Result};
use crate::expression::resolver::ElResolver;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Deployable application contributing resolvers and beans to its processes
pub trait ProcessApplication: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Resolver consulted after the bean map, if any
    fn el_resolver(&self) -> Option<Arc<dyn ElResolver>> {
        None
    }
}

/// Non-owning handle to a process application
#[derive(Clone)]
pub struct ProcessApplicationReference {
    name: String,
    application: Weak<dyn ProcessApplication>,
}

impl fmt::Debug for ProcessApplicationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessApplicationReference")
            .field("name", &self.name)
            .field("available", &(self.application.strong_count() > 0))
            .finish()
    }
}

impl ProcessApplicationReference {
    /// Weak handle to `application`
    pub fn new(application: &Arc<dyn ProcessApplication>) -> Self {
        Self {
            name: application.name().to_string(),
            application: Arc::downgrade(application),
        }
    }

    /// Name of the referenced application
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upgrade the handle, `Unavailable` once the application was dropped
    pub fn get(&self) -> Result<Arc<dyn ProcessApplication>> {
        self.application.upgrade().ok_or_else(|| {
            PlatformError::Unavailable(format!(
                "Process application '{}' is no longer available",
                self.name
            ))
        })
    }
}

/// Deployment id → owning process application
#[derive(Debug, Default)]
pub struct ProcessApplicationManager {
    registrations: RwLock<HashMap<String, ProcessApplicationReference>>,
}

impl ProcessApplicationManager {
    /// Create an empty registration table
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a deployment to the application that owns it
    pub fn register_deployment(&self, deployment_id: &str, reference: ProcessApplicationReference) {
        tracing::debug!(
            "🔗 Binding deployment {} to process application '{}'",
            deployment_id,
            reference.name()
        );
        self.registrations
            .write()
            .insert(deployment_id.to_string(), reference);
    }

    /// Drop the binding of one deployment
    pub fn unregister_deployment(&self, deployment_id: &str) -> Option<ProcessApplicationReference> {
        self.registrations.write().remove(deployment_id)
    }

    /// Application owning `deployment_id`, if any
    pub fn application_for_deployment(&self, deployment_id: &str) -> Option<ProcessApplicationReference> {
        self.registrations.read().get(deployment_id).cloned()
    }

    /// Whether any deployment is bound
    pub fn has_registrations(&self) -> bool {
        !self.registrations.read().is_empty()
    }

    /// Drop every binding, e.g. left over from a crashed run
    pub fn clear(&self) {
        self.registrations.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Invoicing;

    impl ProcessApplication for Invoicing {
        fn name(&self) -> &str {
            "invoicing"
        }
    }

    #[test]
    fn test_reference_fails_once_application_is_gone() {
        let application: Arc<dyn ProcessApplication> = Arc::new(Invoicing);
        let reference = ProcessApplicationReference::new(&application);
        assert_eq!(reference.get().unwrap().name(), "invoicing");

        drop(application);
        let err = reference.get().unwrap_err();
        assert!(matches!(err, PlatformError::Unavailable(_)));
        assert!(err.to_string().contains("invoicing"));
    }

    #[test]
    fn test_manager_binds_deployments() {
        let application: Arc<dyn ProcessApplication> = Arc::new(Invoicing);
        let manager = ProcessApplicationManager::new();
        manager.register_deployment("d1", ProcessApplicationReference::new(&application));

        assert!(manager.application_for_deployment("d1").is_some());
        manager.clear();
        assert!(!manager.has_registrations());
    }
}
