/// Process archives: named bundles of model resources
///
/// An archive is built by whoever deploys (a container, a test, the binary's
/// directory loader) and installed through the registry. Once installed, the
/// controller wraps it in an `ArchiveContext` carrying the deployment id and
/// the definition keys it contributed.

use crate::engine::application::ProcessApplicationReference;
use crate::error::{PlatformError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Archive level deployment switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveProperties {
    /// Delete the deployment (definitions, resources, jobs) on uninstall
    pub delete_upon_undeploy: bool,
    /// Reuse the latest deployment of this name when no resource changed
    pub duplicate_filtering: bool,
}

/// Bundle of model resources installed on one engine
#[derive(Debug, Clone, Default)]
pub struct ProcessArchive {
    /// Unique archive name across all engines
    pub name: String,
    /// Target engine; `None` resolves to the default engine
    pub process_engine_name: Option<String>,
    /// Model resources by file name
    pub resources: BTreeMap<String, Vec<u8>>,
    /// Deployment behaviour on install and uninstall
    pub properties: ArchiveProperties,
    /// Application the deployed definitions belong to
    pub process_application: Option<ProcessApplicationReference>,
}

impl ProcessArchive {
    /// Empty archive named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Target engine, the default engine if unset
    pub fn for_engine(mut self, engine_name: impl Into<String>) -> Self {
        self.process_engine_name = Some(engine_name.into());
        self
    }

    /// Add a resource
    pub fn with_resource(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.resources.insert(name.into(), bytes.into());
        self
    }

    /// Replace the deployment properties
    pub fn with_properties(mut self, properties: ArchiveProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Bind the archive to a process application
    pub fn with_process_application(mut self, reference: ProcessApplicationReference) -> Self {
        self.process_application = Some(reference);
        self
    }

    /// Archive named after `dir` holding every regular file inside it
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PlatformError::Validation(format!("Invalid archive directory '{}'", dir.display())))?;
        let read_error =
            |e: std::io::Error| PlatformError::Validation(format!("Failed to read archive '{}': {}", dir.display(), e));

        let mut archive = Self::new(name);
        for entry in std::fs::read_dir(dir).map_err(read_error)? {
            let path = entry.map_err(read_error)?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
                let bytes = std::fs::read(&path).map_err(read_error)?;
                archive.resources.insert(file_name.to_string(), bytes);
            }
        }
        Ok(archive)
    }
}

/// Result of a successful install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHandle {
    /// Installed archive
    pub archive_name: String,
    /// Engine the archive was installed on
    pub process_engine_name: String,
    /// `None` when the archive held no deployable resources
    pub deployment_id: Option<String>,
}

/// An archive installed on one controller
#[derive(Debug)]
pub struct ArchiveContext {
    archive: ProcessArchive,
    deployment_id: Option<String>,
    definition_keys: Vec<String>,
    active: AtomicBool,
    undeploying: AtomicBool,
}

impl ArchiveContext {
    pub(crate) fn new(archive: ProcessArchive, deployment_id: Option<String>, definition_keys: Vec<String>) -> Self {
        Self {
            archive,
            deployment_id,
            definition_keys,
            active: AtomicBool::new(true),
            undeploying: AtomicBool::new(false),
        }
    }

    /// Archive name
    pub fn name(&self) -> &str {
        &self.archive.name
    }

    /// Installed archive
    pub fn archive(&self) -> &ProcessArchive {
        &self.archive
    }

    /// Deployment created on install
    pub fn deployment_id(&self) -> Option<&str> {
        self.deployment_id.as_deref()
    }

    /// Process and case definition keys this archive deployed
    pub fn definition_keys(&self) -> &[String] {
        &self.definition_keys
    }

    /// Whether the archive is installed and active
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether uninstall has started
    pub fn is_undeploying(&self) -> bool {
        self.undeploying.load(Ordering::Acquire)
    }

    pub(crate) fn mark_undeploying(&self) {
        self.undeploying.store(true, Ordering::Release);
    }

    pub(crate) fn mark_removed(&self) {
        self.undeploying.store(false, Ordering::Release);
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_flags() {
        let archive = ProcessArchive::new("orders").with_resource("order.bpmn", "<definitions/>");
        let context = ArchiveContext::new(archive, Some("d-1".to_string()), vec!["order-process".to_string()]);
        assert!(context.is_active());
        assert!(!context.is_undeploying());

        context.mark_undeploying();
        assert!(context.is_undeploying());
        context.mark_removed();
        assert!(!context.is_active());
        assert!(!context.is_undeploying());
        assert_eq!(context.definition_keys(), ["order-process".to_string()]);
    }

    #[test]
    fn test_archive_from_dir_reads_files() {
        let dir = std::env::temp_dir().join(format!("archive-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("invoice.bpmn"), b"<definitions/>").unwrap();

        let archive = ProcessArchive::from_dir(&dir).unwrap();
        assert!(archive.name.starts_with("archive-"));
        assert_eq!(archive.resources.keys().collect::<Vec<_>>(), vec!["invoice.bpmn"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
