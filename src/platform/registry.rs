/// Process engine registry: the platform's service facade
///
/// Maps engine names to lifecycle controllers and archive names to the engine
/// that owns them. The engine table is published through `ArcSwap`, so lookups
/// never block. Name reservations (engines and archives) happen in short
/// critical sections; deployments and engine boots run outside them.

use crate::config::{PlatformConfig, ProcessEngineConfig};
use crate::engine::controller::{ControllerContext, ProcessEngineController};
use crate::error::{PlatformError, Result};
use crate::platform::archive::{ArchiveHandle, ProcessArchive};
use crate::platform::directory::RuntimeDirectory;
use crate::platform::extension::PlatformExtension;
use crate::runtime::clock::{Clock, SystemClock};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Registered engines, replaced as a whole on every change
#[derive(Debug, Clone, Default)]
struct EngineTable {
    controllers: BTreeMap<String, Arc<ProcessEngineController>>,
    default_engine: Option<String>,
}

#[derive(Debug, Clone)]
struct ArchiveEntry {
    engine_name: String,
    installed: bool,
}

/// Platform facade owning engine controllers and archive names
#[derive(Debug)]
pub struct ProcessEngineRegistry {
    engines: ArcSwap<EngineTable>,
    /// Engines being started, name → is default
    starting: Mutex<HashMap<String, bool>>,
    archives: Mutex<HashMap<String, ArchiveEntry>>,
    extensions: RwLock<Vec<Arc<dyn PlatformExtension>>>,
    directory: Arc<RuntimeDirectory>,
    clock: Arc<dyn Clock>,
    self_ref: Weak<ProcessEngineRegistry>,
}

impl ProcessEngineRegistry {
    /// Empty registry
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Registry whose engines share `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            engines: ArcSwap::new(Arc::new(EngineTable::default())),
            starting: Mutex::new(HashMap::new()),
            archives: Mutex::new(HashMap::new()),
            extensions: RwLock::new(Vec::new()),
            directory: Arc::new(RuntimeDirectory::new()),
            clock,
            self_ref: self_ref.clone(),
        })
    }

    /// Extensions apply to engines started afterwards, in registration order
    pub fn register_extension(&self, extension: Arc<dyn PlatformExtension>) {
        debug!("🧩 Registered platform extension '{}'", extension.name());
        self.extensions.write().push(extension);
    }

    /// Running engines by name
    pub fn runtime_directory(&self) -> &Arc<RuntimeDirectory> {
        &self.directory
    }

    /// Controller of the default engine
    pub fn default_engine(&self) -> Result<Arc<ProcessEngineController>> {
        let table = self.engines.load();
        table
            .default_engine
            .as_ref()
            .and_then(|name| table.controllers.get(name))
            .cloned()
            .ok_or_else(|| PlatformError::NotFound("No default process engine registered".to_string()))
    }

    /// Controller by engine name
    pub fn engine(&self, name: &str) -> Result<Arc<ProcessEngineController>> {
        self.engines
            .load()
            .controllers
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("No process engine named '{}'", name)))
    }

    /// Sorted names of managed engines
    pub fn engine_names(&self) -> Vec<String> {
        self.engines.load().controllers.keys().cloned().collect()
    }

    /// All managed controllers
    pub fn engines(&self) -> Vec<Arc<ProcessEngineController>> {
        self.engines.load().controllers.values().cloned().collect()
    }

    /// Create a controller for `config`, start it and register it
    pub async fn start_engine(&self, config: ProcessEngineConfig) -> Result<Arc<ProcessEngineController>> {
        config.validate()?;
        {
            let mut starting = self.starting.lock().await;
            let table = self.engines.load();
            Self::check_registration(&table, &starting, &config.name, config.is_default)?;
            starting.insert(config.name.clone(), config.is_default);
        }

        let context = ControllerContext {
            registry: self.self_ref.clone(),
            directory: Arc::clone(&self.directory),
            extensions: self.extensions.read().clone(),
            clock: Arc::clone(&self.clock),
        };
        let controller = ProcessEngineController::new(config, context);
        controller.start().await?;
        Ok(controller)
    }

    /// Start every engine of a platform descriptor, in declaration order
    pub async fn start_platform(&self, config: PlatformConfig) -> Result<Vec<Arc<ProcessEngineController>>> {
        let mut controllers = Vec::with_capacity(config.engines.len());
        for engine in config.engines {
            controllers.push(self.start_engine(engine).await?);
        }
        Ok(controllers)
    }

    /// Stop one engine and release its archive names
    pub async fn stop_engine(&self, name: &str) -> Result<()> {
        self.engine(name)?.stop().await
    }

    /// Stop every registered engine; failures are logged
    pub async fn stop_all(&self) {
        for controller in self.engines() {
            if let Err(e) = controller.stop().await {
                error!("❌ Could not stop process engine '{}': {}", controller.name(), e);
            }
        }
    }

    fn check_registration(
        table: &EngineTable,
        starting: &HashMap<String, bool>,
        name: &str,
        is_default: bool,
    ) -> Result<()> {
        if table.controllers.contains_key(name) || starting.contains_key(name) {
            return Err(PlatformError::Conflict(format!(
                "Process engine '{}' is already registered",
                name
            )));
        }
        if is_default {
            let pending_default = starting.iter().find(|(_, default)| **default).map(|(n, _)| n);
            if let Some(existing) = table.default_engine.as_ref().or(pending_default) {
                return Err(PlatformError::lifecycle(format!(
                    "Cannot register '{}' as default process engine: '{}' already is",
                    name, existing
                )));
            }
        }
        Ok(())
    }

    /// Publish a controller that finished starting
    pub(crate) async fn engine_started(&self, controller: Arc<ProcessEngineController>) -> Result<()> {
        let mut starting = self.starting.lock().await;
        let name = controller.name().to_string();
        if starting.remove(&name).is_none() {
            // started directly, not through start_engine
            Self::check_registration(&self.engines.load(), &starting, &name, controller.is_default())?;
        }

        let mut table = (**self.engines.load()).clone();
        if controller.is_default() {
            table.default_engine = Some(name.clone());
        }
        table.controllers.insert(name.clone(), controller);
        self.engines.store(Arc::new(table));
        info!("📝 Registered process engine '{}'", name);
        Ok(())
    }

    pub(crate) async fn engine_failed(&self, name: &str) {
        self.starting.lock().await.remove(name);
        warn!("⚠️ Process engine '{}' was not registered", name);
    }

    pub(crate) async fn engine_stopped(&self, name: &str) {
        {
            let _starting = self.starting.lock().await;
            let mut table = (**self.engines.load()).clone();
            table.controllers.remove(name);
            if table.default_engine.as_deref() == Some(name) {
                table.default_engine = None;
            }
            self.engines.store(Arc::new(table));
        }
        self.archives.lock().await.retain(|_, entry| entry.engine_name != name);
        info!("📤 Deregistered process engine '{}'", name);
    }

    /// Reserve the archive name and install it on its target engine
    pub async fn install_archive(&self, archive: &ProcessArchive) -> Result<ArchiveHandle> {
        if archive.name.trim().is_empty() {
            return Err(PlatformError::Validation("Process archive name must not be empty".to_string()));
        }
        let controller = match archive.process_engine_name.as_deref() {
            Some(name) => self.engine(name).map_err(|_| {
                PlatformError::NotFound(format!(
                    "Process engine '{}' targeted by archive '{}' is not registered",
                    name, archive.name
                ))
            })?,
            None => self.default_engine().map_err(|_| {
                PlatformError::NotFound(format!(
                    "Archive '{}' targets the default process engine but none is registered",
                    archive.name
                ))
            })?,
        };
        let engine_name = controller.name().to_string();

        {
            let mut archives = self.archives.lock().await;
            if let Some(existing) = archives.get(&archive.name) {
                return Err(PlatformError::Conflict(format!(
                    "Process archive '{}' is already installed on process engine '{}'",
                    archive.name, existing.engine_name
                )));
            }
            archives.insert(
                archive.name.clone(),
                ArchiveEntry {
                    engine_name: engine_name.clone(),
                    installed: false,
                },
            );
        }

        match controller.install_archive(archive).await {
            Ok(deployment_id) => {
                if let Some(entry) = self.archives.lock().await.get_mut(&archive.name) {
                    entry.installed = true;
                }
                Ok(ArchiveHandle {
                    archive_name: archive.name.clone(),
                    process_engine_name: engine_name,
                    deployment_id,
                })
            }
            Err(e) => {
                self.archives.lock().await.remove(&archive.name);
                Err(PlatformError::deployment_caused_by(
                    format!("Could not install process archive '{}' on '{}'", archive.name, engine_name),
                    e,
                ))
            }
        }
    }

    /// Uninstall an archive and release its name
    pub async fn uninstall_archive(&self, name: &str) -> Result<()> {
        let entry = self
            .archives
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("No process archive named '{}'", name)))?;
        if !entry.installed {
            return Err(PlatformError::Conflict(format!(
                "Process archive '{}' is still being installed",
                name
            )));
        }

        match self.engine(&entry.engine_name) {
            Ok(controller) => controller.uninstall_archive(name).await?,
            Err(_) => warn!(
                "⚠️ Engine '{}' of archive '{}' is gone; dropping the registration",
                entry.engine_name, name
            ),
        }
        self.archives.lock().await.remove(name);
        Ok(())
    }

    /// Archives installed on an engine, as cached by its controller
    pub fn installed_archives(&self, engine_name: Option<&str>) -> Result<Arc<Vec<ProcessArchive>>> {
        let name = engine_name.ok_or_else(|| {
            PlatformError::Validation("An engine name is required to list installed archives".to_string())
        })?;
        Ok(self.engine(name)?.cached_archives())
    }

    /// Names of every reserved or installed archive
    pub async fn archive_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.archives.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
