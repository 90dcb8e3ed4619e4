/// Lifecycle controller of one process engine
///
/// Owns the engine configuration, the running `ProcessEngine` and the two
/// installed-archive indices (by archive name and by definition key).
/// Start, stop, install and uninstall are serialized by one async mutex;
/// readers use copy-on-write snapshots and never wait for it.

use crate::config::{JobExecutorSettings, ProcessEngineConfig};
use crate::engine::application::ProcessApplicationManager;
use crate::engine::deployer::{DeploymentRequest, ResourceDeployer};
use crate::engine::repository::DefinitionCache;
use crate::engine::runtime::{EngineConfiguration, ProcessEngine, SchemaMode};
use crate::engine::schema::{connect, SchemaManager, Tables};
use crate::error::{PlatformError, Result};
use crate::platform::archive::{ArchiveContext, ProcessArchive};
use crate::platform::directory::RuntimeDirectory;
use crate::platform::extension::PlatformExtension;
use crate::platform::registry::ProcessEngineRegistry;
use crate::runtime::clock::{Clock, SystemClock};
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What a controller shares with the platform it runs in
#[derive(Debug, Clone)]
pub struct ControllerContext {
    /// Registry that started the controller
    pub registry: Weak<ProcessEngineRegistry>,
    /// Directory running engines are published in
    pub directory: Arc<RuntimeDirectory>,
    /// Lifecycle hooks in registration order
    pub extensions: Vec<Arc<dyn PlatformExtension>>,
    /// Clock handed to the engine
    pub clock: Arc<dyn Clock>,
}

impl Default for ControllerContext {
    fn default() -> Self {
        Self {
            registry: Weak::new(),
            directory: Arc::new(RuntimeDirectory::new()),
            extensions: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct JobExecutorProperties {
    activate: bool,
    settings: JobExecutorSettings,
}

#[derive(Debug, Default)]
struct ArchiveIndex {
    by_name: HashMap<String, Arc<ArchiveContext>>,
    /// definition key → archive name
    by_definition_key: HashMap<String, String>,
}

impl ArchiveIndex {
    fn insert(&mut self, context: Arc<ArchiveContext>) {
        for key in context.definition_keys() {
            self.by_definition_key.insert(key.clone(), context.name().to_string());
        }
        self.by_name.insert(context.name().to_string(), context);
    }

    fn remove(&mut self, name: &str) -> Option<Arc<ArchiveContext>> {
        let context = self.by_name.remove(name)?;
        self.by_definition_key.retain(|_, owner| owner != name);
        Some(context)
    }

    fn clear(&mut self) {
        self.by_name.clear();
        self.by_definition_key.clear();
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook<'a> {
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
    BeforeInstall(&'a ProcessArchive),
    AfterInstall(&'a ProcessArchive, Option<&'a str>),
    BeforeUninstall(&'a ProcessArchive),
    AfterUninstall(&'a ProcessArchive),
}

impl Hook<'_> {
    fn label(&self) -> &'static str {
        match self {
            Hook::BeforeStart => "before_engine_start",
            Hook::AfterStart => "after_engine_start",
            Hook::BeforeStop => "before_engine_stop",
            Hook::AfterStop => "after_engine_stop",
            Hook::BeforeInstall(_) => "before_archive_install",
            Hook::AfterInstall(..) => "after_archive_install",
            Hook::BeforeUninstall(_) => "before_archive_uninstall",
            Hook::AfterUninstall(_) => "after_archive_uninstall",
        }
    }

    fn is_before(&self) -> bool {
        matches!(
            self,
            Hook::BeforeStart | Hook::BeforeStop | Hook::BeforeInstall(_) | Hook::BeforeUninstall(_)
        )
    }

    /// Stop hooks bracket the start hooks
    fn reverse_order(&self) -> bool {
        matches!(self, Hook::BeforeStop | Hook::AfterStop)
    }
}

/// Lifecycle owner of one process engine and the archives installed on it
#[derive(Debug)]
pub struct ProcessEngineController {
    config: ProcessEngineConfig,
    context: ControllerContext,
    self_ref: Weak<ProcessEngineController>,
    lifecycle: Mutex<()>,
    active: AtomicBool,
    applications: Arc<ProcessApplicationManager>,
    definitions: Arc<DefinitionCache>,
    runtime: ArcSwapOption<ProcessEngine>,
    deployer: RwLock<Option<ResourceDeployer>>,
    index: RwLock<ArchiveIndex>,
    cached_archives: ArcSwap<Vec<ProcessArchive>>,
    job_executor: RwLock<JobExecutorProperties>,
}

impl ProcessEngineController {
    /// Controller for `config`, started separately
    pub fn new(config: ProcessEngineConfig, context: ControllerContext) -> Arc<Self> {
        let job_executor = JobExecutorProperties {
            activate: config.properties.activate_job_executor,
            settings: config.properties.job_executor,
        };
        Arc::new_cyclic(|self_ref| Self {
            config,
            context,
            self_ref: self_ref.clone(),
            lifecycle: Mutex::new(()),
            active: AtomicBool::new(false),
            applications: Arc::new(ProcessApplicationManager::new()),
            definitions: Arc::new(DefinitionCache::new()),
            runtime: ArcSwapOption::empty(),
            deployer: RwLock::new(None),
            index: RwLock::new(ArchiveIndex::default()),
            cached_archives: ArcSwap::new(Arc::new(Vec::new())),
            job_executor: RwLock::new(job_executor),
        })
    }

    /// Controller outside any registry
    pub fn standalone(config: ProcessEngineConfig) -> Arc<Self> {
        Self::new(config, ControllerContext::default())
    }

    /// Engine name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration the engine was started from
    pub fn config(&self) -> &ProcessEngineConfig {
        &self.config
    }

    /// Whether this is the platform default engine
    pub fn is_default(&self) -> bool {
        self.config.is_default
    }

    /// Whether the engine is running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Running engine, `Lifecycle` while inactive
    pub fn process_engine(&self) -> Result<Arc<ProcessEngine>> {
        self.runtime.load_full().ok_or_else(|| {
            PlatformError::lifecycle(format!("Process engine '{}' is not active", self.name()))
        })
    }

    /// Point-in-time list of installed archives, in install order
    pub fn cached_archives(&self) -> Arc<Vec<ProcessArchive>> {
        self.cached_archives.load_full()
    }

    /// Installed archives keyed by archive name
    pub fn installed_archives_by_name(&self) -> HashMap<String, Arc<ArchiveContext>> {
        self.index.read().by_name.clone()
    }

    /// Definition key to owning archive name
    pub fn installed_archives_by_definition_key(&self) -> HashMap<String, String> {
        self.index.read().by_definition_key.clone()
    }

    /// Build the engine and run the start hooks
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let name = self.name().to_string();
        if self.is_active() {
            return Err(PlatformError::lifecycle(format!("Process engine '{}' is already active", name)));
        }
        info!("🔄 Starting process engine '{}'", name);

        if let Err(e) = self.fire(Hook::BeforeStart).await {
            self.report_failure().await;
            return Err(PlatformError::lifecycle_caused_by(
                format!("Process engine '{}' failed to start", name),
                e,
            ));
        }

        let engine = match self.boot().await {
            Ok(engine) => engine,
            Err(e) => {
                error!("❌ Process engine '{}' failed to start: {}", name, e);
                self.report_failure().await;
                return Err(PlatformError::lifecycle_caused_by(
                    format!("Process engine '{}' failed to start", name),
                    e,
                ));
            }
        };

        self.runtime.store(Some(Arc::clone(&engine)));
        *self.deployer.write() = Some(engine.resource_deployer());
        self.active.store(true, Ordering::Release);

        if let (Some(registry), Some(this)) = (self.context.registry.upgrade(), self.self_ref.upgrade()) {
            if let Err(e) = registry.engine_started(this).await {
                self.release_runtime(&engine).await;
                return Err(PlatformError::lifecycle_caused_by(
                    format!("Process engine '{}' could not be registered", name),
                    e,
                ));
            }
        }

        info!("✅ Process engine '{}' started", name);
        let _ = self.fire(Hook::AfterStart).await;
        Ok(())
    }

    /// Steps between the before and after hooks of `start`
    async fn boot(&self) -> Result<Arc<ProcessEngine>> {
        self.config.validate()?;

        // leftovers of a crashed run
        self.applications.clear();
        self.definitions.clear();

        let properties = &self.config.properties;
        let pool = connect(&self.config.datasource).await?;
        if properties.auto_schema_update {
            let tables = Tables::new(properties.table_prefix.as_deref());
            let version = SchemaManager::new(pool.clone(), tables).update().await?;
            debug!("🗄️ Schema of '{}' at version {}", self.name(), version);
        }

        let job_executor = *self.job_executor.read();
        let mut configuration = EngineConfiguration::from_config(&self.config)
            .with_schema_mode(SchemaMode::Managed)
            .with_pool(pool)
            .with_clock(Arc::clone(&self.context.clock))
            .with_applications(Arc::clone(&self.applications))
            .with_definition_cache(Arc::clone(&self.definitions));
        configuration.activate_job_executor = job_executor.activate;
        configuration.job_executor = job_executor.settings;
        info!("📋 Process engine configuration\n{}", configuration.describe());

        let engine = ProcessEngine::build(configuration).await?;
        if let Err(e) = self.tune_job_executor(&engine, job_executor).await {
            if let Err(close) = engine.close().await {
                warn!("⚠️ Could not close process engine '{}': {}", self.name(), close);
            }
            return Err(e);
        }
        self.context.directory.register(Arc::clone(&engine));
        Ok(engine)
    }

    async fn tune_job_executor(&self, engine: &ProcessEngine, properties: JobExecutorProperties) -> Result<()> {
        let job_executor = engine.job_executor();
        job_executor.set_max_jobs_per_acquisition(properties.settings.max_jobs_per_acquisition);
        job_executor.set_lock_time(properties.settings.lock_time_ms)?;
        job_executor.set_wait_time(properties.settings.wait_time_ms).await?;
        if properties.activate {
            job_executor.start().await?;
        }
        Ok(())
    }

    async fn report_failure(&self) {
        if let Some(registry) = self.context.registry.upgrade() {
            registry.engine_failed(self.name()).await;
        }
    }

    async fn release_runtime(&self, engine: &ProcessEngine) {
        self.active.store(false, Ordering::Release);
        self.context.directory.deregister(self.name());
        *self.deployer.write() = None;
        self.runtime.store(None);
        if let Err(e) = engine.close().await {
            error!("❌ Could not close process engine '{}': {}", self.name(), e);
        }
    }

    /// Uninstall everything and release the engine
    ///
    /// Failing before-stop hooks skip the remaining ones but never abort the
    /// stop.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let name = self.name().to_string();
        if !self.is_active() {
            warn!("⚠️ Process engine '{}' is not active; nothing to stop", name);
            return Ok(());
        }
        info!("🔄 Stopping process engine '{}'", name);

        if let Err(e) = self.fire(Hook::BeforeStop).await {
            error!("❌ {}; stopping '{}' anyway", e, name);
        }

        let engine = self.runtime.load_full();
        self.context.directory.deregister(&name);
        if let Some(engine) = &engine {
            if engine.job_executor().is_active() {
                if let Err(e) = engine.job_executor().shutdown().await {
                    error!("❌ Could not stop job executor of '{}': {}", name, e);
                }
            }
        }

        let installed: Vec<Arc<ArchiveContext>> = self.index.read().by_name.values().cloned().collect();
        for context in installed {
            if let Err(e) = self.uninstall_context(&context, false).await {
                error!("❌ Could not uninstall archive '{}': {}", context.name(), e);
            }
        }

        if let Some(registry) = self.context.registry.upgrade() {
            registry.engine_stopped(&name).await;
        }

        self.index.write().clear();
        self.cached_archives.store(Arc::new(Vec::new()));
        if let Some(engine) = engine {
            self.release_runtime(&engine).await;
        } else {
            self.active.store(false, Ordering::Release);
        }

        info!("🛑 Process engine '{}' stopped", name);
        let _ = self.fire(Hook::AfterStop).await;
        Ok(())
    }

    /// Deploy an archive; returns the deployment id, if anything was deployable
    pub async fn install_archive(&self, archive: &ProcessArchive) -> Result<Option<String>> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_active() {
            return Err(PlatformError::lifecycle(format!(
                "Process engine '{}' is not active; cannot install archive '{}'",
                self.name(),
                archive.name
            )));
        }
        if self.index.read().by_name.contains_key(&archive.name) {
            return Err(PlatformError::Conflict(format!(
                "Process archive '{}' is already installed on process engine '{}'",
                archive.name,
                self.name()
            )));
        }

        self.fire(Hook::BeforeInstall(archive)).await?;

        let deployer = self.deployer.read().clone().ok_or_else(|| {
            PlatformError::lifecycle(format!("Process engine '{}' has no resource deployer", self.name()))
        })?;
        let request = DeploymentRequest {
            name: archive.name.clone(),
            source: Some("process archive".to_string()),
            resources: archive.resources.clone(),
            duplicate_filtering: archive.properties.duplicate_filtering,
            process_application: archive.process_application.clone(),
        };
        let outcome = deployer.deploy(&request).await?;

        let context = Arc::new(ArchiveContext::new(
            archive.clone(),
            outcome.deployment_id.clone(),
            outcome.definition_keys(),
        ));
        self.index.write().insert(context);

        let mut archives = (**self.cached_archives.load()).clone();
        archives.push(archive.clone());
        self.cached_archives.store(Arc::new(archives));

        info!(
            "📦 Installed archive '{}' on '{}' (deployment {})",
            archive.name,
            self.name(),
            outcome.deployment_id.as_deref().unwrap_or("-")
        );
        let _ = self.fire(Hook::AfterInstall(archive, outcome.deployment_id.as_deref())).await;
        Ok(outcome.deployment_id)
    }

    /// Undeploy an archive; a no-op while inactive
    pub async fn uninstall_archive(&self, name: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_active() {
            info!("⏭️ Process engine '{}' is not active; skipping uninstall of '{}'", self.name(), name);
            return Ok(());
        }
        let context = self.index.read().by_name.get(name).cloned().ok_or_else(|| {
            PlatformError::NotFound(format!(
                "No process archive '{}' installed on process engine '{}'",
                name,
                self.name()
            ))
        })?;
        self.uninstall_context(&context, true).await
    }

    /// Undeploy failures are logged; the archive always leaves both indices
    async fn uninstall_context(&self, context: &ArchiveContext, vetoable: bool) -> Result<()> {
        let archive = context.archive();
        if let Err(e) = self.fire(Hook::BeforeUninstall(archive)).await {
            if vetoable {
                return Err(e);
            }
            error!("❌ {}", e);
        }

        context.mark_undeploying();
        let deployer = self.deployer.read().clone();
        if let (Some(deployment_id), Some(deployer)) = (context.deployment_id(), deployer) {
            if let Err(e) = deployer
                .undeploy(deployment_id, archive.properties.delete_upon_undeploy)
                .await
            {
                error!("❌ Failed to undeploy archive '{}': {}", archive.name, e);
            }
        }

        context.mark_removed();
        self.index.write().remove(&archive.name);
        let mut archives = (**self.cached_archives.load()).clone();
        archives.retain(|a| a.name != archive.name);
        self.cached_archives.store(Arc::new(archives));

        info!("🗑️ Uninstalled archive '{}' from '{}'", archive.name, self.name());
        let _ = self.fire(Hook::AfterUninstall(archive)).await;
        Ok(())
    }

    /// Archive that deployed `key`
    pub fn archive_by_definition_key(&self, key: &str) -> Result<Arc<ArchiveContext>> {
        let index = self.index.read();
        index
            .by_definition_key
            .get(key)
            .and_then(|name| index.by_name.get(name))
            .cloned()
            .ok_or_else(|| {
                PlatformError::NotFound(format!(
                    "No process archive on '{}' deploys definition key '{}'",
                    self.name(),
                    key
                ))
            })
    }

    /// Resolve the definition's key (cache, then a query) and look it up
    pub async fn archive_by_definition_id(&self, id: &str) -> Result<Arc<ArchiveContext>> {
        let engine = self.process_engine()?;
        let record = engine
            .repository()
            .definition_record(id)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("No definition with id '{}'", id)))?;
        self.archive_by_definition_key(&record.key)
    }

    /// Start or stop the job executor
    pub async fn set_activate_job_executor(&self, activate: bool) -> Result<()> {
        self.job_executor.write().activate = activate;
        if let Some(engine) = self.runtime.load_full() {
            if activate {
                engine.job_executor().start().await?;
            } else {
                engine.job_executor().shutdown().await?;
            }
        }
        info!("⚙️ Job executor of '{}' {}", self.name(), if activate { "activated" } else { "deactivated" });
        Ok(())
    }

    /// Cap jobs locked per acquisition cycle
    pub fn set_max_jobs_per_acquisition(&self, max_jobs: u32) {
        self.job_executor.write().settings.max_jobs_per_acquisition = max_jobs;
        if let Some(engine) = self.runtime.load_full() {
            engine.job_executor().set_max_jobs_per_acquisition(max_jobs);
        }
        info!("⚙️ '{}': max jobs per acquisition = {}", self.name(), max_jobs);
    }

    /// New acquisition poll interval
    pub async fn set_wait_time(&self, wait_time_ms: u64) -> Result<()> {
        self.job_executor.write().settings.wait_time_ms = wait_time_ms;
        if let Some(engine) = self.runtime.load_full() {
            engine.job_executor().set_wait_time(wait_time_ms).await?;
        }
        info!("⚙️ '{}': job acquisition wait time = {}ms", self.name(), wait_time_ms);
        Ok(())
    }

    /// New job lock time, rejected above `MAX_LOCK_TIME_MS`
    pub fn set_lock_time(&self, lock_time_ms: u64) -> Result<()> {
        JobExecutorSettings::check_lock_time(lock_time_ms)?;
        self.job_executor.write().settings.lock_time_ms = lock_time_ms;
        if let Some(engine) = self.runtime.load_full() {
            engine.job_executor().set_lock_time(lock_time_ms)?;
        }
        info!("⚙️ '{}': job lock time = {}ms", self.name(), lock_time_ms);
        Ok(())
    }

    /// Run the hooks for one lifecycle point
    ///
    /// Before hooks stop at the first failure and return it; after hooks all
    /// run and failures are only logged.
    async fn fire(&self, hook: Hook<'_>) -> Result<()> {
        let extensions: Vec<&Arc<dyn PlatformExtension>> = if hook.reverse_order() {
            self.context.extensions.iter().rev().collect()
        } else {
            self.context.extensions.iter().collect()
        };

        for extension in extensions {
            if let Err(e) = self.call(extension.as_ref(), hook).await {
                let err = PlatformError::Extension {
                    extension: extension.name().to_string(),
                    hook: hook.label(),
                    cause: format!("{:#}", e),
                };
                if hook.is_before() {
                    return Err(err);
                }
                error!("❌ {}", err);
            }
        }
        Ok(())
    }

    async fn call(&self, extension: &dyn PlatformExtension, hook: Hook<'_>) -> anyhow::Result<()> {
        match hook {
            Hook::BeforeStart => extension.before_engine_start(self).await,
            Hook::AfterStart => extension.after_engine_start(self).await,
            Hook::BeforeStop => extension.before_engine_stop(self).await,
            Hook::AfterStop => extension.after_engine_stop(self).await,
            Hook::BeforeInstall(archive) => extension.before_archive_install(self, archive).await,
            Hook::AfterInstall(archive, deployment_id) => {
                extension.after_archive_install(self, archive, deployment_id).await
            }
            Hook::BeforeUninstall(archive) => extension.before_archive_uninstall(self, archive).await,
            Hook::AfterUninstall(archive) => extension.after_archive_uninstall(self, archive).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_PROCESS: &str = r#"<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="order-process" isExecutable="true">
    <startEvent id="start"/>
    <sequenceFlow id="f1" sourceRef="start" targetRef="end"/>
    <endEvent id="end"/>
  </process>
</definitions>"#;

    fn orders() -> ProcessArchive {
        ProcessArchive::new("orders").with_resource("order.bpmn", ORDER_PROCESS)
    }

    #[tokio::test]
    async fn test_uninstall_on_never_started_controller_is_noop() {
        let controller = ProcessEngineController::standalone(ProcessEngineConfig::in_memory("idle"));
        controller.uninstall_archive("orders").await.unwrap();
        assert!(!controller.is_active());
        assert!(controller.cached_archives().is_empty());
        assert!(controller.process_engine().unwrap_err().is_lifecycle());
    }

    #[tokio::test]
    async fn test_install_requires_active_controller() {
        let controller = ProcessEngineController::standalone(ProcessEngineConfig::in_memory("idle"));
        let err = controller.install_archive(&orders()).await.unwrap_err();
        assert!(err.is_lifecycle());
    }

    #[tokio::test]
    async fn test_install_uninstall_round_trip() {
        let controller = ProcessEngineController::standalone(ProcessEngineConfig::in_memory("engine"));
        controller.start().await.unwrap();

        let deployment_id = controller.install_archive(&orders()).await.unwrap();
        assert!(deployment_id.is_some());
        assert_eq!(controller.archive_by_definition_key("order-process").unwrap().name(), "orders");
        assert_eq!(controller.cached_archives().len(), 1);

        let definition = controller
            .process_engine()
            .unwrap()
            .repository()
            .definitions_by_deployment(deployment_id.as_deref().unwrap())
            .await
            .unwrap()
            .remove(0);
        assert_eq!(
            controller.archive_by_definition_id(&definition.id).await.unwrap().name(),
            "orders"
        );

        let err = controller.install_archive(&orders()).await.unwrap_err();
        assert!(err.is_conflict());

        controller.uninstall_archive("orders").await.unwrap();
        assert!(controller.installed_archives_by_name().is_empty());
        assert!(controller.installed_archives_by_definition_key().is_empty());
        assert!(controller.archive_by_definition_key("order-process").unwrap_err().is_not_found());

        controller.stop().await.unwrap();
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let controller = ProcessEngineController::standalone(ProcessEngineConfig::in_memory("twice"));
        controller.start().await.unwrap();
        assert!(controller.start().await.unwrap_err().is_lifecycle());
        assert!(controller.is_active());
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_archive_without_models_has_no_deployment() {
        let controller = ProcessEngineController::standalone(ProcessEngineConfig::in_memory("engine"));
        controller.start().await.unwrap();

        let archive = ProcessArchive::new("docs").with_resource("readme.txt", "nothing to deploy");
        assert_eq!(controller.install_archive(&archive).await.unwrap(), None);
        assert_eq!(controller.installed_archives_by_name().len(), 1);

        controller.stop().await.unwrap();
        assert!(controller.cached_archives().is_empty());
    }
}
