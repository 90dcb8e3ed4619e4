/// Concrete process engine: services wired around one datastore
///
/// `EngineConfiguration` is what the lifecycle controller hands over after it
/// dealt with the schema itself; `ProcessEngine::build` connects (or reuses) the
/// pool and assembles the command executor, repository, runtime, history and
/// job executor services.

use crate::config::{HistoryLevel, JobExecutorSettings, ProcessEngineConfig};
use crate::engine::application::ProcessApplicationManager;
use crate::engine::command::CommandExecutor;
use crate::engine::deployer::ResourceDeployer;
use crate::engine::job_executor::JobExecutor;
use crate::engine::repository::{DefinitionCache, RepositoryService};
use crate::engine::schema::{connect, SchemaManager, Tables};
use crate::error::Result;
use crate::expression::{ElValue, ExpressionManager, FunctionTable, ScriptEvaluator};
use crate::history::{DbHistoryEventHandler, DefaultHistoryEventProducer, HistoryEventHandler, HistoryService};
use crate::runtime::clock::{Clock, SystemClock};
use crate::runtime::service::RuntimeService;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What the engine does with the schema while it is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaMode {
    /// Someone else manages the schema; only verify the version
    #[default]
    Managed,
    /// Apply pending schema deltas
    Update,
}

/// Everything needed to assemble a process engine
#[derive(Clone)]
pub struct EngineConfiguration {
    /// Engine name
    pub name: String,
    /// sqlx SQLite URL
    pub datasource: String,
    /// Schema handling on build
    pub schema_mode: SchemaMode,
    /// Optional table name prefix
    pub table_prefix: Option<String>,
    /// Whether identity lookups are enabled
    pub identity_used: bool,
    /// History level
    pub history: HistoryLevel,
    /// Start the job executor after build
    pub activate_job_executor: bool,
    /// Job acquisition tuning
    pub job_executor: JobExecutorSettings,
    clock: Arc<dyn Clock>,
    beans: HashMap<String, ElValue>,
    history_handler: Option<Arc<dyn HistoryEventHandler>>,
    pool: Option<SqlitePool>,
    applications: Option<Arc<ProcessApplicationManager>>,
    definition_cache: Option<Arc<DefinitionCache>>,
}

impl fmt::Debug for EngineConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfiguration")
            .field("name", &self.name)
            .field("datasource", &self.datasource)
            .field("schema_mode", &self.schema_mode)
            .field("table_prefix", &self.table_prefix)
            .field("history", &self.history)
            .field("activate_job_executor", &self.activate_job_executor)
            .finish_non_exhaustive()
    }
}

impl EngineConfiguration {
    /// Configuration derived from a descriptor entry
    pub fn from_config(config: &ProcessEngineConfig) -> Self {
        let properties = &config.properties;
        Self {
            name: config.name.clone(),
            datasource: config.datasource.clone(),
            schema_mode: if properties.auto_schema_update {
                SchemaMode::Update
            } else {
                SchemaMode::Managed
            },
            table_prefix: properties.table_prefix.clone(),
            identity_used: properties.identity_used,
            history: properties.history,
            activate_job_executor: properties.activate_job_executor,
            job_executor: properties.job_executor,
            clock: Arc::new(SystemClock),
            beans: HashMap::new(),
            history_handler: None,
            pool: None,
            applications: None,
            definition_cache: None,
        }
    }

    /// Schema handling on build
    pub fn with_schema_mode(mut self, mode: SchemaMode) -> Self {
        self.schema_mode = mode;
        self
    }

    /// Clock for timestamps and due dates
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Beans visible to expressions
    pub fn with_beans(mut self, beans: HashMap<String, ElValue>) -> Self {
        self.beans = beans;
        self
    }

    /// Replace the database history handler
    pub fn with_history_handler(mut self, handler: Arc<dyn HistoryEventHandler>) -> Self {
        self.history_handler = Some(handler);
        self
    }

    /// Reuse an already connected pool instead of opening `datasource`
    pub fn with_pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Shared process application registrations
    pub fn with_applications(mut self, applications: Arc<ProcessApplicationManager>) -> Self {
        self.applications = Some(applications);
        self
    }

    /// Shared definition cache
    pub fn with_definition_cache(mut self, cache: Arc<DefinitionCache>) -> Self {
        self.definition_cache = Some(cache);
        self
    }

    /// One block describing the engine, logged at start
    pub fn describe(&self) -> String {
        format!(
            "engine: {}\n  datasource: {}\n  schema mode: {:?}\n  table prefix: {}\n  identity used: {}\n  history: {}\n  job executor: {} (max jobs {}, wait {}ms, lock {}ms)",
            self.name,
            self.datasource,
            self.schema_mode,
            self.table_prefix.as_deref().unwrap_or("-"),
            self.identity_used,
            self.history,
            if self.activate_job_executor { "active" } else { "inactive" },
            self.job_executor.max_jobs_per_acquisition,
            self.job_executor.wait_time_ms,
            self.job_executor.lock_time_ms,
        )
    }
}

/// Runtime handle of one process engine
#[derive(Debug)]
pub struct ProcessEngine {
    name: String,
    identity_used: bool,
    executor: Arc<CommandExecutor>,
    applications: Arc<ProcessApplicationManager>,
    definitions: Arc<DefinitionCache>,
    repository: RepositoryService,
    runtime: RuntimeService,
    history: HistoryService,
    job_executor: JobExecutor,
}

impl ProcessEngine {
    /// Connect, prepare the schema and wire the services
    pub async fn build(config: EngineConfiguration) -> Result<Arc<Self>> {
        let pool = match config.pool.clone() {
            Some(pool) => pool,
            None => connect(&config.datasource).await?,
        };
        let tables = Tables::new(config.table_prefix.as_deref());

        let schema = SchemaManager::new(pool.clone(), tables.clone());
        match config.schema_mode {
            SchemaMode::Update => {
                schema.update().await?;
            }
            SchemaMode::Managed => schema.verify().await?,
        }

        let clock = Arc::clone(&config.clock);
        let producer = Arc::new(DefaultHistoryEventProducer::new(Arc::clone(&clock)));
        let handler = config
            .history_handler
            .clone()
            .unwrap_or_else(|| Arc::new(DbHistoryEventHandler::new(pool.clone(), tables.clone())));
        let executor = Arc::new(CommandExecutor::new(
            pool.clone(),
            tables.clone(),
            config.history,
            producer,
            handler,
            Arc::clone(&clock),
        ));

        let applications = config
            .applications
            .clone()
            .unwrap_or_else(|| Arc::new(ProcessApplicationManager::new()));
        let definitions = config
            .definition_cache
            .clone()
            .unwrap_or_else(|| Arc::new(DefinitionCache::new()));
        let repository = RepositoryService::new(Arc::clone(&executor), Arc::clone(&definitions));

        let expressions = Arc::new(
            ExpressionManager::new(FunctionTable::standard(Arc::clone(&clock))).with_beans(config.beans.clone()),
        );
        let scripts = Arc::new(ScriptEvaluator::new(Arc::clone(&clock)));
        let runtime = RuntimeService::new(
            Arc::clone(&executor),
            repository.clone(),
            expressions,
            scripts,
            Arc::clone(&applications),
        );
        let job_executor = JobExecutor::new(Arc::clone(&executor), runtime.clone(), config.job_executor);

        info!("⚙️ Process engine '{}' built", config.name);
        debug!("{}", config.describe());

        Ok(Arc::new(Self {
            name: config.name,
            identity_used: config.identity_used,
            history: HistoryService::new(pool, tables),
            executor,
            applications,
            definitions,
            repository,
            runtime,
            job_executor,
        }))
    }

    /// Engine name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether identity lookups are enabled
    pub fn identity_used(&self) -> bool {
        self.identity_used
    }

    /// Transactional command executor
    pub fn command_executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    /// Configured history level
    pub fn history_level(&self) -> HistoryLevel {
        self.executor.history_level()
    }

    /// Process application registrations
    pub fn process_applications(&self) -> &Arc<ProcessApplicationManager> {
        &self.applications
    }

    /// Deployed definition cache
    pub fn definition_cache(&self) -> &Arc<DefinitionCache> {
        &self.definitions
    }

    /// Deployment and definition queries
    pub fn repository(&self) -> &RepositoryService {
        &self.repository
    }

    /// Process instances, tasks and variables
    pub fn runtime(&self) -> &RuntimeService {
        &self.runtime
    }

    /// Persisted history queries
    pub fn history(&self) -> &HistoryService {
        &self.history
    }

    /// Asynchronous job executor
    pub fn job_executor(&self) -> &JobExecutor {
        &self.job_executor
    }

    /// Deployer bound to this engine's command executor
    pub fn resource_deployer(&self) -> ResourceDeployer {
        ResourceDeployer::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.definitions),
            Arc::clone(&self.applications),
        )
    }

    /// Stop the job executor and close the pool
    pub async fn close(&self) -> Result<()> {
        if self.job_executor.is_active() {
            self.job_executor.shutdown().await?;
        }
        self.runtime.clear();
        self.executor.pool().close().await;
        info!("🛑 Process engine '{}' closed", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_managed_mode_rejects_missing_schema() {
        let mut config = ProcessEngineConfig::in_memory("unmanaged");
        config.properties.auto_schema_update = false;
        let err = ProcessEngine::build(EngineConfiguration::from_config(&config))
            .await
            .unwrap_err();
        assert!(err.is_lifecycle());
    }

    #[tokio::test]
    async fn test_update_mode_builds_engine() {
        let config = ProcessEngineConfig::in_memory("engine");
        let configuration = EngineConfiguration::from_config(&config);
        assert_eq!(configuration.schema_mode, SchemaMode::Update);
        assert!(configuration.describe().contains("history: audit"));

        let engine = ProcessEngine::build(configuration).await.unwrap();
        assert_eq!(engine.name(), "engine");
        assert_eq!(engine.repository().deployment_count().await.unwrap(), 0);
        engine.close().await.unwrap();
    }
}
