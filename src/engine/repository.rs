/// Deployed definitions: persistence queries and the definition cache
///
/// Definition rows are written by the deployer. Parsed models are kept in a
/// cache keyed by definition id and re-parsed from the stored resource bytes
/// when the cache misses (e.g. after a restart).

use crate::engine::command::{Command, CommandContext, CommandExecutor};
use crate::engine::parser::{parse_resource, DefinitionKind, DefinitionModel};
use crate::engine::schema::Tables;
use crate::error::{PlatformError, Result};
use crate::runtime::clock::from_millis;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Stored deployment row
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRecord {
    /// Deployment id
    pub id: String,
    /// Deployment name
    pub name: String,
    /// Origin given at deploy time
    pub source: Option<String>,
    /// When the deployment was stored
    pub deploy_time: DateTime<Utc>,
}

/// Stored definition row
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionRecord {
    /// Definition id, `key:version:uuid`
    pub id: String,
    /// Model family
    pub kind: DefinitionKind,
    /// Key shared by all versions
    pub key: String,
    /// Display name
    pub name: Option<String>,
    /// Version per key and kind, starting at 1
    pub version: i64,
    /// Owning deployment
    pub deployment_id: String,
    /// Resource the definition was parsed from
    pub resource_name: String,
}

/// A definition together with its parsed model
#[derive(Debug, Clone, PartialEq)]
pub struct DeployedDefinition {
    /// Stored row
    pub record: DefinitionRecord,
    /// Parsed model
    pub model: DefinitionModel,
}

impl DeployedDefinition {
    /// Definition id
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Definition key
    pub fn key(&self) -> &str {
        &self.record.key
    }
}

/// Definition id → parsed definition
#[derive(Debug, Default)]
pub struct DefinitionCache {
    entries: RwLock<HashMap<String, Arc<DeployedDefinition>>>,
}

impl DefinitionCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached definition by id
    pub fn get(&self, id: &str) -> Option<Arc<DeployedDefinition>> {
        self.entries.read().get(id).cloned()
    }

    /// Cache a definition, replacing any previous entry
    pub fn put(&self, definition: DeployedDefinition) -> Arc<DeployedDefinition> {
        let definition = Arc::new(definition);
        self.entries
            .write()
            .insert(definition.record.id.clone(), Arc::clone(&definition));
        definition
    }

    /// Evict every definition of a deployment, returns how many
    pub fn remove_deployment(&self, deployment_id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, d| d.record.deployment_id != deployment_id);
        before - entries.len()
    }

    /// Number of cached definitions
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Evict everything
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

fn definition_from_row(row: &SqliteRow) -> Result<DefinitionRecord> {
    let kind: String = row.get("kind");
    Ok(DefinitionRecord {
        id: row.get("id"),
        kind: kind.parse()?,
        key: row.get("key"),
        name: row.get("name"),
        version: row.get("version"),
        deployment_id: row.get("deployment_id"),
        resource_name: row.get("resource_name"),
    })
}

fn deployment_from_row(row: &SqliteRow) -> DeploymentRecord {
    let deploy_time: i64 = row.get("deploy_time");
    DeploymentRecord {
        id: row.get("id"),
        name: row.get("name"),
        source: row.get("source"),
        deploy_time: from_millis(deploy_time).unwrap_or_default(),
    }
}

pub(crate) async fn find_definition(
    conn: &mut SqliteConnection,
    tables: &Tables,
    id: &str,
) -> Result<Option<DefinitionRecord>> {
    let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = ?", tables.definition()))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(definition_from_row).transpose()
}

pub(crate) async fn find_latest_definition_by_key(
    conn: &mut SqliteConnection,
    tables: &Tables,
    kind: DefinitionKind,
    key: &str,
) -> Result<Option<DefinitionRecord>> {
    let row = sqlx::query(&format!(
        "SELECT * FROM {} WHERE kind = ? AND key = ? ORDER BY version DESC LIMIT 1",
        tables.definition()
    ))
    .bind(kind.as_str())
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(definition_from_row).transpose()
}

pub(crate) async fn find_definitions_by_deployment(
    conn: &mut SqliteConnection,
    tables: &Tables,
    deployment_id: &str,
) -> Result<Vec<DefinitionRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT * FROM {} WHERE deployment_id = ? ORDER BY kind, key",
        tables.definition()
    ))
    .bind(deployment_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(definition_from_row).collect()
}

pub(crate) async fn find_latest_deployment_by_name(
    conn: &mut SqliteConnection,
    tables: &Tables,
    name: &str,
) -> Result<Option<DeploymentRecord>> {
    let row = sqlx::query(&format!(
        "SELECT * FROM {} WHERE name = ? ORDER BY deploy_time DESC, rowid DESC LIMIT 1",
        tables.deployment()
    ))
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(deployment_from_row))
}

/// Resource name → content hash of one deployment
pub(crate) async fn find_resource_hashes(
    conn: &mut SqliteConnection,
    tables: &Tables,
    deployment_id: &str,
) -> Result<HashMap<String, String>> {
    let rows = sqlx::query(&format!(
        "SELECT name, hash FROM {} WHERE deployment_id = ?",
        tables.resource()
    ))
    .bind(deployment_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<String, _>("name"), row.get::<String, _>("hash")))
        .collect())
}

async fn find_resource_bytes(
    conn: &mut SqliteConnection,
    tables: &Tables,
    deployment_id: &str,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let row = sqlx::query(&format!(
        "SELECT bytes FROM {} WHERE deployment_id = ? AND name = ?",
        tables.resource()
    ))
    .bind(deployment_id)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|row| row.get("bytes")))
}

struct FindDefinition<'a> {
    id: &'a str,
}

#[async_trait]
impl<'a> Command for FindDefinition<'a> {
    type Output = Option<DefinitionRecord>;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output> {
        let tables = ctx.tables().clone();
        find_definition(ctx.connection(), &tables, self.id).await
    }
}

struct FindLatestByKey<'a> {
    kind: DefinitionKind,
    key: &'a str,
}

#[async_trait]
impl<'a> Command for FindLatestByKey<'a> {
    type Output = Option<DefinitionRecord>;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output> {
        let tables = ctx.tables().clone();
        find_latest_definition_by_key(ctx.connection(), &tables, self.kind, self.key).await
    }
}

struct FindByDeployment<'a> {
    deployment_id: &'a str,
}

#[async_trait]
impl<'a> Command for FindByDeployment<'a> {
    type Output = Vec<DefinitionRecord>;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output> {
        let tables = ctx.tables().clone();
        find_definitions_by_deployment(ctx.connection(), &tables, self.deployment_id).await
    }
}

struct CountDeployments;

#[async_trait]
impl Command for CountDeployments {
    type Output = i64;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<i64> {
        let statement = format!("SELECT COUNT(*) AS total FROM {}", ctx.tables().deployment());
        let row = sqlx::query(&statement).fetch_one(ctx.connection()).await?;
        Ok(row.get("total"))
    }
}

/// Queries over deployed definitions
#[derive(Debug, Clone)]
pub struct RepositoryService {
    executor: Arc<CommandExecutor>,
    cache: Arc<DefinitionCache>,
}

impl RepositoryService {
    /// Repository over `executor` sharing `cache`
    pub fn new(executor: Arc<CommandExecutor>, cache: Arc<DefinitionCache>) -> Self {
        Self { executor, cache }
    }

    /// Deployed definition cache
    pub fn cache(&self) -> &Arc<DefinitionCache> {
        &self.cache
    }

    /// Transactional lookup of a definition row
    pub async fn definition_record(&self, id: &str) -> Result<Option<DefinitionRecord>> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(Some(cached.record.clone()));
        }
        self.executor.execute(&FindDefinition { id }).await
    }

    /// Highest version of `key` for `kind`
    pub async fn latest_definition(&self, kind: DefinitionKind, key: &str) -> Result<Option<DefinitionRecord>> {
        self.executor.execute(&FindLatestByKey { kind, key }).await
    }

    /// Definitions created by one deployment
    pub async fn definitions_by_deployment(&self, deployment_id: &str) -> Result<Vec<DefinitionRecord>> {
        self.executor.execute(&FindByDeployment { deployment_id }).await
    }

    /// Number of stored deployments
    pub async fn deployment_count(&self) -> Result<i64> {
        self.executor.execute(&CountDeployments).await
    }

    /// Parsed definition by id, loading it inside a running command on a
    /// cache miss
    pub async fn deployed_definition(
        &self,
        conn: &mut SqliteConnection,
        tables: &Tables,
        id: &str,
    ) -> Result<Arc<DeployedDefinition>> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(cached);
        }

        let record = find_definition(conn, tables, id)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("No definition with id '{}'", id)))?;
        let bytes = find_resource_bytes(conn, tables, &record.deployment_id, &record.resource_name)
            .await?
            .ok_or_else(|| {
                PlatformError::NotFound(format!(
                    "Resource '{}' of deployment {} is missing",
                    record.resource_name, record.deployment_id
                ))
            })?;

        let model = parse_resource(&record.resource_name, &bytes)?
            .into_iter()
            .find(|parsed| parsed.kind() == record.kind && parsed.key == record.key)
            .map(|parsed| parsed.model)
            .ok_or_else(|| {
                PlatformError::NotFound(format!(
                    "Resource '{}' no longer contains {} '{}'",
                    record.resource_name, record.kind, record.key
                ))
            })?;

        debug!("📦 Loaded {} definition {} into cache", record.kind, record.id);
        Ok(self.cache.put(DeployedDefinition { record, model }))
    }
}
