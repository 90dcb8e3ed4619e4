/// Resource deployer
///
/// Turns the resources of a process archive into a persisted deployment with
/// versioned definition rows. Resources without a recognised model suffix are
/// ignored; an archive without any deployable resource produces no deployment.

use crate::engine::application::{ProcessApplicationManager, ProcessApplicationReference};
use crate::engine::command::{Command, CommandContext, CommandExecutor};
use crate::engine::parser::{parse_resource, DefinitionKind, ParsedDefinition, ResourceKind};
use crate::engine::repository::{
    find_definitions_by_deployment, find_latest_deployment_by_name, find_resource_hashes,
    DefinitionCache, DefinitionRecord, DeployedDefinition,
};
use crate::error::Result;
use crate::runtime::clock::to_millis;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What to deploy
#[derive(Debug, Clone, Default)]
pub struct DeploymentRequest {
    /// Deployment name, also the duplicate filtering key
    pub name: String,
    /// Free-form origin of the deployment
    pub source: Option<String>,
    /// Resource bytes by file name
    pub resources: BTreeMap<String, Vec<u8>>,
    /// Reuse the latest deployment with this name when no resource changed
    pub duplicate_filtering: bool,
    /// Application the deployment is bound to
    pub process_application: Option<ProcessApplicationReference>,
}

/// Result of one deployment request
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentOutcome {
    /// `None` when no resource held a model
    pub deployment_id: Option<String>,
    /// Definitions created or reused
    pub definitions: Vec<DefinitionRecord>,
    /// True when duplicate filtering returned an existing deployment
    pub reused: bool,
}

impl DeploymentOutcome {
    fn empty() -> Self {
        Self {
            deployment_id: None,
            definitions: Vec::new(),
            reused: false,
        }
    }

    /// Keys of deployed process and case definitions
    pub fn definition_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .definitions
            .iter()
            .filter(|d| matches!(d.kind, DefinitionKind::Process | DefinitionKind::Case))
            .map(|d| d.key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Hex SHA-256 of a resource
pub fn resource_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

struct ParsedResource {
    name: String,
    bytes: Vec<u8>,
    hash: String,
    definitions: Vec<ParsedDefinition>,
}

struct DeployCommand<'a> {
    name: &'a str,
    source: Option<&'a str>,
    duplicate_filtering: bool,
    resources: &'a [ParsedResource],
}

#[async_trait]
impl<'a> Command for DeployCommand<'a> {
    type Output = (DeploymentOutcome, Vec<DeployedDefinition>);

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output> {
        let tables = ctx.tables().clone();

        if self.duplicate_filtering {
            if let Some(previous) = find_latest_deployment_by_name(ctx.connection(), &tables, self.name).await? {
                let hashes = find_resource_hashes(ctx.connection(), &tables, &previous.id).await?;
                let unchanged = hashes.len() == self.resources.len()
                    && self
                        .resources
                        .iter()
                        .all(|r| hashes.get(&r.name) == Some(&r.hash));
                if unchanged {
                    let definitions = find_definitions_by_deployment(ctx.connection(), &tables, &previous.id).await?;
                    info!("♻️ Resources of '{}' unchanged, reusing deployment {}", self.name, previous.id);
                    let outcome = DeploymentOutcome {
                        deployment_id: Some(previous.id),
                        definitions,
                        reused: true,
                    };
                    return Ok((outcome, Vec::new()));
                }
            }
        }

        let deployment_id = Uuid::new_v4().to_string();
        let deploy_time = to_millis(ctx.clock().now());
        sqlx::query(&format!(
            "INSERT INTO {} (id, name, source, deploy_time) VALUES (?, ?, ?, ?)",
            tables.deployment()
        ))
        .bind(&deployment_id)
        .bind(self.name)
        .bind(self.source)
        .bind(deploy_time)
        .execute(ctx.connection())
        .await?;

        let mut records = Vec::new();
        let mut deployed = Vec::new();
        for resource in self.resources {
            sqlx::query(&format!(
                "INSERT INTO {} (id, deployment_id, name, bytes, hash) VALUES (?, ?, ?, ?, ?)",
                tables.resource()
            ))
            .bind(Uuid::new_v4().to_string())
            .bind(&deployment_id)
            .bind(&resource.name)
            .bind(&resource.bytes)
            .bind(&resource.hash)
            .execute(ctx.connection())
            .await?;

            for parsed in &resource.definitions {
                let kind = parsed.kind();
                let row = sqlx::query(&format!(
                    "SELECT COALESCE(MAX(version), 0) AS latest FROM {} WHERE kind = ? AND key = ?",
                    tables.definition()
                ))
                .bind(kind.as_str())
                .bind(&parsed.key)
                .fetch_one(ctx.connection())
                .await?;
                let version = row.get::<i64, _>("latest") + 1;

                let record = DefinitionRecord {
                    id: format!("{}:{}:{}", parsed.key, version, Uuid::new_v4()),
                    kind,
                    key: parsed.key.clone(),
                    name: parsed.name.clone(),
                    version,
                    deployment_id: deployment_id.clone(),
                    resource_name: resource.name.clone(),
                };
                sqlx::query(&format!(
                    "INSERT INTO {} (id, kind, key, name, version, deployment_id, resource_name)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    tables.definition()
                ))
                .bind(&record.id)
                .bind(kind.as_str())
                .bind(&record.key)
                .bind(&record.name)
                .bind(record.version)
                .bind(&record.deployment_id)
                .bind(&record.resource_name)
                .execute(ctx.connection())
                .await?;

                debug!("📄 Registered {} '{}' version {}", kind, record.key, version);
                deployed.push(DeployedDefinition {
                    record: record.clone(),
                    model: parsed.model.clone(),
                });
                records.push(record);
            }
        }

        let outcome = DeploymentOutcome {
            deployment_id: Some(deployment_id),
            definitions: records,
            reused: false,
        };
        Ok((outcome, deployed))
    }
}

struct DeleteDeployment<'a> {
    deployment_id: &'a str,
}

#[async_trait]
impl<'a> Command for DeleteDeployment<'a> {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let tables = ctx.tables().clone();
        let statements = [
            format!("DELETE FROM {} WHERE deployment_id = ?", tables.job()),
            format!("DELETE FROM {} WHERE deployment_id = ?", tables.definition()),
            format!("DELETE FROM {} WHERE deployment_id = ?", tables.resource()),
            format!("DELETE FROM {} WHERE id = ?", tables.deployment()),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .bind(self.deployment_id)
                .execute(ctx.connection())
                .await?;
        }
        Ok(())
    }
}

/// Deploys and undeploys resources through the engine's command executor
#[derive(Debug, Clone)]
pub struct ResourceDeployer {
    executor: Arc<CommandExecutor>,
    cache: Arc<DefinitionCache>,
    applications: Arc<ProcessApplicationManager>,
}

impl ResourceDeployer {
    /// Deployer writing through `executor` into `repository`
    pub fn new(
        executor: Arc<CommandExecutor>,
        cache: Arc<DefinitionCache>,
        applications: Arc<ProcessApplicationManager>,
    ) -> Self {
        Self {
            executor,
            cache,
            applications,
        }
    }

    /// Parse, version and persist the model resources of `request`
    pub async fn deploy(&self, request: &DeploymentRequest) -> Result<DeploymentOutcome> {
        let mut resources = Vec::new();
        for (name, bytes) in &request.resources {
            if ResourceKind::for_resource(name).is_none() {
                debug!("⏭️ Skipping non-model resource '{}'", name);
                continue;
            }
            resources.push(ParsedResource {
                name: name.clone(),
                hash: resource_hash(bytes),
                definitions: parse_resource(name, bytes)?,
                bytes: bytes.clone(),
            });
        }

        if resources.is_empty() {
            info!("📭 '{}' contains no deployable resources", request.name);
            return Ok(DeploymentOutcome::empty());
        }

        let command = DeployCommand {
            name: &request.name,
            source: request.source.as_deref(),
            duplicate_filtering: request.duplicate_filtering,
            resources: &resources,
        };
        let (outcome, deployed) = self.executor.execute(&command).await?;

        for definition in deployed {
            self.cache.put(definition);
        }
        if let (Some(deployment_id), Some(reference)) = (&outcome.deployment_id, &request.process_application) {
            self.applications.register_deployment(deployment_id, reference.clone());
        }

        info!(
            "🚀 Deployed '{}' as {} with {} definitions",
            request.name,
            outcome.deployment_id.as_deref().unwrap_or("-"),
            outcome.definitions.len()
        );
        Ok(outcome)
    }

    /// Unbind the deployment; with `cascade` also delete it and its
    /// definitions, resources and jobs
    pub async fn undeploy(&self, deployment_id: &str, cascade: bool) -> Result<()> {
        self.applications.unregister_deployment(deployment_id);
        if !cascade {
            debug!("🔓 Unbound deployment {}", deployment_id);
            return Ok(());
        }

        self.executor.execute(&DeleteDeployment { deployment_id }).await?;
        let evicted = self.cache.remove_deployment(deployment_id);
        info!("🗑️ Deleted deployment {} ({} cached definitions evicted)", deployment_id, evicted);
        Ok(())
    }

    /// Number of recognised resources per kind, for logging
    pub fn summarize(resources: &BTreeMap<String, Vec<u8>>) -> HashMap<&'static str, usize> {
        let mut summary = HashMap::new();
        for name in resources.keys() {
            let label = match ResourceKind::for_resource(name) {
                Some(ResourceKind::Bpmn) => "bpmn",
                Some(ResourceKind::Cmmn) => "cmmn",
                Some(ResourceKind::Dmn) => "dmn",
                None => "other",
            };
            *summary.entry(label).or_insert(0) += 1;
        }
        summary
    }
}
