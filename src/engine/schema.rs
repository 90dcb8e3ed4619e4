/// Database connection and versioned schema management
///
/// The schema is applied as numbered deltas; the applied version lives in
/// the `{prefix}property` table under `schema.version`.

use crate::error::{PlatformError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

pub const SCHEMA_VERSION: i64 = 3;
const VERSION_PROPERTY: &str = "schema.version";

/// Table names with the engine's prefix applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tables {
    prefix: String,
}

impl Tables {
    /// Table names for an optional prefix
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix.unwrap_or_default().to_string(),
        }
    }

    /// Configured prefix, empty if none
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn name(&self, base: &str) -> String {
        format!("{}{}", self.prefix, base)
    }

    /// Engine property table
    pub fn property(&self) -> String {
        self.name("property")
    }

    /// Deployment table
    pub fn deployment(&self) -> String {
        self.name("deployment")
    }

    /// Deployment resource table
    pub fn resource(&self) -> String {
        self.name("resource")
    }

    /// Definition table
    pub fn definition(&self) -> String {
        self.name("definition")
    }

    /// Job table
    pub fn job(&self) -> String {
        self.name("job")
    }

    /// History event table
    pub fn hist_event(&self) -> String {
        self.name("hist_event")
    }
}

fn is_in_memory(datasource: &str) -> bool {
    datasource.contains(":memory:") || datasource.contains("mode=memory")
}

/// Open a pool for an sqlx SQLite URL
///
/// In-memory databases live as long as their connection, so they get a
/// single connection that is never recycled.
pub async fn connect(datasource: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(datasource)?.create_if_missing(true);

    if is_in_memory(datasource) {
        debug!("🗄️ Opening in-memory database {}", datasource);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }
    info!("🗄️ Opening database {}", options.get_filename().display());
    Ok(SqlitePool::connect_with(options).await?)
}

fn delta(version: i64, tables: &Tables) -> Vec<String> {
    match version {
        1 => vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    name TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    rev INTEGER NOT NULL DEFAULT 1
                )",
                tables.property()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    source TEXT,
                    deploy_time INTEGER NOT NULL
                )",
                tables.deployment()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    deployment_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    bytes BLOB NOT NULL,
                    hash TEXT NOT NULL
                )",
                tables.resource()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    key TEXT NOT NULL,
                    name TEXT,
                    version INTEGER NOT NULL,
                    deployment_id TEXT NOT NULL,
                    resource_name TEXT NOT NULL,
                    UNIQUE (kind, key, version)
                )",
                tables.definition()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_deployment ON {0}(deployment_id)",
                tables.definition()
            ),
        ],
        2 => vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    revision INTEGER NOT NULL DEFAULT 1,
                    job_type TEXT NOT NULL,
                    handler_configuration TEXT,
                    due_date INTEGER,
                    retries INTEGER NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    lock_owner TEXT,
                    lock_expiration_time INTEGER,
                    exception_message TEXT,
                    activity_id TEXT,
                    execution_id TEXT,
                    process_instance_id TEXT,
                    process_definition_id TEXT,
                    process_definition_key TEXT,
                    deployment_id TEXT,
                    sequence_counter INTEGER NOT NULL DEFAULT 0
                )",
                tables.job()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_acquisition ON {0}(retries, due_date, lock_expiration_time)",
                tables.job()
            ),
        ],
        3 => vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    process_instance_id TEXT,
                    payload TEXT NOT NULL
                )",
                tables.hist_event()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_process_instance ON {0}(process_instance_id)",
                tables.hist_event()
            ),
        ],
        _ => Vec::new(),
    }
}

/// Reads, applies and verifies the schema version of one engine database
#[derive(Debug, Clone)]
pub struct SchemaManager {
    pool: SqlitePool,
    tables: Tables,
}

impl SchemaManager {
    /// Manager for the tables of one engine
    pub fn new(pool: SqlitePool, tables: Tables) -> Self {
        Self { pool, tables }
    }

    /// 0 for an empty database
    pub async fn current_version(&self) -> Result<i64> {
        let exists = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(self.tables.property())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(0);
        }

        let row = sqlx::query(&format!(
            "SELECT value FROM {} WHERE name = ?",
            self.tables.property()
        ))
        .bind(VERSION_PROPERTY)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(0),
            Some(row) => {
                let value: String = row.get("value");
                value.parse::<i64>().map_err(|_| {
                    PlatformError::lifecycle(format!("Invalid schema version '{}'", value))
                })
            }
        }
    }

    /// Apply all missing deltas, each in its own transaction
    pub async fn update(&self) -> Result<i64> {
        let current = self.current_version().await?;
        if current > SCHEMA_VERSION {
            return Err(PlatformError::lifecycle(format!(
                "Database schema version {} is newer than supported version {}",
                current, SCHEMA_VERSION
            )));
        }

        for version in (current + 1)..=SCHEMA_VERSION {
            let mut tx = self.pool.begin().await?;
            for statement in delta(version, &self.tables) {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }
            sqlx::query(&format!(
                "INSERT INTO {} (name, value, rev) VALUES (?, ?, 1)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value, rev = rev + 1",
                self.tables.property()
            ))
            .bind(VERSION_PROPERTY)
            .bind(version.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            info!("📐 Applied schema delta {} (prefix '{}')", version, self.tables.prefix());
        }

        Ok(SCHEMA_VERSION)
    }

    /// Fail unless every engine table exists
    pub async fn verify(&self) -> Result<()> {
        let current = self.current_version().await?;
        if current != SCHEMA_VERSION {
            return Err(PlatformError::lifecycle(format!(
                "Database schema is at version {} but version {} is required; enable auto schema update",
                current, SCHEMA_VERSION
            )));
        }
        Ok(())
    }
}
