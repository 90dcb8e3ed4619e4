/// Transactional command execution
///
/// Every unit of work against the engine database runs as a `Command` inside
/// one sqlx transaction. History events recorded during the command are
/// filtered by the history level and handed to the history handler after the
/// transaction committed.

use crate::config::HistoryLevel;
use crate::engine::schema::Tables;
use crate::error::Result;
use crate::history::{HistoryEvent, HistoryEventCache, HistoryEventHandler, HistoryEventProducer};
use crate::runtime::clock::Clock;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::{Sqlite, Transaction};
use std::sync::Arc;
use tracing::{error, warn};

/// Unit of work run inside one database transaction
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output>;
}

/// State of one running command
pub struct CommandContext {
    tx: Transaction<'static, Sqlite>,
    tables: Tables,
    level: HistoryLevel,
    producer: Arc<dyn HistoryEventProducer>,
    clock: Arc<dyn Clock>,
    cache: HistoryEventCache,
    events: Vec<HistoryEvent>,
}

impl CommandContext {
    /// Connection of the open transaction
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Table names of this engine
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// History event producer
    pub fn producer(&self) -> &dyn HistoryEventProducer {
        self.producer.as_ref()
    }

    /// Engine clock
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Event cache for the current command
    pub fn history_cache(&self) -> &HistoryEventCache {
        &self.cache
    }

    /// History level events are filtered against
    pub fn history_level(&self) -> HistoryLevel {
        self.level
    }

    /// Queue an event for the handler if the history level records it
    pub fn record(&mut self, event: HistoryEvent) {
        if event.kind().is_recorded_at(self.level) {
            self.events.push(event);
        }
    }

    /// Build an event with the producer and queue it
    pub fn produce(&mut self, build: impl FnOnce(&dyn HistoryEventProducer, &HistoryEventCache) -> HistoryEvent) {
        let event = build(self.producer.as_ref(), &self.cache);
        self.record(event);
    }

    /// Like `produce`, with a cache that outlives this command
    pub fn produce_in(
        &mut self,
        cache: &HistoryEventCache,
        build: impl FnOnce(&dyn HistoryEventProducer, &HistoryEventCache) -> HistoryEvent,
    ) {
        let event = build(self.producer.as_ref(), cache);
        self.record(event);
    }

    /// Events produced so far by this command
    pub fn recorded_events(&self) -> &[HistoryEvent] {
        &self.events
    }
}

/// Runs commands against one engine database
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    pool: SqlitePool,
    tables: Tables,
    level: HistoryLevel,
    producer: Arc<dyn HistoryEventProducer>,
    handler: Arc<dyn HistoryEventHandler>,
    clock: Arc<dyn Clock>,
}

impl CommandExecutor {
    /// Executor over `pool` using the engine's tables and history stack
    pub fn new(
        pool: SqlitePool,
        tables: Tables,
        level: HistoryLevel,
        producer: Arc<dyn HistoryEventProducer>,
        handler: Arc<dyn HistoryEventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            tables,
            level,
            producer,
            handler,
            clock,
        }
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Table names of this engine
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Configured history level
    pub fn history_level(&self) -> HistoryLevel {
        self.level
    }

    /// Engine clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `command` in a transaction: commit on `Ok`, roll back on `Err`
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output> {
        let tx = self.pool.begin().await?;
        let mut ctx = CommandContext {
            tx,
            tables: self.tables.clone(),
            level: self.level,
            producer: Arc::clone(&self.producer),
            clock: Arc::clone(&self.clock),
            cache: HistoryEventCache::new(),
            events: Vec::new(),
        };

        match command.execute(&mut ctx).await {
            Ok(output) => {
                let CommandContext { tx, events, .. } = ctx;
                tx.commit().await?;
                if !events.is_empty() {
                    if let Err(e) = self.handler.handle_events(&events).await {
                        error!("❌ Failed to store {} history events: {}", events.len(), e);
                    }
                }
                Ok(output)
            }
            Err(e) => {
                if let Err(rollback) = ctx.tx.rollback().await {
                    warn!("⚠️ Rollback failed after command error: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schema::{connect, SchemaManager};
    use crate::error::PlatformError;
    use crate::history::{DefaultHistoryEventProducer, InMemoryHistoryEventHandler};
    use crate::history::event::{HistoricIncidentEvent, HistoricProcessInstanceEvent};
    use crate::runtime::clock::SystemClock;
    use sqlx::Row;

    struct SetProperty {
        fail: bool,
    }

    #[async_trait]
    impl Command for SetProperty {
        type Output = ();

        async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
            let table = ctx.tables().property();
            sqlx::query(&format!("INSERT INTO {} (name, value) VALUES ('marker', 'x')", table))
                .execute(ctx.connection())
                .await?;
            ctx.record(HistoryEvent::ProcessInstance(HistoricProcessInstanceEvent {
                id: "pi-1".to_string(),
                ..Default::default()
            }));
            ctx.record(HistoryEvent::Incident(HistoricIncidentEvent {
                id: "inc-1".to_string(),
                ..Default::default()
            }));
            if self.fail {
                return Err(PlatformError::Validation("boom".to_string()));
            }
            Ok(())
        }
    }

    async fn executor(handler: Arc<InMemoryHistoryEventHandler>) -> CommandExecutor {
        let pool = connect("sqlite::memory:").await.unwrap();
        let tables = Tables::new(None);
        SchemaManager::new(pool.clone(), tables.clone()).update().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        CommandExecutor::new(
            pool,
            tables,
            HistoryLevel::Activity,
            Arc::new(DefaultHistoryEventProducer::new(Arc::clone(&clock))),
            handler,
            clock,
        )
    }

    async fn marker_count(executor: &CommandExecutor) -> i64 {
        sqlx::query("SELECT COUNT(*) AS total FROM property WHERE name = 'marker'")
            .fetch_one(executor.pool())
            .await
            .unwrap()
            .get("total")
    }

    #[tokio::test]
    async fn test_failed_command_rolls_back() {
        let handler = Arc::new(InMemoryHistoryEventHandler::new());
        let executor = executor(Arc::clone(&handler)).await;

        let err = executor.execute(&SetProperty { fail: true }).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(marker_count(&executor).await, 0);
        assert!(handler.events().is_empty());
    }

    #[tokio::test]
    async fn test_committed_command_flushes_events_by_level() {
        let handler = Arc::new(InMemoryHistoryEventHandler::new());
        let executor = executor(Arc::clone(&handler)).await;

        executor.execute(&SetProperty { fail: false }).await.unwrap();
        assert_eq!(marker_count(&executor).await, 1);

        // incidents need history level "full"
        let events = handler.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id(), "pi-1");
    }
}
