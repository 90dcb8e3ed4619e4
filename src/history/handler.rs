/// History event handlers and the history query service
///
/// Producers only build events; a handler decides where they go. The database
/// handler appends every event as one JSON row to `{prefix}hist_event`.

use crate::engine::schema::Tables;
use crate::error::Result;
use crate::history::event::{HistoryEntityKind, HistoryEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::fmt::Debug;
use tracing::debug;

/// Receives the events of each committed command
#[async_trait]
pub trait HistoryEventHandler: Send + Sync + Debug {
    async fn handle_events(&self, events: &[HistoryEvent]) -> Result<()>;
}

/// Stores events in the engine database
#[derive(Debug, Clone)]
pub struct DbHistoryEventHandler {
    pool: SqlitePool,
    tables: Tables,
}

impl DbHistoryEventHandler {
    /// Handler writing into the history table
    pub fn new(pool: SqlitePool, tables: Tables) -> Self {
        Self { pool, tables }
    }
}

#[async_trait]
impl HistoryEventHandler for DbHistoryEventHandler {
    async fn handle_events(&self, events: &[HistoryEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let statement = format!(
            "INSERT INTO {} (id, kind, event_type, process_instance_id, payload) VALUES (?, ?, ?, ?, ?)",
            self.tables.hist_event()
        );
        let mut tx = self.pool.begin().await?;
        for event in events {
            let payload = serde_json::to_string(event)?;
            sqlx::query(&statement)
                .bind(event.id())
                .bind(event.kind().as_str())
                .bind(event.event_type().event_name())
                .bind(event.process_instance_id())
                .bind(payload)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("📜 Stored {} history events", events.len());
        Ok(())
    }
}

/// Keeps events in memory, mostly for tests and embedded use
#[derive(Debug, Default)]
pub struct InMemoryHistoryEventHandler {
    events: Mutex<Vec<HistoryEvent>>,
}

impl InMemoryHistoryEventHandler {
    /// Empty handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far
    pub fn events(&self) -> Vec<HistoryEvent> {
        self.events.lock().clone()
    }

    /// Forget received events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl HistoryEventHandler for InMemoryHistoryEventHandler {
    async fn handle_events(&self, events: &[HistoryEvent]) -> Result<()> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

/// Read access to stored history
#[derive(Debug, Clone)]
pub struct HistoryService {
    pool: SqlitePool,
    tables: Tables,
}

impl HistoryService {
    /// Queries over the history table
    pub fn new(pool: SqlitePool, tables: Tables) -> Self {
        Self { pool, tables }
    }

    /// Events of one process instance in the order they were recorded
    pub async fn events_for_process_instance(&self, process_instance_id: &str) -> Result<Vec<HistoryEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT payload FROM {} WHERE process_instance_id = ? ORDER BY seq",
            self.tables.hist_event()
        ))
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Self::decode(rows)
    }

    /// Events of one entity kind
    pub async fn events_of_kind(&self, kind: HistoryEntityKind) -> Result<Vec<HistoryEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT payload FROM {} WHERE kind = ? ORDER BY seq",
            self.tables.hist_event()
        ))
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Self::decode(rows)
    }

    /// Number of stored events
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM {}", self.tables.hist_event()))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    fn decode(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<HistoryEvent>> {
        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload");
                Ok(serde_json::from_str(&payload)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schema::{connect, SchemaManager};
    use crate::history::event::{HistoricJobLogEvent, HistoricProcessInstanceEvent, HistoryEventType};

    #[tokio::test]
    async fn test_db_handler_round_trips_events() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let tables = Tables::new(Some("h_"));
        SchemaManager::new(pool.clone(), tables.clone()).update().await.unwrap();

        let handler = DbHistoryEventHandler::new(pool.clone(), tables.clone());
        let start = HistoryEvent::ProcessInstance(HistoricProcessInstanceEvent {
            id: "pi-1".to_string(),
            process_instance_id: "pi-1".to_string(),
            event_type: HistoryEventType::ProcessInstanceStart,
            ..Default::default()
        });
        let job = HistoryEvent::JobLog(HistoricJobLogEvent {
            id: "log-1".to_string(),
            process_instance_id: Some("pi-2".to_string()),
            event_type: HistoryEventType::JobCreate,
            ..Default::default()
        });
        handler.handle_events(&[start.clone(), job]).await.unwrap();

        let service = HistoryService::new(pool, tables);
        assert_eq!(service.count().await.unwrap(), 2);
        assert_eq!(service.events_for_process_instance("pi-1").await.unwrap(), vec![start]);
        assert_eq!(service.events_of_kind(HistoryEntityKind::JobLog).await.unwrap().len(), 1);
    }
}
