/// History: event records, the producer that builds them and the handlers
/// that store them
pub mod event;
pub mod handler;
pub mod producer;

pub use event::{HistoryEntityKind, HistoryEvent, HistoryEventType};
pub use handler::{DbHistoryEventHandler, HistoryEventHandler, HistoryService, InMemoryHistoryEventHandler};
pub use producer::{DefaultHistoryEventProducer, HistoryEventCache, HistoryEventProducer};
