/// bpm-platform: process platform runtime core
///
/// A registry of process engines, each owned by a lifecycle controller that
/// deploys process archives (BPMN, CMMN and DMN resources) into a SQLite
/// datastore. Expressions and Lua scripts are evaluated against variable
/// scopes, and every lifecycle point of an execution produces a history event.

// Platform descriptor and per-engine configuration
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Expression language, resolver chain and Lua scripting
pub mod expression;

// History events and their producer/handlers
pub mod history;

// Engine internals: schema, commands, deployer, job executor, controller
pub mod engine;

// Runtime entities and the single-token process runner
pub mod runtime;

// Registry facade, process archives, extensions
pub mod platform;

// Platform bootstrap used by the binary
pub mod server;

pub use config::{HistoryLevel, PlatformConfig, ProcessEngineConfig};
pub use engine::{ProcessEngine, ProcessEngineController};
pub use error::{PlatformError, Result};
pub use platform::{ArchiveHandle, PlatformExtension, ProcessArchive, ProcessEngineRegistry};
pub use server::start_platform;
