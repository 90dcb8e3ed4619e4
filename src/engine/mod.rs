/// Process engine internals
///
/// Schema and command execution at the bottom, model parsing, deployment and
/// job execution on top, and the lifecycle controller tying one engine to the
/// platform.

pub mod application;
pub mod command;
pub mod controller;
pub mod deployer;
pub mod job_executor;
pub mod parser;
pub mod repository;
pub mod runtime;
pub mod schema;

pub use application::{ProcessApplication, ProcessApplicationManager, ProcessApplicationReference};
pub use command::{Command, CommandContext, CommandExecutor};
pub use controller::{ControllerContext, ProcessEngineController};
pub use deployer::{DeploymentOutcome, DeploymentRequest, ResourceDeployer};
pub use job_executor::JobExecutor;
pub use parser::{DefinitionKind, DefinitionModel};
pub use repository::{DefinitionCache, DefinitionRecord, RepositoryService};
pub use runtime::{EngineConfiguration, ProcessEngine, SchemaMode};
pub use schema::{SchemaManager, Tables};
