/// Execution runtime
///
/// Runtime entities (executions, tasks, case executions, jobs), the logical
/// clock, and the compact single-token runner: process models compiled into
/// petgraph graphs, advanced by `RuntimeService`.

pub mod clock;
pub mod decision;
pub mod entity;
pub mod graph;
pub mod service;

pub use clock::{Clock, FixedClock, SystemClock};
pub use entity::{ExecutionEntity, JobEntity, TaskEntity};
pub use graph::ProcessGraph;
pub use service::{ProcessInstance, RuntimeService};
