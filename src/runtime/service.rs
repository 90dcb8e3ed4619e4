/// Runtime service and the single-token process runner
///
/// Process instances live in memory; every state change runs inside a
/// command so jobs and history events commit together. A token moves through
/// the process graph until it reaches a wait state (user task, async
/// continuation) or an end event.

use crate::engine::application::ProcessApplicationManager;
use crate::engine::command::{Command, CommandContext, CommandExecutor};
use crate::engine::job_executor::insert_job;
use crate::engine::parser::{ActivityKind, ActivityModel, DefinitionKind, DefinitionModel, SequenceFlowModel};
use crate::engine::repository::{find_latest_definition_by_key, RepositoryService};
use crate::error::{PlatformError, Result};
use crate::expression::manager::ExpressionManager;
use crate::expression::scope::{SimpleVariableScope, VariableScope};
use crate::expression::script::ScriptEvaluator;
use crate::history::HistoryEventCache;
use crate::runtime::decision::evaluate_decision;
use crate::runtime::entity::{
    ActivityInstanceState, ActivityRef, ExecutionEntity, ExecutionInit, JobEntity, TaskEntity, TaskInit,
    TaskState,
};
use crate::runtime::graph::{GraphCache, ProcessGraph};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Snapshot of a process instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInstance {
    /// Process instance id
    pub id: String,
    /// Definition the instance runs
    pub definition_id: String,
    /// Key of that definition
    pub definition_key: String,
    /// Business key given on start
    pub business_key: Option<String>,
    /// Activity the instance waits in
    pub current_activity_id: Option<String>,
    /// Whether the instance already finished
    pub ended: bool,
}

impl ProcessInstance {
    fn of(execution: &ExecutionEntity) -> Self {
        Self {
            id: execution.process_instance_id().to_string(),
            definition_id: execution.process_definition_id().to_string(),
            definition_key: execution.process_definition_key().to_string(),
            business_key: execution.business_key().map(str::to_string),
            current_activity_id: execution.current_activity_id(),
            ended: execution.is_ended(),
        }
    }
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    execution: Arc<ExecutionEntity>,
    graph: Arc<ProcessGraph>,
    /// Outlives single commands so end events carry durations
    history: Arc<HistoryEventCache>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    instances: RwLock<HashMap<String, InstanceRecord>>,
    tasks: RwLock<HashMap<String, Arc<TaskEntity>>>,
}

impl RuntimeState {
    fn instance(&self, id: &str) -> Result<InstanceRecord> {
        self.instances
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("No active process instance '{}'", id)))
    }

    fn remove_instance(&self, id: &str) {
        self.instances.write().remove(id);
        self.tasks
            .write()
            .retain(|_, task| task.execution_entity().map(|e| e.process_instance_id()) != Some(id));
    }
}

enum Step {
    Enter { activity_id: String, skip_async: bool },
    Leave { activity_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Waiting,
    Ended,
}

fn activity_ref(activity: &ActivityModel) -> ActivityRef {
    ActivityRef {
        id: activity.id.clone(),
        name: activity.name.clone(),
        activity_type: activity.kind.type_name().to_string(),
    }
}

fn json_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Starts, advances and queries process instances
#[derive(Debug, Clone)]
pub struct RuntimeService {
    executor: Arc<CommandExecutor>,
    repository: RepositoryService,
    expressions: Arc<ExpressionManager>,
    scripts: Arc<ScriptEvaluator>,
    applications: Arc<ProcessApplicationManager>,
    graphs: Arc<GraphCache>,
    state: Arc<RuntimeState>,
}

impl RuntimeService {
    /// Runtime over `executor` with its collaborators
    pub fn new(
        executor: Arc<CommandExecutor>,
        repository: RepositoryService,
        expressions: Arc<ExpressionManager>,
        scripts: Arc<ScriptEvaluator>,
        applications: Arc<ProcessApplicationManager>,
    ) -> Self {
        Self {
            executor,
            repository,
            expressions,
            scripts,
            applications,
            graphs: Arc::new(GraphCache::new()),
            state: Arc::new(RuntimeState::default()),
        }
    }

    /// Start the latest version of `key`
    pub async fn start_process_instance_by_key(
        &self,
        key: &str,
        business_key: Option<&str>,
        variables: Map<String, Value>,
    ) -> Result<ProcessInstance> {
        self.executor
            .execute(&StartInstance {
                service: self,
                key,
                business_key,
                variables,
            })
            .await
    }

    /// Complete a user task and continue its process instance
    pub async fn complete_task(&self, task_id: &str, variables: Map<String, Value>) -> Result<ProcessInstance> {
        self.executor
            .execute(&CompleteTask {
                service: self,
                task_id,
                variables,
            })
            .await
    }

    /// Cancel an instance and its jobs
    pub async fn delete_process_instance(&self, id: &str, reason: Option<&str>) -> Result<()> {
        self.executor
            .execute(&DeleteInstance {
                service: self,
                id,
                reason,
            })
            .await
    }

    /// Evaluate the latest decision with `key` outside any process
    pub async fn evaluate_decision_by_key(&self, key: &str, variables: Map<String, Value>) -> Result<Value> {
        self.executor
            .execute(&EvaluateDecision {
                service: self,
                key,
                variables,
            })
            .await
    }

    /// Active instance by id
    pub fn process_instance(&self, id: &str) -> Option<ProcessInstance> {
        self.state
            .instances
            .read()
            .get(id)
            .map(|record| ProcessInstance::of(&record.execution))
    }

    /// All active instances
    pub fn active_process_instances(&self) -> Vec<ProcessInstance> {
        self.state
            .instances
            .read()
            .values()
            .map(|record| ProcessInstance::of(&record.execution))
            .collect()
    }

    /// Variables of an instance
    pub fn variables(&self, process_instance_id: &str) -> Result<Map<String, Value>> {
        Ok(self.state.instance(process_instance_id)?.execution.variables())
    }

    /// One variable of an instance
    pub fn variable(&self, process_instance_id: &str, name: &str) -> Result<Option<Value>> {
        Ok(self.state.instance(process_instance_id)?.execution.get_variable(name))
    }

    /// Set a variable on an instance
    pub fn set_variable(&self, process_instance_id: &str, name: &str, value: Value) -> Result<()> {
        self.state.instance(process_instance_id)?.execution.set_variable(name, value);
        Ok(())
    }

    /// Open task by id
    pub fn task(&self, id: &str) -> Option<Arc<TaskEntity>> {
        self.state.tasks.read().get(id).cloned()
    }

    /// All open tasks
    pub fn tasks(&self) -> Vec<Arc<TaskEntity>> {
        self.state.tasks.read().values().cloned().collect()
    }

    /// Open tasks of an instance
    pub fn tasks_for_process_instance(&self, process_instance_id: &str) -> Vec<Arc<TaskEntity>> {
        self.state
            .tasks
            .read()
            .values()
            .filter(|task| task.execution_entity().map(|e| e.process_instance_id()) == Some(process_instance_id))
            .cloned()
            .collect()
    }

    /// Drop every in-memory instance and compiled graph
    pub fn clear(&self) {
        self.state.instances.write().clear();
        self.state.tasks.write().clear();
        self.graphs.clear();
    }

    /// Continue the token an async continuation job is parked on
    pub(crate) async fn execute_job(&self, ctx: &mut CommandContext, job: &JobEntity) -> Result<()> {
        let instance_id = job
            .process_instance_id
            .as_deref()
            .ok_or_else(|| PlatformError::Validation(format!("Job {} has no process instance", job.id)))?;
        let activity_id = job
            .handler_configuration
            .clone()
            .or_else(|| job.activity_id.clone())
            .ok_or_else(|| PlatformError::Validation(format!("Job {} has no activity", job.id)))?;

        let record = self.state.instance(instance_id)?;
        let step = Step::Enter {
            activity_id,
            skip_async: true,
        };
        if self.run(ctx, &record, step).await? == Outcome::Ended {
            self.state.remove_instance(instance_id);
        }
        Ok(())
    }

    async fn run(&self, ctx: &mut CommandContext, record: &InstanceRecord, mut step: Step) -> Result<Outcome> {
        let execution = &record.execution;
        let history: &HistoryEventCache = &record.history;

        loop {
            step = match step {
                Step::Enter {
                    activity_id,
                    skip_async,
                } => {
                    let activity = record.graph.activity(&activity_id).cloned().ok_or_else(|| {
                        PlatformError::NotFound(format!(
                            "Activity '{}' not found in process '{}'",
                            activity_id,
                            record.graph.process_id()
                        ))
                    })?;

                    if activity.async_before && !skip_async {
                        self.park_on_job(ctx, execution, &activity).await?;
                        return Ok(Outcome::Waiting);
                    }

                    execution.enter_activity(activity_ref(&activity), format!("{}:{}", activity.id, Uuid::new_v4()));
                    ctx.produce_in(history, |p, c| p.activity_instance_start(c, execution));
                    debug!("📍 {} entered '{}' ({})", execution.id(), activity.id, activity.kind.type_name());

                    match &activity.kind {
                        ActivityKind::StartEvent | ActivityKind::Task | ActivityKind::ExclusiveGateway => {}
                        ActivityKind::EndEvent => {
                            self.end_activity(ctx, record);
                            self.end_instance(ctx, record);
                            return Ok(Outcome::Ended);
                        }
                        ActivityKind::ServiceTask {
                            expression,
                            result_variable,
                        } => {
                            if let Some(expression) = expression {
                                let value = self.expressions.evaluate_json(expression, &**execution)?;
                                if let Some(name) = result_variable {
                                    execution.set_variable(name, value);
                                }
                            }
                        }
                        ActivityKind::ScriptTask {
                            format,
                            script,
                            result_variable,
                        } => {
                            let value = self.scripts.evaluate(format, script, &**execution)?;
                            if let Some(name) = result_variable {
                                execution.set_variable(name, value);
                            }
                        }
                        ActivityKind::UserTask { assignee } => {
                            self.create_task(ctx, record, &activity, assignee.as_deref())?;
                            return Ok(Outcome::Waiting);
                        }
                        ActivityKind::BusinessRuleTask {
                            decision_ref,
                            result_variable,
                        } => {
                            let value = self
                                .evaluate_decision_in(ctx, decision_ref, &**execution, Some(execution))
                                .await?;
                            if let Some(name) = result_variable {
                                execution.set_variable(name, value);
                            }
                        }
                        ActivityKind::Unsupported(element) => {
                            return Err(PlatformError::Unsupported(format!(
                                "Activity '{}' of type '{}' cannot be executed",
                                activity.id, element
                            )));
                        }
                    }
                    Step::Leave { activity_id }
                }
                Step::Leave { activity_id } => {
                    let activity = record.graph.activity(&activity_id).cloned().ok_or_else(|| {
                        PlatformError::NotFound(format!("Activity '{}' not found", activity_id))
                    })?;
                    self.end_activity(ctx, record);

                    match self.select_flow(record, &activity)? {
                        Some(flow) => Step::Enter {
                            activity_id: flow.target.clone(),
                            skip_async: false,
                        },
                        None => {
                            self.end_instance(ctx, record);
                            return Ok(Outcome::Ended);
                        }
                    }
                }
            };
        }
    }

    fn end_activity(&self, ctx: &mut CommandContext, record: &InstanceRecord) {
        let execution = &record.execution;
        execution.update_state(|s| s.activity_instance_state = ActivityInstanceState::ScopeComplete);
        ctx.produce_in(&record.history, |p, c| p.activity_instance_end(c, execution));
    }

    fn end_instance(&self, ctx: &mut CommandContext, record: &InstanceRecord) {
        let execution = &record.execution;
        execution.update_state(|s| s.ended = true);
        ctx.produce_in(&record.history, |p, c| p.process_instance_end(c, execution));
        info!("🏁 Process instance {} completed", execution.process_instance_id());
    }

    /// Outgoing flow the token takes, `None` when the activity has none
    fn select_flow<'g>(&self, record: &'g InstanceRecord, activity: &ActivityModel) -> Result<Option<&'g SequenceFlowModel>> {
        let outgoing = record.graph.outgoing(&activity.id);
        if outgoing.is_empty() {
            return Ok(None);
        }
        let scope: &ExecutionEntity = &record.execution;
        let default_flow = activity.default_flow.as_deref();

        let mut taken = Vec::new();
        for flow in &outgoing {
            if Some(flow.id.as_str()) == default_flow {
                continue;
            }
            let passes = match &flow.condition {
                Some(condition) => self.expressions.evaluate_condition(condition, scope)?,
                None => true,
            };
            if passes {
                taken.push(*flow);
                if activity.kind == ActivityKind::ExclusiveGateway {
                    break;
                }
            }
        }

        match taken.len() {
            1 => Ok(taken.pop()),
            0 => outgoing
                .iter()
                .find(|flow| Some(flow.id.as_str()) == default_flow)
                .map(|flow| Some(*flow))
                .ok_or_else(|| {
                    PlatformError::Validation(format!(
                        "No outgoing sequence flow of '{}' could be selected",
                        activity.id
                    ))
                }),
            _ => Err(PlatformError::Unsupported(format!(
                "Activity '{}' would split the token into {} paths",
                activity.id,
                taken.len()
            ))),
        }
    }

    async fn park_on_job(&self, ctx: &mut CommandContext, execution: &ExecutionEntity, activity: &ActivityModel) -> Result<()> {
        let sequence_counter = execution.update_state(|s| {
            s.activity = Some(activity_ref(activity));
            s.activity_instance_id = None;
            s.sequence_counter
        });
        let job = JobEntity {
            id: Uuid::new_v4().to_string(),
            revision: 1,
            job_type: JobEntity::ASYNC_CONTINUATION.to_string(),
            handler_configuration: Some(activity.id.clone()),
            due_date: Some(ctx.clock().now()),
            retries: JobEntity::DEFAULT_RETRIES,
            activity_id: Some(activity.id.clone()),
            execution_id: Some(execution.id().to_string()),
            process_instance_id: Some(execution.process_instance_id().to_string()),
            process_definition_id: Some(execution.process_definition_id().to_string()),
            process_definition_key: Some(execution.process_definition_key().to_string()),
            deployment_id: execution.deployment_id().map(str::to_string),
            sequence_counter,
            ..Default::default()
        };

        let tables = ctx.tables().clone();
        insert_job(ctx.connection(), &tables, &job).await?;
        ctx.produce(|p, _| p.job_log_created(&job));
        debug!("⏳ {} parked before '{}' on job {}", execution.id(), activity.id, job.id);
        Ok(())
    }

    fn create_task(
        &self,
        ctx: &mut CommandContext,
        record: &InstanceRecord,
        activity: &ActivityModel,
        assignee: Option<&str>,
    ) -> Result<()> {
        let execution = &record.execution;
        let assignee = match assignee {
            Some(text) if text.contains("${") || text.contains("#{") => {
                json_text(self.expressions.evaluate_json(text, &**execution)?)
            }
            other => other.map(str::to_string),
        };

        let task = TaskEntity::create(TaskInit {
            id: Uuid::new_v4().to_string(),
            task_definition_key: Some(activity.id.clone()),
            execution: Some(Arc::clone(execution)),
            state: TaskState {
                name: activity.name.clone(),
                assignee,
                ..Default::default()
            },
            ..Default::default()
        });

        ctx.produce_in(&record.history, |p, c| p.task_instance_create(c, &task));
        ctx.produce_in(&record.history, |p, c| p.activity_instance_update(c, execution, Some(&task)));
        debug!("📝 Created task {} for '{}'", task.id(), activity.id);
        self.state.tasks.write().insert(task.id().to_string(), task);
        Ok(())
    }

    async fn evaluate_decision_in(
        &self,
        ctx: &mut CommandContext,
        key: &str,
        scope: &dyn VariableScope,
        execution: Option<&Arc<ExecutionEntity>>,
    ) -> Result<Value> {
        let tables = ctx.tables().clone();
        let record = find_latest_definition_by_key(ctx.connection(), &tables, DefinitionKind::Decision, key)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("No decision definition with key '{}'", key)))?;
        let deployed = self
            .repository
            .deployed_definition(ctx.connection(), &tables, &record.id)
            .await?;
        let DefinitionModel::Decision(decision) = &deployed.model else {
            return Err(PlatformError::Validation(format!("Definition {} is not a decision", record.id)));
        };

        let mut result = evaluate_decision(&self.expressions, decision, scope)?;
        let evaluation = &mut result.evaluation;
        evaluation.decision_definition_id = record.id.clone();
        evaluation.user_id = scope.authenticated_user_id();
        if let Some(execution) = execution {
            let state = execution.state();
            evaluation.process_definition_id = Some(execution.process_definition_id().to_string());
            evaluation.process_definition_key = Some(execution.process_definition_key().to_string());
            evaluation.process_instance_id = Some(execution.process_instance_id().to_string());
            evaluation.execution_id = Some(execution.id().to_string());
            evaluation.activity_id = state.activity.map(|a| a.id);
            evaluation.activity_instance_id = state.activity_instance_id;
        }

        let evaluation = result.evaluation.clone();
        ctx.produce(|p, _| p.decision_evaluated(&evaluation));
        debug!("🎲 Decision '{}' evaluated to {}", key, result.value);
        Ok(result.value)
    }
}

struct StartInstance<'a> {
    service: &'a RuntimeService,
    key: &'a str,
    business_key: Option<&'a str>,
    variables: Map<String, Value>,
}

#[async_trait]
impl<'a> Command for StartInstance<'a> {
    type Output = ProcessInstance;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<ProcessInstance> {
        let service = self.service;
        let tables = ctx.tables().clone();
        let definition = find_latest_definition_by_key(ctx.connection(), &tables, DefinitionKind::Process, self.key)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("No process definition with key '{}'", self.key)))?;
        let deployed = service
            .repository
            .deployed_definition(ctx.connection(), &tables, &definition.id)
            .await?;
        let DefinitionModel::Process(process) = &deployed.model else {
            return Err(PlatformError::Validation(format!("Definition {} is not a process", definition.id)));
        };
        let graph = service.graphs.get_or_build(&definition.id, process)?;

        let id = Uuid::new_v4().to_string();
        let execution = ExecutionEntity::create(ExecutionInit {
            id: id.clone(),
            process_instance_id: id.clone(),
            process_definition_id: definition.id.clone(),
            process_definition_key: definition.key.clone(),
            deployment_id: Some(definition.deployment_id.clone()),
            business_key: self.business_key.map(str::to_string),
            process_application: service.applications.application_for_deployment(&definition.deployment_id),
            variables: self.variables.clone(),
            ..Default::default()
        });

        let start = graph.start_activity().id.clone();
        let record = InstanceRecord {
            execution: Arc::clone(&execution),
            graph,
            history: Arc::new(HistoryEventCache::new()),
        };
        execution.update_state(|s| {
            s.activity = record.graph.activity(&start).map(activity_ref);
        });
        ctx.produce_in(&record.history, |p, c| p.process_instance_start(c, &execution));
        service.state.instances.write().insert(id.clone(), record.clone());
        info!("🚀 Started process instance {} of '{}'", id, definition.key);

        let step = Step::Enter {
            activity_id: start,
            skip_async: false,
        };
        match service.run(ctx, &record, step).await {
            Ok(Outcome::Ended) => service.state.remove_instance(&id),
            Ok(Outcome::Waiting) => {}
            Err(e) => {
                service.state.remove_instance(&id);
                return Err(e);
            }
        }
        Ok(ProcessInstance::of(&execution))
    }
}

struct CompleteTask<'a> {
    service: &'a RuntimeService,
    task_id: &'a str,
    variables: Map<String, Value>,
}

#[async_trait]
impl<'a> Command for CompleteTask<'a> {
    type Output = ProcessInstance;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<ProcessInstance> {
        let service = self.service;
        let task = service
            .task(self.task_id)
            .ok_or_else(|| PlatformError::NotFound(format!("No task with id '{}'", self.task_id)))?;
        let execution = task.execution_entity().cloned().ok_or_else(|| {
            PlatformError::Unsupported(format!("Task {} is not bound to a process instance", self.task_id))
        })?;
        let instance_id = execution.process_instance_id();
        let record = service.state.instance(instance_id)?;
        let activity_id = task
            .task_definition_key()
            .map(str::to_string)
            .or_else(|| execution.current_activity_id())
            .ok_or_else(|| PlatformError::Validation(format!("Task {} has no activity", self.task_id)))?;

        // restored if the continuation fails
        let snapshot = execution.snapshot();
        let open_tasks: HashSet<String> = service
            .tasks_for_process_instance(instance_id)
            .iter()
            .map(|t| t.id().to_string())
            .collect();

        for (name, value) in &self.variables {
            execution.set_variable(name, value.clone());
        }
        ctx.produce_in(&record.history, |p, c| p.task_instance_complete(c, &task, Some("completed")));

        match service.run(ctx, &record, Step::Leave { activity_id }).await {
            Ok(outcome) => {
                service.state.tasks.write().remove(self.task_id);
                if outcome == Outcome::Ended {
                    service.state.remove_instance(instance_id);
                }
                Ok(ProcessInstance::of(&execution))
            }
            Err(e) => {
                execution.restore(snapshot);
                service.state.tasks.write().retain(|id, t| {
                    open_tasks.contains(id) || t.execution_entity().map(|e| e.process_instance_id()) != Some(instance_id)
                });
                warn!("⚠️ Completing task {} failed, instance {} left at its task: {}", self.task_id, instance_id, e);
                Err(e)
            }
        }
    }
}

struct DeleteInstance<'a> {
    service: &'a RuntimeService,
    id: &'a str,
    reason: Option<&'a str>,
}

#[async_trait]
impl<'a> Command for DeleteInstance<'a> {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let service = self.service;
        let record = service.state.instance(self.id)?;
        let reason = self.reason.unwrap_or("deleted");

        let statement = format!("DELETE FROM {} WHERE process_instance_id = ?", ctx.tables().job());
        sqlx::query(&statement).bind(self.id).execute(ctx.connection()).await?;

        for task in service.tasks_for_process_instance(self.id) {
            ctx.produce_in(&record.history, |p, c| p.task_instance_complete(c, &task, Some(reason)));
        }

        let execution = &record.execution;
        if execution.state().activity_instance_id.is_some() {
            execution.update_state(|s| s.activity_instance_state = ActivityInstanceState::Canceled);
            ctx.produce_in(&record.history, |p, c| p.activity_instance_end(c, execution));
        }
        execution.update_state(|s| {
            s.activity = None;
            s.ended = true;
            s.externally_terminated = true;
            s.delete_reason = Some(reason.to_string());
        });
        ctx.produce_in(&record.history, |p, c| p.process_instance_end(c, execution));

        service.state.remove_instance(self.id);
        info!("🗑️ Deleted process instance {} ({})", self.id, reason);
        Ok(())
    }
}

struct EvaluateDecision<'a> {
    service: &'a RuntimeService,
    key: &'a str,
    variables: Map<String, Value>,
}

#[async_trait]
impl<'a> Command for EvaluateDecision<'a> {
    type Output = Value;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Value> {
        let mut scope = SimpleVariableScope::new(format!("decision:{}", self.key));
        for (name, value) in &self.variables {
            scope = scope.with_variable(name, value.clone());
        }
        self.service.evaluate_decision_in(ctx, self.key, &scope, None).await
    }
}
