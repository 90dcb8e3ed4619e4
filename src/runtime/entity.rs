/// Runtime entities: executions, tasks, case executions, external tasks
///
/// Entities are shared behind `Arc` and mutated through interior locks, so an
/// expression holding a bean of the current execution can write variables
/// while the runner still owns the entity. Each entity also knows how to
/// expose itself to the expression language.

use crate::engine::application::ProcessApplicationReference;
use crate::expression::scope::{Bean, ElContextCache, ElValue, ScopeKind, VariableScope};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};

/// Activity an execution currently sits in
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActivityRef {
    pub id: String,
    pub name: Option<String>,
    pub activity_type: String,
}

/// Activity instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityInstanceState {
    #[default]
    Default,
    ScopeComplete,
    Canceled,
    Starting,
    Ending,
}

impl ActivityInstanceState {
    /// Numeric code stored with history
    pub fn code(&self) -> i32 {
        match self {
            ActivityInstanceState::Default => 0,
            ActivityInstanceState::ScopeComplete => 1,
            ActivityInstanceState::Canceled => 2,
            ActivityInstanceState::Starting => 3,
            ActivityInstanceState::Ending => 4,
        }
    }
}

/// Mutable part of an execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    pub activity: Option<ActivityRef>,
    pub activity_instance_id: Option<String>,
    pub parent_activity_instance_id: Option<String>,
    pub activity_instance_state: ActivityInstanceState,
    pub suspended: bool,
    pub ended: bool,
    pub externally_terminated: bool,
    pub delete_reason: Option<String>,
    pub sequence_counter: i64,
    pub sub_process_instance_id: Option<String>,
    pub sub_case_instance_id: Option<String>,
}

/// Immutable identity of a new execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionInit {
    pub id: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub process_definition_key: String,
    pub deployment_id: Option<String>,
    pub business_key: Option<String>,
    pub case_instance_id: Option<String>,
    pub super_process_instance_id: Option<String>,
    pub super_case_instance_id: Option<String>,
    pub authenticated_user_id: Option<String>,
    pub authenticated_group_ids: Vec<String>,
    pub process_application: Option<ProcessApplicationReference>,
    pub variables: Map<String, Value>,
}

/// Token of a running process instance
#[derive(Debug)]
pub struct ExecutionEntity {
    init: ExecutionInit,
    state: RwLock<ExecutionState>,
    variables: RwLock<Map<String, Value>>,
    el_context: ElContextCache,
    self_ref: Weak<ExecutionEntity>,
}

impl ExecutionEntity {
    /// Wrap `init` in a shared entity
    pub fn create(mut init: ExecutionInit) -> Arc<Self> {
        let variables = std::mem::take(&mut init.variables);
        Arc::new_cyclic(|self_ref| Self {
            init,
            state: RwLock::new(ExecutionState::default()),
            variables: RwLock::new(variables),
            el_context: ElContextCache::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Execution id
    pub fn id(&self) -> &str {
        &self.init.id
    }

    /// Process instance id
    pub fn process_instance_id(&self) -> &str {
        &self.init.process_instance_id
    }

    /// Process definition id
    pub fn process_definition_id(&self) -> &str {
        &self.init.process_definition_id
    }

    /// Process definition key
    pub fn process_definition_key(&self) -> &str {
        &self.init.process_definition_key
    }

    /// Deployment of the definition
    pub fn deployment_id(&self) -> Option<&str> {
        self.init.deployment_id.as_deref()
    }

    /// Business key
    pub fn business_key(&self) -> Option<&str> {
        self.init.business_key.as_deref()
    }

    /// Case instance that started this process
    pub fn case_instance_id(&self) -> Option<&str> {
        self.init.case_instance_id.as_deref()
    }

    /// Calling process instance
    pub fn super_process_instance_id(&self) -> Option<&str> {
        self.init.super_process_instance_id.as_deref()
    }

    /// Calling case instance
    pub fn super_case_instance_id(&self) -> Option<&str> {
        self.init.super_case_instance_id.as_deref()
    }

    /// User who started the instance
    pub fn authenticated_user(&self) -> Option<&str> {
        self.init.authenticated_user_id.as_deref()
    }

    /// Point-in-time copy of the mutable state
    pub fn state(&self) -> ExecutionState {
        self.state.read().clone()
    }

    /// Mutate state under the write lock
    pub fn update_state<R>(&self, update: impl FnOnce(&mut ExecutionState) -> R) -> R {
        update(&mut self.state.write())
    }

    /// Move into `activity` as a new activity instance
    pub fn enter_activity(&self, activity: ActivityRef, activity_instance_id: String) {
        let mut state = self.state.write();
        state.parent_activity_instance_id = Some(self.init.process_instance_id.clone());
        state.activity = Some(activity);
        state.activity_instance_id = Some(activity_instance_id);
        state.activity_instance_state = ActivityInstanceState::Default;
        state.sequence_counter += 1;
    }

    /// Id of the current activity
    pub fn current_activity_id(&self) -> Option<String> {
        self.state.read().activity.as_ref().map(|a| a.id.clone())
    }

    /// Whether the execution ended
    pub fn is_ended(&self) -> bool {
        self.state.read().ended
    }

    /// Whether the execution is suspended
    pub fn is_suspended(&self) -> bool {
        self.state.read().suspended
    }

    /// Copy of state and variables for [`ExecutionEntity::restore`]
    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            state: self.state(),
            variables: self.variables.read().clone(),
        }
    }

    /// Roll state and variables back to an earlier snapshot
    pub fn restore(&self, snapshot: ExecutionSnapshot) {
        *self.state.write() = snapshot.state;
        *self.variables.write() = snapshot.variables;
    }

    fn arc(&self) -> Option<Arc<ExecutionEntity>> {
        self.self_ref.upgrade()
    }
}

/// Saved execution state and variables
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    state: ExecutionState,
    variables: Map<String, Value>,
}

fn variable_method(
    scope: &dyn VariableScope,
    method: &str,
    args: &[ElValue],
) -> Option<Result<ElValue, String>> {
    let name = || {
        args.first()
            .and_then(|a| a.as_json())
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| format!("'{}' expects a variable name", method))
    };
    let result = match method {
        "getVariable" | "getVariableLocal" => {
            name().map(|n| ElValue::Json(scope.get_variable(&n).unwrap_or(Value::Null)))
        }
        "hasVariable" => name().map(|n| ElValue::Json(Value::Bool(scope.has_variable(&n)))),
        "setVariable" | "setVariableLocal" => name().map(|n| {
            let value = args.get(1).map(ElValue::to_json).unwrap_or(Value::Null);
            scope.set_variable(&n, value);
            ElValue::null()
        }),
        "getVariables" => Ok(ElValue::Json(Value::Object(scope.variables()))),
        _ => return None,
    };
    Some(result)
}

fn text(value: Option<&str>) -> Value {
    value.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null)
}

fn getter_name(method: &str) -> Option<String> {
    let rest = method.strip_prefix("get")?;
    let mut chars = rest.chars();
    let first = chars.next()?;
    Some(first.to_lowercase().chain(chars).collect())
}

impl Bean for ExecutionEntity {
    fn type_name(&self) -> &str {
        "Execution"
    }

    fn get_property(&self, name: &str) -> Option<ElValue> {
        let state = self.state.read();
        let value = match name {
            "id" => json!(self.init.id),
            "processInstanceId" => json!(self.init.process_instance_id),
            "processDefinitionId" => json!(self.init.process_definition_id),
            "processDefinitionKey" => json!(self.init.process_definition_key),
            "businessKey" | "processBusinessKey" => text(self.business_key()),
            "currentActivityId" | "activityId" => {
                text(state.activity.as_ref().map(|a| a.id.as_str()))
            }
            "currentActivityName" => {
                text(state.activity.as_ref().and_then(|a| a.name.as_deref()))
            }
            "activityInstanceId" => text(state.activity_instance_id.as_deref()),
            "suspended" => Value::Bool(state.suspended),
            "variables" => Value::Object(self.variables.read().clone()),
            _ => return None,
        };
        Some(ElValue::Json(value))
    }

    fn invoke(&self, method: &str, args: &[ElValue]) -> Option<Result<ElValue, String>> {
        if let Some(result) = variable_method(self, method, args) {
            return Some(result);
        }
        let property = getter_name(method)?;
        self.get_property(&property).map(Ok)
    }

    fn to_json(&self) -> Value {
        json!({ "type": "Execution", "id": self.init.id })
    }
}

impl VariableScope for ExecutionEntity {
    fn kind(&self) -> ScopeKind {
        ScopeKind::Execution
    }

    fn scope_id(&self) -> String {
        self.init.id.clone()
    }

    fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    fn set_variable(&self, name: &str, value: Value) {
        self.variables.write().insert(name.to_string(), value);
    }

    fn variables(&self) -> Map<String, Value> {
        self.variables.read().clone()
    }

    fn as_bean(&self) -> Option<Arc<dyn Bean>> {
        self.arc().map(|e| e as Arc<dyn Bean>)
    }

    fn authenticated_user_id(&self) -> Option<String> {
        self.init.authenticated_user_id.clone()
    }

    fn authenticated_group_ids(&self) -> Vec<String> {
        self.init.authenticated_group_ids.clone()
    }

    fn process_application(&self) -> Option<ProcessApplicationReference> {
        self.init.process_application.clone()
    }

    fn el_context_cache(&self) -> Option<&ElContextCache> {
        Some(&self.el_context)
    }
}

/// Mutable part of a task
#[derive(Debug, Clone)]
pub struct TaskState {
    pub name: Option<String>,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub owner: Option<String>,
    pub priority: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub follow_up_date: Option<DateTime<Utc>>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            assignee: None,
            owner: None,
            priority: TaskEntity::DEFAULT_PRIORITY,
            due_date: None,
            follow_up_date: None,
        }
    }
}

/// Identity and initial state of a new task
#[derive(Debug, Clone, Default)]
pub struct TaskInit {
    pub id: String,
    pub task_definition_key: Option<String>,
    pub parent_task_id: Option<String>,
    pub execution: Option<Arc<ExecutionEntity>>,
    pub case_execution: Option<Arc<CaseExecutionEntity>>,
    pub state: TaskState,
}

/// Human task, bound to an execution or a case execution
#[derive(Debug)]
pub struct TaskEntity {
    init: TaskInit,
    state: RwLock<TaskState>,
    local_variables: RwLock<Map<String, Value>>,
    el_context: ElContextCache,
    self_ref: Weak<TaskEntity>,
}

impl TaskEntity {
    pub const DEFAULT_PRIORITY: i32 = 50;

    /// Wrap `init` in a shared entity
    pub fn create(mut init: TaskInit) -> Arc<Self> {
        let state = std::mem::take(&mut init.state);
        Arc::new_cyclic(|self_ref| Self {
            init,
            state: RwLock::new(state),
            local_variables: RwLock::new(Map::new()),
            el_context: ElContextCache::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Task id
    pub fn id(&self) -> &str {
        &self.init.id
    }

    /// Activity that created the task
    pub fn task_definition_key(&self) -> Option<&str> {
        self.init.task_definition_key.as_deref()
    }

    /// Parent task id
    pub fn parent_task_id(&self) -> Option<&str> {
        self.init.parent_task_id.as_deref()
    }

    /// Process execution of the task
    pub fn execution_entity(&self) -> Option<&Arc<ExecutionEntity>> {
        self.init.execution.as_ref()
    }

    /// Case execution of the task
    pub fn case_execution_entity(&self) -> Option<&Arc<CaseExecutionEntity>> {
        self.init.case_execution.as_ref()
    }

    /// Copy of the mutable state
    pub fn state(&self) -> TaskState {
        self.state.read().clone()
    }

    /// Mutate state under the write lock
    pub fn update_state<R>(&self, update: impl FnOnce(&mut TaskState) -> R) -> R {
        update(&mut self.state.write())
    }

    /// Set a task-local variable
    pub fn set_local_variable(&self, name: &str, value: Value) {
        self.local_variables.write().insert(name.to_string(), value);
    }

    /// Variable scope the task writes through to
    fn parent_scope(&self) -> Option<&dyn VariableScope> {
        if let Some(execution) = &self.init.execution {
            return Some(execution.as_ref());
        }
        self.init
            .case_execution
            .as_ref()
            .map(|c| c.as_ref() as &dyn VariableScope)
    }
}

impl Bean for TaskEntity {
    fn type_name(&self) -> &str {
        "Task"
    }

    fn get_property(&self, name: &str) -> Option<ElValue> {
        let state = self.state.read();
        let execution = self.init.execution.as_ref();
        let value = match name {
            "id" => json!(self.init.id),
            "name" => text(state.name.as_deref()),
            "description" => text(state.description.as_deref()),
            "assignee" => text(state.assignee.as_deref()),
            "owner" => text(state.owner.as_deref()),
            "priority" => json!(state.priority),
            "dueDate" => text(state.due_date.map(|d| d.to_rfc3339()).as_deref()),
            "taskDefinitionKey" => text(self.task_definition_key()),
            "executionId" => text(execution.map(|e| e.id())),
            "processInstanceId" => text(execution.map(|e| e.process_instance_id())),
            "processDefinitionId" => text(execution.map(|e| e.process_definition_id())),
            "caseInstanceId" => text(
                self.init
                    .case_execution
                    .as_ref()
                    .map(|c| c.case_instance_id()),
            ),
            _ => return None,
        };
        Some(ElValue::Json(value))
    }

    fn set_property(&self, name: &str, value: Value) -> bool {
        let as_text = value.as_str().map(str::to_string);
        let mut state = self.state.write();
        match name {
            "name" => state.name = as_text,
            "description" => state.description = as_text,
            "assignee" => state.assignee = as_text,
            "owner" => state.owner = as_text,
            "priority" => match value.as_i64().and_then(|p| i32::try_from(p).ok()) {
                Some(priority) => state.priority = priority,
                None => return false,
            },
            _ => return false,
        }
        true
    }

    fn invoke(&self, method: &str, args: &[ElValue]) -> Option<Result<ElValue, String>> {
        if let Some(result) = variable_method(self, method, args) {
            return Some(result);
        }
        if let Some(property) = method.strip_prefix("set") {
            let property = getter_name(&format!("get{}", property))?;
            let value = args.first().map(ElValue::to_json).unwrap_or(Value::Null);
            return Some(if self.set_property(&property, value) {
                Ok(ElValue::null())
            } else {
                Err(format!("Cannot set '{}' on task {}", property, self.init.id))
            });
        }
        let property = getter_name(method)?;
        self.get_property(&property).map(Ok)
    }

    fn to_json(&self) -> Value {
        json!({ "type": "Task", "id": self.init.id })
    }
}

impl VariableScope for TaskEntity {
    fn kind(&self) -> ScopeKind {
        ScopeKind::Task
    }

    fn scope_id(&self) -> String {
        self.init.id.clone()
    }

    fn get_variable(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.local_variables.read().get(name) {
            return Some(value.clone());
        }
        self.parent_scope().and_then(|p| p.get_variable(name))
    }

    fn set_variable(&self, name: &str, value: Value) {
        if self.local_variables.read().contains_key(name) {
            self.set_local_variable(name, value);
            return;
        }
        match self.parent_scope() {
            Some(parent) => parent.set_variable(name, value),
            None => self.set_local_variable(name, value),
        }
    }

    fn variables(&self) -> Map<String, Value> {
        let mut variables = self
            .parent_scope()
            .map(|p| p.variables())
            .unwrap_or_default();
        for (name, value) in self.local_variables.read().iter() {
            variables.insert(name.clone(), value.clone());
        }
        variables
    }

    fn as_bean(&self) -> Option<Arc<dyn Bean>> {
        self.self_ref.upgrade().map(|t| t as Arc<dyn Bean>)
    }

    fn execution(&self) -> Option<Arc<dyn Bean>> {
        self.init
            .execution
            .as_ref()
            .map(|e| Arc::clone(e) as Arc<dyn Bean>)
    }

    fn case_execution(&self) -> Option<Arc<dyn Bean>> {
        self.init
            .case_execution
            .as_ref()
            .map(|c| Arc::clone(c) as Arc<dyn Bean>)
    }

    fn authenticated_user_id(&self) -> Option<String> {
        self.parent_scope().and_then(|p| p.authenticated_user_id())
    }

    fn authenticated_group_ids(&self) -> Vec<String> {
        self.parent_scope()
            .map(|p| p.authenticated_group_ids())
            .unwrap_or_default()
    }

    fn process_application(&self) -> Option<ProcessApplicationReference> {
        self.parent_scope().and_then(|p| p.process_application())
    }

    fn el_context_cache(&self) -> Option<&ElContextCache> {
        Some(&self.el_context)
    }
}

/// CMMN plan item state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseExecutionState {
    #[default]
    Available,
    Enabled,
    Disabled,
    Active,
    Suspended,
    Terminated,
    Completed,
    Failed,
    Closed,
}

impl CaseExecutionState {
    /// Numeric code stored with history
    pub fn code(&self) -> i32 {
        match self {
            CaseExecutionState::Available => 1,
            CaseExecutionState::Enabled => 2,
            CaseExecutionState::Disabled => 3,
            CaseExecutionState::Active => 4,
            CaseExecutionState::Suspended => 5,
            CaseExecutionState::Terminated => 6,
            CaseExecutionState::Completed => 7,
            CaseExecutionState::Failed => 8,
            CaseExecutionState::Closed => 9,
        }
    }
}

/// Identity of a new case execution
#[derive(Debug, Clone, Default)]
pub struct CaseExecutionInit {
    pub id: String,
    pub case_instance_id: String,
    pub case_definition_id: String,
    pub case_definition_key: String,
    pub business_key: Option<String>,
    pub parent_id: Option<String>,
    pub activity: Option<ActivityRef>,
    pub super_process_instance_id: Option<String>,
    pub super_case_instance_id: Option<String>,
    pub create_user_id: Option<String>,
    pub required: bool,
}

/// Mutable part of a case execution
#[derive(Debug, Clone, Default)]
pub struct CaseExecutionStatus {
    pub current_state: CaseExecutionState,
    pub task_id: Option<String>,
    pub sub_process_instance_id: Option<String>,
    pub sub_case_instance_id: Option<String>,
}

/// Case instance or case plan item
#[derive(Debug)]
pub struct CaseExecutionEntity {
    init: CaseExecutionInit,
    status: RwLock<CaseExecutionStatus>,
    variables: RwLock<Map<String, Value>>,
    el_context: ElContextCache,
    self_ref: Weak<CaseExecutionEntity>,
}

impl CaseExecutionEntity {
    /// Wrap `init` in a shared entity
    pub fn create(init: CaseExecutionInit) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            init,
            status: RwLock::new(CaseExecutionStatus::default()),
            variables: RwLock::new(Map::new()),
            el_context: ElContextCache::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Case execution id
    pub fn id(&self) -> &str {
        &self.init.id
    }

    /// Case instance id
    pub fn case_instance_id(&self) -> &str {
        &self.init.case_instance_id
    }

    /// Case definition id
    pub fn case_definition_id(&self) -> &str {
        &self.init.case_definition_id
    }

    /// Case definition key
    pub fn case_definition_key(&self) -> &str {
        &self.init.case_definition_key
    }

    /// Business key
    pub fn business_key(&self) -> Option<&str> {
        self.init.business_key.as_deref()
    }

    /// Parent case execution
    pub fn parent_id(&self) -> Option<&str> {
        self.init.parent_id.as_deref()
    }

    /// Plan item this execution runs
    pub fn activity(&self) -> Option<&ActivityRef> {
        self.init.activity.as_ref()
    }

    /// Calling process instance
    pub fn super_process_instance_id(&self) -> Option<&str> {
        self.init.super_process_instance_id.as_deref()
    }

    /// Calling case instance
    pub fn super_case_instance_id(&self) -> Option<&str> {
        self.init.super_case_instance_id.as_deref()
    }

    /// User who created the case
    pub fn create_user_id(&self) -> Option<&str> {
        self.init.create_user_id.as_deref()
    }

    /// Whether the plan item is required
    pub fn is_required(&self) -> bool {
        self.init.required
    }

    /// Whether this execution is the case instance
    pub fn is_case_instance(&self) -> bool {
        self.init.id == self.init.case_instance_id
    }

    /// Copy of the status
    pub fn status(&self) -> CaseExecutionStatus {
        self.status.read().clone()
    }

    /// Mutate status under the write lock
    pub fn update_status<R>(&self, update: impl FnOnce(&mut CaseExecutionStatus) -> R) -> R {
        update(&mut self.status.write())
    }
}

impl Bean for CaseExecutionEntity {
    fn type_name(&self) -> &str {
        "CaseExecution"
    }

    fn get_property(&self, name: &str) -> Option<ElValue> {
        let value = match name {
            "id" => json!(self.init.id),
            "caseInstanceId" => json!(self.init.case_instance_id),
            "caseDefinitionId" => json!(self.init.case_definition_id),
            "businessKey" | "caseBusinessKey" => text(self.business_key()),
            "activityId" => text(self.init.activity.as_ref().map(|a| a.id.as_str())),
            "activityName" => text(self.init.activity.as_ref().and_then(|a| a.name.as_deref())),
            "currentState" => json!(self.status.read().current_state),
            "variables" => Value::Object(self.variables.read().clone()),
            _ => return None,
        };
        Some(ElValue::Json(value))
    }

    fn invoke(&self, method: &str, args: &[ElValue]) -> Option<Result<ElValue, String>> {
        if let Some(result) = variable_method(self, method, args) {
            return Some(result);
        }
        let property = getter_name(method)?;
        self.get_property(&property).map(Ok)
    }

    fn to_json(&self) -> Value {
        json!({ "type": "CaseExecution", "id": self.init.id })
    }
}

impl VariableScope for CaseExecutionEntity {
    fn kind(&self) -> ScopeKind {
        ScopeKind::CaseExecution
    }

    fn scope_id(&self) -> String {
        self.init.id.clone()
    }

    fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    fn set_variable(&self, name: &str, value: Value) {
        self.variables.write().insert(name.to_string(), value);
    }

    fn variables(&self) -> Map<String, Value> {
        self.variables.read().clone()
    }

    fn as_bean(&self) -> Option<Arc<dyn Bean>> {
        self.self_ref.upgrade().map(|c| c as Arc<dyn Bean>)
    }

    fn authenticated_user_id(&self) -> Option<String> {
        self.init.create_user_id.clone()
    }

    fn el_context_cache(&self) -> Option<&ElContextCache> {
        Some(&self.el_context)
    }
}

/// Unit of work fetched by an external worker
#[derive(Debug)]
pub struct ExternalTaskEntity {
    id: String,
    topic_name: String,
    worker_id: RwLock<Option<String>>,
    execution: Arc<ExecutionEntity>,
    el_context: ElContextCache,
    self_ref: Weak<ExternalTaskEntity>,
}

impl ExternalTaskEntity {
    /// Topic task bound to `execution`
    pub fn create(id: String, topic_name: String, execution: Arc<ExecutionEntity>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            topic_name,
            worker_id: RwLock::new(None),
            execution,
            el_context: ElContextCache::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// External task id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Topic name
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// Lock the task for `worker_id`
    pub fn lock(&self, worker_id: &str) {
        *self.worker_id.write() = Some(worker_id.to_string());
    }
}

impl Bean for ExternalTaskEntity {
    fn type_name(&self) -> &str {
        "ExternalTask"
    }

    fn get_property(&self, name: &str) -> Option<ElValue> {
        let value = match name {
            "id" => json!(self.id),
            "topicName" => json!(self.topic_name),
            "workerId" => text(self.worker_id.read().as_deref()),
            "executionId" => json!(self.execution.id()),
            "processInstanceId" => json!(self.execution.process_instance_id()),
            "activityId" => text(self.execution.current_activity_id().as_deref()),
            _ => return None,
        };
        Some(ElValue::Json(value))
    }

    fn invoke(&self, method: &str, _args: &[ElValue]) -> Option<Result<ElValue, String>> {
        let property = getter_name(method)?;
        self.get_property(&property).map(Ok)
    }
}

impl VariableScope for ExternalTaskEntity {
    fn kind(&self) -> ScopeKind {
        ScopeKind::ExternalTask
    }

    fn scope_id(&self) -> String {
        self.id.clone()
    }

    fn get_variable(&self, name: &str) -> Option<Value> {
        self.execution.get_variable(name)
    }

    fn set_variable(&self, name: &str, value: Value) {
        self.execution.set_variable(name, value)
    }

    fn variables(&self) -> Map<String, Value> {
        self.execution.variables()
    }

    fn as_bean(&self) -> Option<Arc<dyn Bean>> {
        self.self_ref.upgrade().map(|t| t as Arc<dyn Bean>)
    }

    fn execution(&self) -> Option<Arc<dyn Bean>> {
        Some(Arc::clone(&self.execution) as Arc<dyn Bean>)
    }

    fn authenticated_user_id(&self) -> Option<String> {
        self.execution.authenticated_user_id()
    }

    fn process_application(&self) -> Option<ProcessApplicationReference> {
        self.execution.process_application()
    }

    fn el_context_cache(&self) -> Option<&ElContextCache> {
        Some(&self.el_context)
    }
}

/// Input value of an evaluated decision
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedInput {
    pub clause_id: String,
    pub clause_name: Option<String>,
    pub value: Value,
}

/// Output value of a matched rule
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedOutput {
    pub clause_id: String,
    pub clause_name: Option<String>,
    pub output_name: Option<String>,
    pub value: Value,
}

/// Rule that matched with its outputs
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRule {
    pub rule_id: String,
    pub outputs: Vec<EvaluatedOutput>,
}

/// Outcome of one decision table evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionEvaluation {
    pub decision_definition_id: String,
    pub decision_definition_key: String,
    pub decision_definition_name: Option<String>,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub activity_id: Option<String>,
    pub activity_instance_id: Option<String>,
    pub case_instance_id: Option<String>,
    pub user_id: Option<String>,
    pub inputs: Vec<EvaluatedInput>,
    pub matched_rules: Vec<MatchedRule>,
    /// Aggregated result of a `collect` hit policy, any numeric width
    pub collect_result_value: Option<serde_json::Number>,
}

/// Stored incident
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IncidentEntity {
    pub id: String,
    pub incident_type: String,
    pub incident_message: Option<String>,
    pub incident_timestamp: DateTime<Utc>,
    pub activity_id: Option<String>,
    pub failed_activity_id: Option<String>,
    pub execution_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub cause_incident_id: Option<String>,
    pub root_cause_incident_id: Option<String>,
    /// Id of the failed job for `failedJob` incidents
    pub configuration: Option<String>,
}

impl IncidentEntity {
    pub const FAILED_JOB: &'static str = "failedJob";
}

/// Persistent job row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobEntity {
    pub id: String,
    pub revision: i64,
    pub job_type: String,
    pub handler_configuration: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub retries: i32,
    pub priority: i64,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub exception_message: Option<String>,
    pub activity_id: Option<String>,
    pub execution_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub deployment_id: Option<String>,
    pub sequence_counter: i64,
}

impl JobEntity {
    pub const DEFAULT_RETRIES: i32 = 3;
    pub const ASYNC_CONTINUATION: &'static str = "async-continuation";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> Arc<ExecutionEntity> {
        let mut variables = Map::new();
        variables.insert("amount".to_string(), json!(10));
        ExecutionEntity::create(ExecutionInit {
            id: "pi-1".to_string(),
            process_instance_id: "pi-1".to_string(),
            process_definition_id: "order:1:abc".to_string(),
            process_definition_key: "order".to_string(),
            variables,
            ..Default::default()
        })
    }

    #[test]
    fn test_execution_bean_exposes_variables() {
        let execution = execution();
        let bean = execution.as_bean().unwrap();

        let value = bean.invoke("getVariable", &[ElValue::Json(json!("amount"))]);
        assert_eq!(value.unwrap().unwrap().into_json(), json!(10));

        bean.invoke("setVariable", &[ElValue::Json(json!("approved")), ElValue::Json(json!(true))]);
        assert_eq!(execution.get_variable("approved"), Some(json!(true)));
        assert_eq!(bean.get_property("processDefinitionKey").unwrap().into_json(), json!("order"));
    }

    #[test]
    fn test_task_writes_through_to_execution() {
        let execution = execution();
        let task = TaskEntity::create(TaskInit {
            id: "task-1".to_string(),
            execution: Some(Arc::clone(&execution)),
            ..Default::default()
        });

        task.set_variable("amount", json!(11));
        assert_eq!(execution.get_variable("amount"), Some(json!(11)));

        task.set_local_variable("note", json!("local"));
        task.set_variable("note", json!("changed"));
        assert_eq!(execution.get_variable("note"), None);
        assert_eq!(task.get_variable("note"), Some(json!("changed")));
    }

    #[test]
    fn test_task_bean_setters() {
        let task = TaskEntity::create(TaskInit {
            id: "task-1".to_string(),
            ..Default::default()
        });
        let bean = task.as_bean().unwrap();
        assert!(bean.invoke("setAssignee", &[ElValue::Json(json!("kermit"))]).unwrap().is_ok());
        assert_eq!(task.state().assignee.as_deref(), Some("kermit"));
        assert_eq!(task.state().priority, TaskEntity::DEFAULT_PRIORITY);
    }

    #[test]
    fn test_enter_activity_advances_sequence_counter() {
        let execution = execution();
        execution.enter_activity(
            ActivityRef {
                id: "start".to_string(),
                name: None,
                activity_type: "startEvent".to_string(),
            },
            "start:1".to_string(),
        );
        execution.enter_activity(
            ActivityRef {
                id: "review".to_string(),
                name: Some("Review".to_string()),
                activity_type: "userTask".to_string(),
            },
            "review:2".to_string(),
        );

        let state = execution.state();
        assert_eq!(state.sequence_counter, 2);
        assert_eq!(state.activity_instance_id.as_deref(), Some("review:2"));
        assert_eq!(execution.current_activity_id().as_deref(), Some("review"));
    }
}
