/// Variable scopes and values seen by the expression language
///
/// A variable scope is any runtime entity owning named variables (execution,
/// task, case execution, external task). Values are JSON, except for host
/// objects exposed as beans with properties and methods.

use crate::engine::application::ProcessApplicationReference;
use crate::expression::resolver::ElContext;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

/// Runtime type of a scope, used to disambiguate reserved identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Execution,
    Task,
    CaseExecution,
    ExternalTask,
    Other,
}

/// Host object reachable from expressions
pub trait Bean: Send + Sync + Debug {
    fn type_name(&self) -> &str;

    /// `None` when the bean has no such property
    fn get_property(&self, name: &str) -> Option<ElValue>;

    /// `true` when the property was written
    fn set_property(&self, _name: &str, _value: Value) -> bool {
        false
    }

    /// `None` when the bean has no such method, `Some(Err)` when the call failed
    fn invoke(&self, _method: &str, _args: &[ElValue]) -> Option<Result<ElValue, String>> {
        None
    }

    fn to_json(&self) -> Value {
        Value::String(self.type_name().to_string())
    }
}

/// Value produced or consumed by an expression
#[derive(Debug, Clone)]
pub enum ElValue {
    Json(Value),
    Bean(Arc<dyn Bean>),
}

impl ElValue {
    /// JSON null
    pub fn null() -> Self {
        ElValue::Json(Value::Null)
    }

    /// JSON payload, `None` for beans
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ElValue::Json(value) => Some(value),
            ElValue::Bean(_) => None,
        }
    }

    /// Whether the value is JSON null
    pub fn is_null(&self) -> bool {
        matches!(self, ElValue::Json(Value::Null))
    }

    /// JSON copy of the value
    pub fn to_json(&self) -> Value {
        match self {
            ElValue::Json(value) => value.clone(),
            ElValue::Bean(bean) => bean.to_json(),
        }
    }

    /// Convert into JSON
    pub fn into_json(self) -> Value {
        match self {
            ElValue::Json(value) => value,
            ElValue::Bean(bean) => bean.to_json(),
        }
    }
}

impl From<Value> for ElValue {
    fn from(value: Value) -> Self {
        ElValue::Json(value)
    }
}

impl From<Arc<dyn Bean>> for ElValue {
    fn from(bean: Arc<dyn Bean>) -> Self {
        ElValue::Bean(bean)
    }
}

/// Slot holding the resolved evaluation context of one scope
///
/// Filled on first evaluation and dropped together with the owning scope.
#[derive(Debug, Default)]
pub struct ElContextCache {
    slot: OnceLock<Arc<ElContext>>,
}

impl ElContextCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached context, built by `init` on first use
    pub fn get_or_init(&self, init: impl FnOnce() -> Arc<ElContext>) -> Arc<ElContext> {
        Arc::clone(self.slot.get_or_init(init))
    }

    /// Whether a context was built
    pub fn is_populated(&self) -> bool {
        self.slot.get().is_some()
    }
}

/// Entity owning named variables that expressions read and write
pub trait VariableScope: Send + Sync + Debug {
    fn kind(&self) -> ScopeKind;

    fn scope_id(&self) -> String;

    fn get_variable(&self, name: &str) -> Option<Value>;

    fn has_variable(&self, name: &str) -> bool {
        self.get_variable(name).is_some()
    }

    fn set_variable(&self, name: &str, value: Value);

    fn variables(&self) -> Map<String, Value>;

    /// The scope itself as a bean, if it can be exposed
    fn as_bean(&self) -> Option<Arc<dyn Bean>> {
        None
    }

    /// Execution related to this scope (a task's execution, for example)
    fn execution(&self) -> Option<Arc<dyn Bean>> {
        None
    }

    /// Case execution related to this scope
    fn case_execution(&self) -> Option<Arc<dyn Bean>> {
        None
    }

    fn authenticated_user_id(&self) -> Option<String> {
        None
    }

    fn authenticated_group_ids(&self) -> Vec<String> {
        Vec::new()
    }

    /// Process application owning the deployment this scope runs in
    fn process_application(&self) -> Option<ProcessApplicationReference> {
        None
    }

    fn el_context_cache(&self) -> Option<&ElContextCache> {
        None
    }
}

/// Map-backed scope for standalone evaluation
#[derive(Debug, Default)]
pub struct SimpleVariableScope {
    id: String,
    variables: RwLock<Map<String, Value>>,
    authenticated_user_id: Option<String>,
    authenticated_group_ids: Vec<String>,
    process_application: Option<ProcessApplicationReference>,
    el_context: ElContextCache,
}

impl SimpleVariableScope {
    /// Empty scope named `id`
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Scope with one more variable
    pub fn with_variable(self, name: &str, value: Value) -> Self {
        self.variables.write().insert(name.to_string(), value);
        self
    }

    /// Scope acting for `user_id` in `groups`
    pub fn with_authenticated_user(mut self, user_id: &str, groups: &[&str]) -> Self {
        self.authenticated_user_id = Some(user_id.to_string());
        self.authenticated_group_ids = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    /// Scope belonging to a process application
    pub fn with_process_application(mut self, reference: ProcessApplicationReference) -> Self {
        self.process_application = Some(reference);
        self
    }
}

impl VariableScope for SimpleVariableScope {
    fn kind(&self) -> ScopeKind {
        ScopeKind::Other
    }

    fn scope_id(&self) -> String {
        self.id.clone()
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

    fn authenticated_user_id(&self) -> Option<String> {
        self.authenticated_user_id.clone()
    }

    fn authenticated_group_ids(&self) -> Vec<String> {
        self.authenticated_group_ids.clone()
    }

    fn process_application(&self) -> Option<ProcessApplicationReference> {
        self.process_application.clone()
    }

    fn el_context_cache(&self) -> Option<&ElContextCache> {
        Some(&self.el_context)
    }
}
