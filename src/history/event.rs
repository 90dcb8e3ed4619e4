/// History event records
///
/// One record type per entity kind. Records are plain data: the producer
/// fills them, a handler persists them.

use crate::config::HistoryLevel;
use crate::runtime::entity::{ActivityInstanceState, CaseExecutionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryEventType {
    #[default]
    ProcessInstanceStart,
    ProcessInstanceUpdate,
    ProcessInstanceEnd,
    ActivityInstanceStart,
    ActivityInstanceUpdate,
    ActivityInstanceEnd,
    TaskInstanceCreate,
    TaskInstanceUpdate,
    TaskInstanceComplete,
    CaseInstanceCreate,
    CaseInstanceUpdate,
    CaseInstanceClose,
    CaseActivityInstanceCreate,
    CaseActivityInstanceUpdate,
    CaseActivityInstanceEnd,
    DecisionInstanceEvaluate,
    IncidentCreate,
    IncidentResolve,
    IncidentDelete,
    JobCreate,
    JobFail,
    JobSuccess,
    JobDelete,
}

impl HistoryEventType {
    /// Short lifecycle name stored with the event
    pub fn event_name(&self) -> &'static str {
        use HistoryEventType::*;
        match self {
            ProcessInstanceStart | ActivityInstanceStart => "start",
            ProcessInstanceUpdate | ActivityInstanceUpdate | TaskInstanceUpdate
            | CaseInstanceUpdate | CaseActivityInstanceUpdate => "update",
            ProcessInstanceEnd | ActivityInstanceEnd | CaseActivityInstanceEnd => "end",
            TaskInstanceCreate | CaseInstanceCreate | CaseActivityInstanceCreate
            | IncidentCreate | JobCreate => "create",
            TaskInstanceComplete => "complete",
            CaseInstanceClose => "close",
            DecisionInstanceEvaluate => "evaluate",
            IncidentResolve => "resolve",
            IncidentDelete | JobDelete => "delete",
            JobFail => "failed",
            JobSuccess => "successful",
        }
    }
}

/// Entity a history event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEntityKind {
    ProcessInstance,
    ActivityInstance,
    TaskInstance,
    CaseInstance,
    CaseActivityInstance,
    DecisionInstance,
    Incident,
    JobLog,
}

impl HistoryEntityKind {
    /// Lowercase entity name
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryEntityKind::ProcessInstance => "process_instance",
            HistoryEntityKind::ActivityInstance => "activity_instance",
            HistoryEntityKind::TaskInstance => "task_instance",
            HistoryEntityKind::CaseInstance => "case_instance",
            HistoryEntityKind::CaseActivityInstance => "case_activity_instance",
            HistoryEntityKind::DecisionInstance => "decision_instance",
            HistoryEntityKind::Incident => "incident",
            HistoryEntityKind::JobLog => "job_log",
        }
    }

    /// Lowest history level that records this kind
    pub fn minimum_level(&self) -> HistoryLevel {
        match self {
            HistoryEntityKind::ProcessInstance
            | HistoryEntityKind::ActivityInstance
            | HistoryEntityKind::TaskInstance
            | HistoryEntityKind::CaseInstance
            | HistoryEntityKind::CaseActivityInstance => HistoryLevel::Activity,
            HistoryEntityKind::JobLog => HistoryLevel::Audit,
            HistoryEntityKind::DecisionInstance | HistoryEntityKind::Incident => HistoryLevel::Full,
        }
    }

    /// Whether events of this kind are kept at `level`
    pub fn is_recorded_at(&self, level: HistoryLevel) -> bool {
        level >= self.minimum_level()
    }
}

/// Final state of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessInstanceState {
    Active,
    Suspended,
    Completed,
    ExternallyTerminated,
    InternallyTerminated,
}

/// Incident state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    #[default]
    Open,
    Resolved,
    Deleted,
}

/// Job log state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Created,
    Failed,
    Successful,
    Deleted,
}

/// Value snapshot tagged with its type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    pub type_name: String,
    pub value: Value,
}

impl From<&Value> for TypedValue {
    fn from(value: &Value) -> Self {
        let type_name = match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_i64() || n.is_u64() => "long",
            Value::Number(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) | Value::Object(_) => "json",
        };
        Self {
            type_name: type_name.to_string(),
            value: value.clone(),
        }
    }
}

/// Process instance start, update or end
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricProcessInstanceEvent {
    pub id: String,
    pub event_type: HistoryEventType,
    pub process_instance_id: String,
    pub execution_id: String,
    pub process_definition_id: String,
    pub process_definition_key: String,
    pub business_key: Option<String>,
    pub case_instance_id: Option<String>,
    pub super_process_instance_id: Option<String>,
    pub super_case_instance_id: Option<String>,
    pub start_user_id: Option<String>,
    pub start_activity_id: Option<String>,
    pub end_activity_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_in_millis: Option<i64>,
    pub state: Option<ProcessInstanceState>,
    pub delete_reason: Option<String>,
}

/// Activity instance lifecycle
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricActivityInstanceEvent {
    pub id: String,
    pub event_type: HistoryEventType,
    pub activity_instance_id: String,
    pub parent_activity_instance_id: Option<String>,
    pub process_definition_id: String,
    pub process_definition_key: String,
    pub process_instance_id: String,
    pub execution_id: String,
    pub activity_id: Option<String>,
    pub activity_name: Option<String>,
    pub activity_type: Option<String>,
    pub called_process_instance_id: Option<String>,
    pub called_case_instance_id: Option<String>,
    pub task_id: Option<String>,
    pub task_assignee: Option<String>,
    pub activity_instance_state: Option<ActivityInstanceState>,
    pub sequence_counter: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_in_millis: Option<i64>,
}

/// User task lifecycle
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricTaskInstanceEvent {
    pub id: String,
    pub event_type: HistoryEventType,
    pub task_id: String,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub activity_instance_id: Option<String>,
    pub case_definition_id: Option<String>,
    pub case_definition_key: Option<String>,
    pub case_instance_id: Option<String>,
    pub case_execution_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub owner: Option<String>,
    pub priority: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub follow_up_date: Option<DateTime<Utc>>,
    pub parent_task_id: Option<String>,
    pub task_definition_key: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_in_millis: Option<i64>,
    pub delete_reason: Option<String>,
}

/// Case instance lifecycle
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricCaseInstanceEvent {
    pub id: String,
    pub event_type: HistoryEventType,
    pub case_instance_id: String,
    pub case_definition_id: String,
    pub case_definition_key: String,
    pub business_key: Option<String>,
    pub create_user_id: Option<String>,
    pub super_case_instance_id: Option<String>,
    pub super_process_instance_id: Option<String>,
    pub state: CaseExecutionState,
    pub create_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub duration_in_millis: Option<i64>,
}

/// Case activity lifecycle
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricCaseActivityInstanceEvent {
    pub id: String,
    pub event_type: HistoryEventType,
    pub case_activity_instance_id: String,
    pub parent_case_activity_instance_id: Option<String>,
    pub case_instance_id: String,
    pub case_definition_id: String,
    pub case_activity_id: Option<String>,
    pub case_activity_name: Option<String>,
    pub case_activity_type: Option<String>,
    pub task_id: Option<String>,
    pub called_process_instance_id: Option<String>,
    pub called_case_instance_id: Option<String>,
    pub state: CaseExecutionState,
    pub required: bool,
    pub create_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_in_millis: Option<i64>,
}

/// Evaluated decision input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricDecisionInput {
    pub clause_id: String,
    pub clause_name: Option<String>,
    pub value: TypedValue,
}

/// Evaluated decision output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricDecisionOutput {
    pub clause_id: String,
    pub clause_name: Option<String>,
    pub rule_id: String,
    /// 1-based position among the matched rules
    pub rule_order: u32,
    pub variable_name: Option<String>,
    pub value: TypedValue,
}

/// Decision evaluation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricDecisionInstanceEvent {
    pub id: String,
    pub event_type: HistoryEventType,
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
    pub evaluation_time: Option<DateTime<Utc>>,
    pub inputs: Vec<HistoricDecisionInput>,
    pub outputs: Vec<HistoricDecisionOutput>,
    pub collect_result_value: Option<f64>,
}

/// Incident lifecycle
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricIncidentEvent {
    pub id: String,
    pub event_type: HistoryEventType,
    pub incident_type: String,
    pub incident_message: Option<String>,
    pub activity_id: Option<String>,
    pub failed_activity_id: Option<String>,
    pub execution_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub cause_incident_id: Option<String>,
    pub root_cause_incident_id: Option<String>,
    pub configuration: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub incident_state: IncidentState,
}

/// Job lifecycle log entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoricJobLogEvent {
    pub id: String,
    pub event_type: HistoryEventType,
    pub timestamp: Option<DateTime<Utc>>,
    pub job_id: String,
    pub job_type: String,
    pub job_due_date: Option<DateTime<Utc>>,
    pub job_retries: i32,
    pub job_priority: i64,
    pub job_exception_message: Option<String>,
    pub activity_id: Option<String>,
    pub execution_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub deployment_id: Option<String>,
    pub sequence_counter: i64,
    pub state: JobState,
}

/// Any history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    ProcessInstance(HistoricProcessInstanceEvent),
    ActivityInstance(HistoricActivityInstanceEvent),
    TaskInstance(HistoricTaskInstanceEvent),
    CaseInstance(HistoricCaseInstanceEvent),
    CaseActivityInstance(HistoricCaseActivityInstanceEvent),
    DecisionInstance(HistoricDecisionInstanceEvent),
    Incident(HistoricIncidentEvent),
    JobLog(HistoricJobLogEvent),
}

impl HistoryEvent {
    /// Entity kind
    pub fn kind(&self) -> HistoryEntityKind {
        match self {
            HistoryEvent::ProcessInstance(_) => HistoryEntityKind::ProcessInstance,
            HistoryEvent::ActivityInstance(_) => HistoryEntityKind::ActivityInstance,
            HistoryEvent::TaskInstance(_) => HistoryEntityKind::TaskInstance,
            HistoryEvent::CaseInstance(_) => HistoryEntityKind::CaseInstance,
            HistoryEvent::CaseActivityInstance(_) => HistoryEntityKind::CaseActivityInstance,
            HistoryEvent::DecisionInstance(_) => HistoryEntityKind::DecisionInstance,
            HistoryEvent::Incident(_) => HistoryEntityKind::Incident,
            HistoryEvent::JobLog(_) => HistoryEntityKind::JobLog,
        }
    }

    /// Entity id
    pub fn id(&self) -> &str {
        match self {
            HistoryEvent::ProcessInstance(e) => &e.id,
            HistoryEvent::ActivityInstance(e) => &e.id,
            HistoryEvent::TaskInstance(e) => &e.id,
            HistoryEvent::CaseInstance(e) => &e.id,
            HistoryEvent::CaseActivityInstance(e) => &e.id,
            HistoryEvent::DecisionInstance(e) => &e.id,
            HistoryEvent::Incident(e) => &e.id,
            HistoryEvent::JobLog(e) => &e.id,
        }
    }

    /// Event type
    pub fn event_type(&self) -> HistoryEventType {
        match self {
            HistoryEvent::ProcessInstance(e) => e.event_type,
            HistoryEvent::ActivityInstance(e) => e.event_type,
            HistoryEvent::TaskInstance(e) => e.event_type,
            HistoryEvent::CaseInstance(e) => e.event_type,
            HistoryEvent::CaseActivityInstance(e) => e.event_type,
            HistoryEvent::DecisionInstance(e) => e.event_type,
            HistoryEvent::Incident(e) => e.event_type,
            HistoryEvent::JobLog(e) => e.event_type,
        }
    }

    /// Owning process instance, if any
    pub fn process_instance_id(&self) -> Option<&str> {
        match self {
            HistoryEvent::ProcessInstance(e) => Some(&e.process_instance_id),
            HistoryEvent::ActivityInstance(e) => Some(&e.process_instance_id),
            HistoryEvent::TaskInstance(e) => e.process_instance_id.as_deref(),
            HistoryEvent::DecisionInstance(e) => e.process_instance_id.as_deref(),
            HistoryEvent::Incident(e) => e.process_instance_id.as_deref(),
            HistoryEvent::JobLog(e) => e.process_instance_id.as_deref(),
            HistoryEvent::CaseInstance(_) | HistoryEvent::CaseActivityInstance(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_levels_gate_entity_kinds() {
        assert!(!HistoryEntityKind::ProcessInstance.is_recorded_at(HistoryLevel::None));
        assert!(HistoryEntityKind::ActivityInstance.is_recorded_at(HistoryLevel::Activity));
        assert!(!HistoryEntityKind::JobLog.is_recorded_at(HistoryLevel::Activity));
        assert!(HistoryEntityKind::JobLog.is_recorded_at(HistoryLevel::Audit));
        assert!(!HistoryEntityKind::Incident.is_recorded_at(HistoryLevel::Audit));
        assert!(HistoryEntityKind::DecisionInstance.is_recorded_at(HistoryLevel::Full));
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = HistoryEvent::ProcessInstance(HistoricProcessInstanceEvent {
            id: "pi-1".to_string(),
            state: Some(ProcessInstanceState::Active),
            ..Default::default()
        });

        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["kind"], json!("process_instance"));
        assert_eq!(encoded["state"], json!("ACTIVE"));
        assert_eq!(encoded["event_type"], json!("process-instance-start"));
    }

    #[test]
    fn test_typed_value_names() {
        assert_eq!(TypedValue::from(&json!(3)).type_name, "long");
        assert_eq!(TypedValue::from(&json!(3.5)).type_name, "double");
        assert_eq!(TypedValue::from(&json!({"a": 1})).type_name, "json");
    }
}
