/// History event producer
///
/// Builds history records from runtime entities at lifecycle points. Events
/// for the same instance within one unit of work accumulate through the
/// `HistoryEventCache`; the producer never persists anything.

use crate::history::event::*;
use crate::runtime::clock::Clock;
use crate::runtime::entity::{
    CaseExecutionEntity, DecisionEvaluation, ExecutionEntity, IncidentEntity, JobEntity,
    TaskEntity,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// Events produced so far in the current unit of work, by kind and natural id
#[derive(Debug, Default)]
pub struct HistoryEventCache {
    events: Mutex<HashMap<(HistoryEntityKind, String), HistoryEvent>>,
}

impl HistoryEventCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached event for an entity
    pub fn get(&self, kind: HistoryEntityKind, id: &str) -> Option<HistoryEvent> {
        self.events.lock().get(&(kind, id.to_string())).cloned()
    }

    /// Cache `event` under its entity
    pub fn put(&self, event: &HistoryEvent) {
        self.events
            .lock()
            .insert((event.kind(), event.id().to_string()), event.clone());
    }

    /// Number of cached events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Builds history events from runtime entities
pub trait HistoryEventProducer: Send + Sync + Debug {
    fn process_instance_start(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent;
    fn process_instance_update(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent;
    fn process_instance_end(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent;

    fn activity_instance_start(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent;
    fn activity_instance_update(
        &self,
        cache: &HistoryEventCache,
        execution: &ExecutionEntity,
        task: Option<&TaskEntity>,
    ) -> HistoryEvent;
    fn activity_instance_end(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent;

    fn task_instance_create(&self, cache: &HistoryEventCache, task: &TaskEntity) -> HistoryEvent;
    fn task_instance_update(&self, cache: &HistoryEventCache, task: &TaskEntity) -> HistoryEvent;
    fn task_instance_complete(
        &self,
        cache: &HistoryEventCache,
        task: &TaskEntity,
        delete_reason: Option<&str>,
    ) -> HistoryEvent;

    fn case_instance_create(&self, cache: &HistoryEventCache, case: &CaseExecutionEntity) -> HistoryEvent;
    fn case_instance_update(&self, cache: &HistoryEventCache, case: &CaseExecutionEntity) -> HistoryEvent;
    fn case_instance_close(&self, cache: &HistoryEventCache, case: &CaseExecutionEntity) -> HistoryEvent;

    fn case_activity_instance_create(&self, cache: &HistoryEventCache, execution: &CaseExecutionEntity) -> HistoryEvent;
    fn case_activity_instance_update(&self, cache: &HistoryEventCache, execution: &CaseExecutionEntity) -> HistoryEvent;
    fn case_activity_instance_end(&self, cache: &HistoryEventCache, execution: &CaseExecutionEntity) -> HistoryEvent;

    fn decision_evaluated(&self, evaluation: &DecisionEvaluation) -> HistoryEvent;

    fn incident_create(&self, incident: &IncidentEntity) -> HistoryEvent;
    fn incident_resolve(&self, incident: &IncidentEntity) -> HistoryEvent;
    fn incident_delete(&self, incident: &IncidentEntity) -> HistoryEvent;

    fn job_log_created(&self, job: &JobEntity) -> HistoryEvent;
    fn job_log_failed(&self, job: &JobEntity, exception_message: &str) -> HistoryEvent;
    fn job_log_successful(&self, job: &JobEntity) -> HistoryEvent;
    fn job_log_deleted(&self, job: &JobEntity) -> HistoryEvent;
}

/// Producer reading time from an injected clock
#[derive(Debug, Clone)]
pub struct DefaultHistoryEventProducer {
    clock: Arc<dyn Clock>,
}

fn duration(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Option<i64> {
    start.map(|start| (end - start).num_milliseconds())
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

impl DefaultHistoryEventProducer {
    /// Producer stamping events with `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn finish(cache: &HistoryEventCache, event: HistoryEvent) -> HistoryEvent {
        cache.put(&event);
        event
    }

    fn load_process_instance(cache: &HistoryEventCache, id: &str) -> HistoricProcessInstanceEvent {
        match cache.get(HistoryEntityKind::ProcessInstance, id) {
            Some(HistoryEvent::ProcessInstance(event)) => event,
            _ => HistoricProcessInstanceEvent::default(),
        }
    }

    fn load_activity_instance(cache: &HistoryEventCache, id: &str) -> HistoricActivityInstanceEvent {
        match cache.get(HistoryEntityKind::ActivityInstance, id) {
            Some(HistoryEvent::ActivityInstance(event)) => event,
            _ => HistoricActivityInstanceEvent::default(),
        }
    }

    fn load_task_instance(cache: &HistoryEventCache, id: &str) -> HistoricTaskInstanceEvent {
        match cache.get(HistoryEntityKind::TaskInstance, id) {
            Some(HistoryEvent::TaskInstance(event)) => event,
            _ => HistoricTaskInstanceEvent::default(),
        }
    }

    fn load_case_instance(cache: &HistoryEventCache, id: &str) -> HistoricCaseInstanceEvent {
        match cache.get(HistoryEntityKind::CaseInstance, id) {
            Some(HistoryEvent::CaseInstance(event)) => event,
            _ => HistoricCaseInstanceEvent::default(),
        }
    }

    fn load_case_activity_instance(cache: &HistoryEventCache, id: &str) -> HistoricCaseActivityInstanceEvent {
        match cache.get(HistoryEntityKind::CaseActivityInstance, id) {
            Some(HistoryEvent::CaseActivityInstance(event)) => event,
            _ => HistoricCaseActivityInstanceEvent::default(),
        }
    }

    fn init_process_instance(
        evt: &mut HistoricProcessInstanceEvent,
        execution: &ExecutionEntity,
        event_type: HistoryEventType,
    ) {
        evt.id = execution.process_instance_id().to_string();
        evt.event_type = event_type;
        evt.process_instance_id = execution.process_instance_id().to_string();
        evt.execution_id = execution.id().to_string();
        evt.process_definition_id = execution.process_definition_id().to_string();
        evt.process_definition_key = execution.process_definition_key().to_string();
        evt.business_key = owned(execution.business_key());
        evt.case_instance_id = owned(execution.case_instance_id());
        evt.super_process_instance_id = owned(execution.super_process_instance_id());
        evt.super_case_instance_id = owned(execution.super_case_instance_id());
    }

    fn init_activity_instance(
        evt: &mut HistoricActivityInstanceEvent,
        execution: &ExecutionEntity,
        event_type: HistoryEventType,
    ) {
        let state = execution.state();
        let activity_instance_id = state
            .activity_instance_id
            .clone()
            .unwrap_or_else(|| execution.id().to_string());

        evt.id = activity_instance_id.clone();
        evt.event_type = event_type;
        evt.activity_instance_id = activity_instance_id;
        evt.parent_activity_instance_id = state.parent_activity_instance_id.clone();
        evt.process_definition_id = execution.process_definition_id().to_string();
        evt.process_definition_key = execution.process_definition_key().to_string();
        evt.process_instance_id = execution.process_instance_id().to_string();
        evt.execution_id = execution.id().to_string();

        if let Some(activity) = &state.activity {
            evt.activity_id = Some(activity.id.clone());
            evt.activity_name = activity.name.clone();
            evt.activity_type = Some(activity.activity_type.clone());
        }
        if let Some(called) = &state.sub_process_instance_id {
            evt.called_process_instance_id = Some(called.clone());
        }
        if let Some(called) = &state.sub_case_instance_id {
            evt.called_case_instance_id = Some(called.clone());
        }
    }

    fn init_task_instance(
        evt: &mut HistoricTaskInstanceEvent,
        task: &TaskEntity,
        event_type: HistoryEventType,
    ) {
        let state = task.state();
        evt.id = task.id().to_string();
        evt.event_type = event_type;
        evt.task_id = task.id().to_string();

        if let Some(execution) = task.execution_entity() {
            evt.process_definition_id = Some(execution.process_definition_id().to_string());
            evt.process_definition_key = Some(execution.process_definition_key().to_string());
            evt.process_instance_id = Some(execution.process_instance_id().to_string());
            evt.execution_id = Some(execution.id().to_string());
            evt.activity_instance_id = execution.state().activity_instance_id;
        }
        if let Some(case_execution) = task.case_execution_entity() {
            evt.case_definition_id = Some(case_execution.case_definition_id().to_string());
            evt.case_definition_key = Some(case_execution.case_definition_key().to_string());
            evt.case_instance_id = Some(case_execution.case_instance_id().to_string());
            evt.case_execution_id = Some(case_execution.id().to_string());
        }

        evt.name = state.name;
        evt.description = state.description;
        evt.assignee = state.assignee;
        evt.owner = state.owner;
        evt.priority = state.priority;
        evt.due_date = state.due_date;
        evt.follow_up_date = state.follow_up_date;
        evt.parent_task_id = owned(task.parent_task_id());
        evt.task_definition_key = owned(task.task_definition_key());
    }

    fn init_case_instance(
        evt: &mut HistoricCaseInstanceEvent,
        case: &CaseExecutionEntity,
        event_type: HistoryEventType,
    ) {
        evt.id = case.case_instance_id().to_string();
        evt.event_type = event_type;
        evt.case_instance_id = case.case_instance_id().to_string();
        evt.case_definition_id = case.case_definition_id().to_string();
        evt.case_definition_key = case.case_definition_key().to_string();
        evt.business_key = owned(case.business_key());
        evt.create_user_id = owned(case.create_user_id());
        evt.super_case_instance_id = owned(case.super_case_instance_id());
        evt.super_process_instance_id = owned(case.super_process_instance_id());
        evt.state = case.status().current_state;
    }

    fn init_case_activity_instance(
        evt: &mut HistoricCaseActivityInstanceEvent,
        execution: &CaseExecutionEntity,
        event_type: HistoryEventType,
    ) {
        let status = execution.status();
        evt.id = execution.id().to_string();
        evt.event_type = event_type;
        evt.case_activity_instance_id = execution.id().to_string();
        evt.parent_case_activity_instance_id = owned(execution.parent_id());
        evt.case_instance_id = execution.case_instance_id().to_string();
        evt.case_definition_id = execution.case_definition_id().to_string();
        if let Some(activity) = execution.activity() {
            evt.case_activity_id = Some(activity.id.clone());
            evt.case_activity_name = activity.name.clone();
            evt.case_activity_type = Some(activity.activity_type.clone());
        }
        evt.task_id = status.task_id;
        evt.called_process_instance_id = status.sub_process_instance_id;
        evt.called_case_instance_id = status.sub_case_instance_id;
        evt.state = status.current_state;
        evt.required = execution.is_required();
    }

    fn incident_event(&self, incident: &IncidentEntity, event_type: HistoryEventType) -> HistoryEvent {
        let (incident_state, end_time) = match event_type {
            HistoryEventType::IncidentResolve => (IncidentState::Resolved, Some(self.clock.now())),
            HistoryEventType::IncidentDelete => (IncidentState::Deleted, Some(self.clock.now())),
            _ => (IncidentState::Open, None),
        };

        HistoryEvent::Incident(HistoricIncidentEvent {
            id: incident.id.clone(),
            event_type,
            incident_type: incident.incident_type.clone(),
            incident_message: incident.incident_message.clone(),
            activity_id: incident.activity_id.clone(),
            failed_activity_id: incident.failed_activity_id.clone(),
            execution_id: incident.execution_id.clone(),
            process_instance_id: incident.process_instance_id.clone(),
            process_definition_id: incident.process_definition_id.clone(),
            process_definition_key: incident.process_definition_key.clone(),
            cause_incident_id: incident.cause_incident_id.clone(),
            root_cause_incident_id: incident.root_cause_incident_id.clone(),
            configuration: incident.configuration.clone(),
            create_time: Some(incident.incident_timestamp),
            end_time,
            incident_state,
        })
    }

    fn job_log_event(&self, job: &JobEntity, event_type: HistoryEventType) -> HistoricJobLogEvent {
        let state = match event_type {
            HistoryEventType::JobFail => JobState::Failed,
            HistoryEventType::JobSuccess => JobState::Successful,
            HistoryEventType::JobDelete => JobState::Deleted,
            _ => JobState::Created,
        };

        HistoricJobLogEvent {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Some(self.clock.now()),
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            job_due_date: job.due_date,
            job_retries: job.retries,
            job_priority: job.priority,
            job_exception_message: None,
            activity_id: job.activity_id.clone(),
            execution_id: job.execution_id.clone(),
            process_instance_id: job.process_instance_id.clone(),
            process_definition_id: job.process_definition_id.clone(),
            process_definition_key: job.process_definition_key.clone(),
            deployment_id: job.deployment_id.clone(),
            sequence_counter: job.sequence_counter,
            state,
        }
    }
}

impl HistoryEventProducer for DefaultHistoryEventProducer {
    fn process_instance_start(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent {
        let mut evt = HistoricProcessInstanceEvent::default();
        Self::init_process_instance(&mut evt, execution, HistoryEventType::ProcessInstanceStart);

        evt.start_activity_id = execution.current_activity_id();
        evt.start_time = Some(self.clock.now());
        evt.state = Some(ProcessInstanceState::Active);
        evt.start_user_id = owned(execution.authenticated_user());

        Self::finish(cache, HistoryEvent::ProcessInstance(evt))
    }

    fn process_instance_update(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent {
        let mut evt = Self::load_process_instance(cache, execution.process_instance_id());
        Self::init_process_instance(&mut evt, execution, HistoryEventType::ProcessInstanceUpdate);

        evt.state = Some(if execution.is_suspended() {
            ProcessInstanceState::Suspended
        } else {
            ProcessInstanceState::Active
        });

        Self::finish(cache, HistoryEvent::ProcessInstance(evt))
    }

    fn process_instance_end(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent {
        let mut evt = Self::load_process_instance(cache, execution.process_instance_id());
        Self::init_process_instance(&mut evt, execution, HistoryEventType::ProcessInstanceEnd);

        let state = execution.state();
        evt.state = Some(match (&state.activity, state.externally_terminated) {
            (Some(_), _) => ProcessInstanceState::Completed,
            (None, true) => ProcessInstanceState::ExternallyTerminated,
            (None, false) => ProcessInstanceState::InternallyTerminated,
        });
        evt.end_activity_id = state.activity.as_ref().map(|a| a.id.clone());

        let now = self.clock.now();
        evt.end_time = Some(now);
        evt.duration_in_millis = duration(evt.start_time, now);
        if state.delete_reason.is_some() {
            evt.delete_reason = state.delete_reason.clone();
        }

        Self::finish(cache, HistoryEvent::ProcessInstance(evt))
    }

    fn activity_instance_start(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent {
        let mut evt = HistoricActivityInstanceEvent::default();
        Self::init_activity_instance(&mut evt, execution, HistoryEventType::ActivityInstanceStart);

        evt.sequence_counter = execution.state().sequence_counter;
        evt.start_time = Some(self.clock.now());

        Self::finish(cache, HistoryEvent::ActivityInstance(evt))
    }

    fn activity_instance_update(
        &self,
        cache: &HistoryEventCache,
        execution: &ExecutionEntity,
        task: Option<&TaskEntity>,
    ) -> HistoryEvent {
        let id = execution
            .state()
            .activity_instance_id
            .unwrap_or_else(|| execution.id().to_string());
        let mut evt = Self::load_activity_instance(cache, &id);
        Self::init_activity_instance(&mut evt, execution, HistoryEventType::ActivityInstanceUpdate);

        if let Some(task) = task {
            evt.task_id = Some(task.id().to_string());
            evt.task_assignee = task.state().assignee;
        }

        Self::finish(cache, HistoryEvent::ActivityInstance(evt))
    }

    fn activity_instance_end(&self, cache: &HistoryEventCache, execution: &ExecutionEntity) -> HistoryEvent {
        let state = execution.state();
        let id = state
            .activity_instance_id
            .clone()
            .unwrap_or_else(|| execution.id().to_string());
        let mut evt = Self::load_activity_instance(cache, &id);
        evt.activity_instance_state = Some(state.activity_instance_state);
        Self::init_activity_instance(&mut evt, execution, HistoryEventType::ActivityInstanceEnd);

        let now = self.clock.now();
        evt.end_time = Some(now);
        evt.duration_in_millis = duration(evt.start_time, now);

        Self::finish(cache, HistoryEvent::ActivityInstance(evt))
    }

    fn task_instance_create(&self, cache: &HistoryEventCache, task: &TaskEntity) -> HistoryEvent {
        let mut evt = HistoricTaskInstanceEvent::default();
        Self::init_task_instance(&mut evt, task, HistoryEventType::TaskInstanceCreate);
        evt.start_time = Some(self.clock.now());

        Self::finish(cache, HistoryEvent::TaskInstance(evt))
    }

    fn task_instance_update(&self, cache: &HistoryEventCache, task: &TaskEntity) -> HistoryEvent {
        let mut evt = Self::load_task_instance(cache, task.id());
        Self::init_task_instance(&mut evt, task, HistoryEventType::TaskInstanceUpdate);

        Self::finish(cache, HistoryEvent::TaskInstance(evt))
    }

    fn task_instance_complete(
        &self,
        cache: &HistoryEventCache,
        task: &TaskEntity,
        delete_reason: Option<&str>,
    ) -> HistoryEvent {
        let mut evt = Self::load_task_instance(cache, task.id());
        Self::init_task_instance(&mut evt, task, HistoryEventType::TaskInstanceComplete);

        let now = self.clock.now();
        evt.end_time = Some(now);
        evt.duration_in_millis = duration(evt.start_time, now);
        evt.delete_reason = owned(delete_reason);

        Self::finish(cache, HistoryEvent::TaskInstance(evt))
    }

    fn case_instance_create(&self, cache: &HistoryEventCache, case: &CaseExecutionEntity) -> HistoryEvent {
        let mut evt = HistoricCaseInstanceEvent::default();
        Self::init_case_instance(&mut evt, case, HistoryEventType::CaseInstanceCreate);
        evt.create_time = Some(self.clock.now());

        Self::finish(cache, HistoryEvent::CaseInstance(evt))
    }

    fn case_instance_update(&self, cache: &HistoryEventCache, case: &CaseExecutionEntity) -> HistoryEvent {
        let mut evt = Self::load_case_instance(cache, case.case_instance_id());
        Self::init_case_instance(&mut evt, case, HistoryEventType::CaseInstanceUpdate);

        Self::finish(cache, HistoryEvent::CaseInstance(evt))
    }

    fn case_instance_close(&self, cache: &HistoryEventCache, case: &CaseExecutionEntity) -> HistoryEvent {
        let mut evt = Self::load_case_instance(cache, case.case_instance_id());
        Self::init_case_instance(&mut evt, case, HistoryEventType::CaseInstanceClose);

        let now = self.clock.now();
        evt.close_time = Some(now);
        evt.duration_in_millis = duration(evt.create_time, now);

        Self::finish(cache, HistoryEvent::CaseInstance(evt))
    }

    fn case_activity_instance_create(&self, cache: &HistoryEventCache, execution: &CaseExecutionEntity) -> HistoryEvent {
        let mut evt = HistoricCaseActivityInstanceEvent::default();
        Self::init_case_activity_instance(&mut evt, execution, HistoryEventType::CaseActivityInstanceCreate);
        evt.create_time = Some(self.clock.now());

        Self::finish(cache, HistoryEvent::CaseActivityInstance(evt))
    }

    fn case_activity_instance_update(&self, cache: &HistoryEventCache, execution: &CaseExecutionEntity) -> HistoryEvent {
        let mut evt = Self::load_case_activity_instance(cache, execution.id());
        Self::init_case_activity_instance(&mut evt, execution, HistoryEventType::CaseActivityInstanceUpdate);

        Self::finish(cache, HistoryEvent::CaseActivityInstance(evt))
    }

    fn case_activity_instance_end(&self, cache: &HistoryEventCache, execution: &CaseExecutionEntity) -> HistoryEvent {
        let mut evt = Self::load_case_activity_instance(cache, execution.id());
        Self::init_case_activity_instance(&mut evt, execution, HistoryEventType::CaseActivityInstanceEnd);

        let now = self.clock.now();
        evt.end_time = Some(now);
        evt.duration_in_millis = duration(evt.create_time, now);

        Self::finish(cache, HistoryEvent::CaseActivityInstance(evt))
    }

    fn decision_evaluated(&self, evaluation: &DecisionEvaluation) -> HistoryEvent {
        let inputs = evaluation
            .inputs
            .iter()
            .map(|input| HistoricDecisionInput {
                clause_id: input.clause_id.clone(),
                clause_name: input.clause_name.clone(),
                value: TypedValue::from(&input.value),
            })
            .collect();

        let outputs = evaluation
            .matched_rules
            .iter()
            .enumerate()
            .flat_map(|(index, rule)| {
                rule.outputs.iter().map(move |output| HistoricDecisionOutput {
                    clause_id: output.clause_id.clone(),
                    clause_name: output.clause_name.clone(),
                    rule_id: rule.rule_id.clone(),
                    rule_order: index as u32 + 1,
                    variable_name: output.output_name.clone(),
                    value: TypedValue::from(&output.value),
                })
            })
            .collect();

        HistoryEvent::DecisionInstance(HistoricDecisionInstanceEvent {
            id: Uuid::new_v4().to_string(),
            event_type: HistoryEventType::DecisionInstanceEvaluate,
            decision_definition_id: evaluation.decision_definition_id.clone(),
            decision_definition_key: evaluation.decision_definition_key.clone(),
            decision_definition_name: evaluation.decision_definition_name.clone(),
            process_definition_id: evaluation.process_definition_id.clone(),
            process_definition_key: evaluation.process_definition_key.clone(),
            process_instance_id: evaluation.process_instance_id.clone(),
            execution_id: evaluation.execution_id.clone(),
            activity_id: evaluation.activity_id.clone(),
            activity_instance_id: evaluation.activity_instance_id.clone(),
            case_instance_id: evaluation.case_instance_id.clone(),
            user_id: evaluation.user_id.clone(),
            evaluation_time: Some(self.clock.now()),
            inputs,
            outputs,
            collect_result_value: evaluation
                .collect_result_value
                .as_ref()
                .and_then(|n| n.as_f64()),
        })
    }

    fn incident_create(&self, incident: &IncidentEntity) -> HistoryEvent {
        self.incident_event(incident, HistoryEventType::IncidentCreate)
    }

    fn incident_resolve(&self, incident: &IncidentEntity) -> HistoryEvent {
        self.incident_event(incident, HistoryEventType::IncidentResolve)
    }

    fn incident_delete(&self, incident: &IncidentEntity) -> HistoryEvent {
        self.incident_event(incident, HistoryEventType::IncidentDelete)
    }

    fn job_log_created(&self, job: &JobEntity) -> HistoryEvent {
        HistoryEvent::JobLog(self.job_log_event(job, HistoryEventType::JobCreate))
    }

    fn job_log_failed(&self, job: &JobEntity, exception_message: &str) -> HistoryEvent {
        let mut evt = self.job_log_event(job, HistoryEventType::JobFail);
        evt.job_exception_message = Some(exception_message.to_string());
        HistoryEvent::JobLog(evt)
    }

    fn job_log_successful(&self, job: &JobEntity) -> HistoryEvent {
        HistoryEvent::JobLog(self.job_log_event(job, HistoryEventType::JobSuccess))
    }

    fn job_log_deleted(&self, job: &JobEntity) -> HistoryEvent {
        HistoryEvent::JobLog(self.job_log_event(job, HistoryEventType::JobDelete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::FixedClock;
    use crate::runtime::entity::{
        ActivityRef, CaseExecutionInit, CaseExecutionState, EvaluatedInput, EvaluatedOutput,
        ExecutionInit, MatchedRule, TaskInit,
    };
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()))
    }

    fn execution() -> Arc<ExecutionEntity> {
        let execution = ExecutionEntity::create(ExecutionInit {
            id: "pi-1".to_string(),
            process_instance_id: "pi-1".to_string(),
            process_definition_id: "order-process:1:d1".to_string(),
            process_definition_key: "order-process".to_string(),
            business_key: Some("order-42".to_string()),
            authenticated_user_id: Some("kermit".to_string()),
            ..Default::default()
        });
        execution.enter_activity(
            ActivityRef {
                id: "start".to_string(),
                name: Some("Order received".to_string()),
                activity_type: "startEvent".to_string(),
            },
            "start:ai-1".to_string(),
        );
        execution
    }

    #[test]
    fn test_process_instance_events_accumulate_in_cache() {
        let clock = clock();
        let producer = DefaultHistoryEventProducer::new(clock.clone());
        let cache = HistoryEventCache::new();
        let execution = execution();

        let started = producer.process_instance_start(&cache, &execution);
        let HistoryEvent::ProcessInstance(started) = started else { panic!("wrong kind") };
        assert_eq!(started.state, Some(ProcessInstanceState::Active));
        assert_eq!(started.start_user_id.as_deref(), Some("kermit"));
        assert_eq!(started.start_activity_id.as_deref(), Some("start"));

        clock.advance(Duration::milliseconds(1500));
        let ended = producer.process_instance_end(&cache, &execution);
        let HistoryEvent::ProcessInstance(ended) = ended else { panic!("wrong kind") };
        assert_eq!(ended.start_time, started.start_time);
        assert_eq!(ended.duration_in_millis, Some(1500));
        assert_eq!(ended.state, Some(ProcessInstanceState::Completed));
        assert_eq!(ended.end_activity_id.as_deref(), Some("start"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_end_without_start_has_no_duration() {
        let producer = DefaultHistoryEventProducer::new(clock());
        let cache = HistoryEventCache::new();
        let execution = execution();
        execution.update_state(|state| {
            state.activity = None;
            state.externally_terminated = true;
            state.delete_reason = Some("canceled by user".to_string());
        });

        let HistoryEvent::ProcessInstance(ended) = producer.process_instance_end(&cache, &execution) else {
            panic!("wrong kind")
        };
        assert_eq!(ended.duration_in_millis, None);
        assert_eq!(ended.state, Some(ProcessInstanceState::ExternallyTerminated));
        assert_eq!(ended.delete_reason.as_deref(), Some("canceled by user"));
    }

    #[test]
    fn test_activity_update_records_task_assignment() {
        let producer = DefaultHistoryEventProducer::new(clock());
        let cache = HistoryEventCache::new();
        let execution = execution();
        let task = TaskEntity::create(TaskInit {
            id: "task-1".to_string(),
            execution: Some(Arc::clone(&execution)),
            ..Default::default()
        });
        task.update_state(|state| state.assignee = Some("fozzie".to_string()));

        producer.activity_instance_start(&cache, &execution);
        let HistoryEvent::ActivityInstance(updated) =
            producer.activity_instance_update(&cache, &execution, Some(&task))
        else {
            panic!("wrong kind")
        };
        assert_eq!(updated.task_id.as_deref(), Some("task-1"));
        assert_eq!(updated.task_assignee.as_deref(), Some("fozzie"));
        assert_eq!(updated.sequence_counter, 1);
        assert!(updated.start_time.is_some());
        assert_eq!(updated.parent_activity_instance_id.as_deref(), Some("pi-1"));
    }

    #[test]
    fn test_task_complete_sets_reason_and_duration() {
        let clock = clock();
        let producer = DefaultHistoryEventProducer::new(clock.clone());
        let cache = HistoryEventCache::new();
        let task = TaskEntity::create(TaskInit {
            id: "task-1".to_string(),
            execution: Some(execution()),
            task_definition_key: Some("review".to_string()),
            ..Default::default()
        });

        producer.task_instance_create(&cache, &task);
        clock.advance(Duration::seconds(60));
        let HistoryEvent::TaskInstance(done) = producer.task_instance_complete(&cache, &task, Some("completed")) else {
            panic!("wrong kind")
        };
        assert_eq!(done.duration_in_millis, Some(60_000));
        assert_eq!(done.delete_reason.as_deref(), Some("completed"));
        assert_eq!(done.activity_instance_id.as_deref(), Some("start:ai-1"));
        assert_eq!(done.task_definition_key.as_deref(), Some("review"));
    }

    #[test]
    fn test_case_instance_close() {
        let clock = clock();
        let producer = DefaultHistoryEventProducer::new(clock.clone());
        let cache = HistoryEventCache::new();
        let case = CaseExecutionEntity::create(CaseExecutionInit {
            id: "ci-1".to_string(),
            case_instance_id: "ci-1".to_string(),
            case_definition_id: "claim:1:d1".to_string(),
            case_definition_key: "claim".to_string(),
            ..Default::default()
        });
        case.update_status(|s| s.current_state = CaseExecutionState::Active);

        producer.case_instance_create(&cache, &case);
        clock.advance(Duration::seconds(5));
        case.update_status(|s| s.current_state = CaseExecutionState::Closed);
        let HistoryEvent::CaseInstance(closed) = producer.case_instance_close(&cache, &case) else {
            panic!("wrong kind")
        };
        assert_eq!(closed.state, CaseExecutionState::Closed);
        assert_eq!(closed.duration_in_millis, Some(5000));
    }

    #[test]
    fn test_decision_outputs_are_numbered_from_one() {
        let producer = DefaultHistoryEventProducer::new(clock());
        let evaluation = DecisionEvaluation {
            decision_definition_id: "dish:1:d1".to_string(),
            decision_definition_key: "dish".to_string(),
            inputs: vec![EvaluatedInput {
                clause_id: "season".to_string(),
                clause_name: Some("Season".to_string()),
                value: json!("Winter"),
            }],
            matched_rules: vec![
                MatchedRule {
                    rule_id: "rule-a".to_string(),
                    outputs: vec![EvaluatedOutput {
                        clause_id: "dish".to_string(),
                        clause_name: None,
                        output_name: Some("dish".to_string()),
                        value: json!("Roastbeef"),
                    }],
                },
                MatchedRule {
                    rule_id: "rule-b".to_string(),
                    outputs: vec![EvaluatedOutput {
                        clause_id: "dish".to_string(),
                        clause_name: None,
                        output_name: Some("dish".to_string()),
                        value: json!("Stew"),
                    }],
                },
            ],
            collect_result_value: Some(serde_json::Number::from(7)),
            ..Default::default()
        };

        let HistoryEvent::DecisionInstance(evt) = producer.decision_evaluated(&evaluation) else {
            panic!("wrong kind")
        };
        assert_eq!(evt.inputs[0].value.type_name, "string");
        let orders: Vec<u32> = evt.outputs.iter().map(|o| o.rule_order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(evt.collect_result_value, Some(7.0));
    }

    #[test]
    fn test_incident_and_job_log_states() {
        let producer = DefaultHistoryEventProducer::new(clock());
        let incident = IncidentEntity {
            id: "inc-1".to_string(),
            incident_type: IncidentEntity::FAILED_JOB.to_string(),
            configuration: Some("job-1".to_string()),
            ..Default::default()
        };

        let HistoryEvent::Incident(created) = producer.incident_create(&incident) else { panic!() };
        assert_eq!(created.incident_state, IncidentState::Open);
        assert!(created.end_time.is_none());
        let HistoryEvent::Incident(resolved) = producer.incident_resolve(&incident) else { panic!() };
        assert_eq!(resolved.incident_state, IncidentState::Resolved);
        assert!(resolved.end_time.is_some());

        let job = JobEntity {
            id: "job-1".to_string(),
            retries: 2,
            ..Default::default()
        };
        let HistoryEvent::JobLog(failed) = producer.job_log_failed(&job, "boom") else { panic!() };
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.job_exception_message.as_deref(), Some("boom"));
        assert_eq!(failed.job_retries, 2);
    }
}
