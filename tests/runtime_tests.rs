//! End-to-end runs of the single-token runner against an in-memory engine

use bpm_platform::config::{HistoryLevel, ProcessEngineConfig};
use bpm_platform::engine::{DeploymentRequest, EngineConfiguration, ProcessEngine};
use bpm_platform::history::{HistoryEntityKind, HistoryEvent, HistoryEventType, InMemoryHistoryEventHandler};
use bpm_platform::runtime::{Clock, FixedClock};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const BPMN_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL" xmlns:camunda="http://camunda.org/schema/1.0/bpmn">"#;

fn bpmn(body: &str) -> String {
    format!("{}\n{}\n</definitions>", BPMN_HEADER, body)
}

fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

struct Harness {
    engine: Arc<ProcessEngine>,
    history: Arc<InMemoryHistoryEventHandler>,
    clock: Arc<FixedClock>,
}

impl Harness {
    async fn new(level: HistoryLevel) -> Self {
        let config = ProcessEngineConfig::in_memory("runtime").with_history(level);
        let history = Arc::new(InMemoryHistoryEventHandler::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let clock_handle: Arc<dyn Clock> = clock.clone();
        let engine = ProcessEngine::build(
            EngineConfiguration::from_config(&config)
                .with_history_handler(history.clone())
                .with_clock(clock_handle),
        )
        .await
        .unwrap();
        Self { engine, history, clock }
    }

    async fn deploy(&self, resources: &[(&str, String)]) -> String {
        let request = DeploymentRequest {
            name: "test".to_string(),
            resources: resources
                .iter()
                .map(|(name, xml)| (name.to_string(), xml.clone().into_bytes()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        };
        self.engine
            .resource_deployer()
            .deploy(&request)
            .await
            .unwrap()
            .deployment_id
            .unwrap()
    }

    fn events_of(&self, kind: HistoryEntityKind) -> Vec<HistoryEvent> {
        self.history.events().into_iter().filter(|e| e.kind() == kind).collect()
    }
}

#[tokio::test]
async fn test_user_task_waits_and_completes() {
    let harness = Harness::new(HistoryLevel::Activity).await;
    harness
        .deploy(&[(
            "approval.bpmn",
            bpmn(
                r#"<process id="approval" isExecutable="true">
    <startEvent id="start" />
    <userTask id="review" name="Review" camunda:assignee="${initiator}" />
    <endEvent id="end" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="review" />
    <sequenceFlow id="f2" sourceRef="review" targetRef="end" />
  </process>"#,
            ),
        )])
        .await;

    let runtime = harness.engine.runtime();
    let instance = runtime
        .start_process_instance_by_key("approval", Some("order-7"), vars(&[("initiator", json!("kermit"))]))
        .await
        .unwrap();
    assert!(!instance.ended);
    assert_eq!(instance.current_activity_id.as_deref(), Some("review"));
    assert_eq!(instance.business_key.as_deref(), Some("order-7"));

    let tasks = runtime.tasks_for_process_instance(&instance.id);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state().assignee.as_deref(), Some("kermit"));
    assert_eq!(tasks[0].state().name.as_deref(), Some("Review"));

    harness.clock.advance(Duration::seconds(5));
    let finished = runtime
        .complete_task(tasks[0].id(), vars(&[("approved", json!(true))]))
        .await
        .unwrap();
    assert!(finished.ended);
    assert!(runtime.process_instance(&instance.id).is_none());
    assert!(runtime.tasks().is_empty());
    assert!(runtime.variables(&instance.id).unwrap_err().is_not_found());

    let ends: Vec<HistoryEvent> = harness
        .events_of(HistoryEntityKind::ProcessInstance)
        .into_iter()
        .filter(|e| e.event_type() == HistoryEventType::ProcessInstanceEnd)
        .collect();
    let [HistoryEvent::ProcessInstance(end)] = ends.as_slice() else {
        panic!("expected one process instance end event, got {:?}", ends);
    };
    assert_eq!(end.duration_in_millis, Some(5_000));

    let task_events = harness.events_of(HistoryEntityKind::TaskInstance);
    assert_eq!(
        task_events.iter().map(|e| e.event_type()).collect::<Vec<_>>(),
        vec![HistoryEventType::TaskInstanceCreate, HistoryEventType::TaskInstanceComplete]
    );
}

fn routing_process() -> String {
    bpmn(
        r#"<process id="routing" isExecutable="true">
    <startEvent id="start" />
    <scriptTask id="score" scriptFormat="lua" camunda:resultVariable="score">
      <script><![CDATA[return amount * 2]]></script>
    </scriptTask>
    <exclusiveGateway id="check" default="toSmall" />
    <userTask id="bigReview" />
    <userTask id="smallReview" />
    <endEvent id="end" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="score" />
    <sequenceFlow id="f2" sourceRef="score" targetRef="check" />
    <sequenceFlow id="toBig" sourceRef="check" targetRef="bigReview">
      <conditionExpression>${score &gt; 10}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="toSmall" sourceRef="check" targetRef="smallReview" />
    <sequenceFlow id="f5" sourceRef="bigReview" targetRef="end" />
    <sequenceFlow id="f6" sourceRef="smallReview" targetRef="end" />
  </process>"#,
    )
}

#[tokio::test]
async fn test_gateway_takes_condition_or_default_flow() {
    let harness = Harness::new(HistoryLevel::Audit).await;
    harness.deploy(&[("routing.bpmn", routing_process())]).await;
    let runtime = harness.engine.runtime();

    let big = runtime
        .start_process_instance_by_key("routing", None, vars(&[("amount", json!(10))]))
        .await
        .unwrap();
    assert_eq!(big.current_activity_id.as_deref(), Some("bigReview"));
    assert_eq!(runtime.variable(&big.id, "score").unwrap(), Some(json!(20)));

    let small = runtime
        .start_process_instance_by_key("routing", None, vars(&[("amount", json!(2))]))
        .await
        .unwrap();
    assert_eq!(small.current_activity_id.as_deref(), Some("smallReview"));
    assert_eq!(runtime.active_process_instances().len(), 2);
}

#[tokio::test]
async fn test_failing_start_leaves_no_instance() {
    let harness = Harness::new(HistoryLevel::Full).await;
    harness.deploy(&[("routing.bpmn", routing_process())]).await;
    let runtime = harness.engine.runtime();

    let err = runtime
        .start_process_instance_by_key("routing", None, Map::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("amount"), "{}", err);
    assert!(runtime.active_process_instances().is_empty());
    assert!(harness.history.events().is_empty());

    let err = runtime
        .start_process_instance_by_key("unknown", None, Map::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

fn async_process(expression: &str) -> String {
    bpmn(&format!(
        r#"<process id="billing" isExecutable="true">
    <startEvent id="start" />
    <serviceTask id="charge" camunda:async="true" camunda:expression="{}" camunda:resultVariable="charged" />
    <userTask id="confirm" />
    <endEvent id="end" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="charge" />
    <sequenceFlow id="f2" sourceRef="charge" targetRef="confirm" />
    <sequenceFlow id="f3" sourceRef="confirm" targetRef="end" />
  </process>"#,
        expression
    ))
}

#[tokio::test]
async fn test_async_continuation_runs_as_job() {
    let harness = Harness::new(HistoryLevel::Audit).await;
    harness.deploy(&[("billing.bpmn", async_process("${amount + 1}"))]).await;
    let runtime = harness.engine.runtime();
    let job_executor = harness.engine.job_executor();

    let instance = runtime
        .start_process_instance_by_key("billing", None, vars(&[("amount", json!(41))]))
        .await
        .unwrap();
    assert_eq!(instance.current_activity_id.as_deref(), Some("charge"));
    assert!(runtime.tasks().is_empty());

    let jobs = job_executor.jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, "async-continuation");
    assert_eq!(jobs[0].activity_id.as_deref(), Some("charge"));
    assert_eq!(jobs[0].retries, 3);

    assert_eq!(job_executor.execute_due_jobs().await.unwrap(), 1);
    assert!(job_executor.jobs().await.unwrap().is_empty());
    assert_eq!(runtime.variable(&instance.id, "charged").unwrap(), Some(json!(42)));
    assert_eq!(runtime.tasks_for_process_instance(&instance.id).len(), 1);

    let job_log: Vec<HistoryEventType> = harness
        .events_of(HistoryEntityKind::JobLog)
        .iter()
        .map(|e| e.event_type())
        .collect();
    assert_eq!(job_log, vec![HistoryEventType::JobCreate, HistoryEventType::JobSuccess]);
}

#[tokio::test]
async fn test_failing_job_exhausts_retries_and_raises_incident() {
    let harness = Harness::new(HistoryLevel::Full).await;
    harness.deploy(&[("billing.bpmn", async_process("${missing + 1}"))]).await;
    let runtime = harness.engine.runtime();
    let job_executor = harness.engine.job_executor();

    let instance = runtime
        .start_process_instance_by_key("billing", None, Map::new())
        .await
        .unwrap();

    for expected_retries in [2, 1, 0] {
        assert_eq!(job_executor.execute_due_jobs().await.unwrap(), 1);
        let jobs = job_executor.jobs().await.unwrap();
        assert_eq!(jobs[0].retries, expected_retries);
        assert!(jobs[0].lock_owner.is_none());
        assert!(jobs[0].exception_message.as_deref().unwrap_or_default().contains("missing"));
    }
    assert_eq!(job_executor.execute_due_jobs().await.unwrap(), 0);

    let incidents = harness.events_of(HistoryEntityKind::Incident);
    let [HistoryEvent::Incident(incident)] = incidents.as_slice() else {
        panic!("expected one incident, got {:?}", incidents);
    };
    assert_eq!(incident.incident_type, "failedJob");
    assert_eq!(incident.activity_id.as_deref(), Some("charge"));

    // the instance is still parked on the job
    assert_eq!(
        runtime.process_instance(&instance.id).unwrap().current_activity_id.as_deref(),
        Some("charge")
    );

    let job_id = job_executor.jobs().await.unwrap()[0].id.clone();
    job_executor.set_job_retries(&job_id, 1).await.unwrap();
    runtime.set_variable(&instance.id, "missing", json!(1)).unwrap();
    assert_eq!(job_executor.execute_due_jobs().await.unwrap(), 1);
    assert_eq!(runtime.variable(&instance.id, "charged").unwrap(), Some(json!(2)));
}

const DISH_DECISION: &str = r#"<definitions xmlns="https://www.omg.org/spec/DMN/20191111/MODEL/">
  <decision id="dish" name="Dish">
    <decisionTable id="table" hitPolicy="FIRST">
      <input id="season" label="Season"><inputExpression><text>season</text></inputExpression></input>
      <input id="guests" label="Guests"><inputExpression><text>guests</text></inputExpression></input>
      <output id="out" name="dish" />
      <rule id="r1">
        <inputEntry><text>"Winter"</text></inputEntry><inputEntry><text>&lt;= 8</text></inputEntry>
        <outputEntry><text>"Roastbeef"</text></outputEntry>
      </rule>
      <rule id="r2">
        <inputEntry><text>"Winter"</text></inputEntry><inputEntry><text>&gt; 8</text></inputEntry>
        <outputEntry><text>"Stew"</text></outputEntry>
      </rule>
      <rule id="r3">
        <inputEntry><text></text></inputEntry><inputEntry><text>-</text></inputEntry>
        <outputEntry><text>"Salad"</text></outputEntry>
      </rule>
    </decisionTable>
  </decision>
</definitions>"#;

#[tokio::test]
async fn test_business_rule_task_evaluates_deployed_decision() {
    let harness = Harness::new(HistoryLevel::Full).await;
    harness
        .deploy(&[
            ("dish.dmn", DISH_DECISION.to_string()),
            (
                "dinner.bpmn",
                bpmn(
                    r#"<process id="dinner" isExecutable="true">
    <startEvent id="start" />
    <businessRuleTask id="decide" camunda:decisionRef="dish" camunda:resultVariable="dish" />
    <userTask id="serve" />
    <endEvent id="end" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="decide" />
    <sequenceFlow id="f2" sourceRef="decide" targetRef="serve" />
    <sequenceFlow id="f3" sourceRef="serve" targetRef="end" />
  </process>"#,
                ),
            ),
        ])
        .await;
    let runtime = harness.engine.runtime();

    let instance = runtime
        .start_process_instance_by_key(
            "dinner",
            None,
            vars(&[("season", json!("Winter")), ("guests", json!(12))]),
        )
        .await
        .unwrap();
    assert_eq!(runtime.variable(&instance.id, "dish").unwrap(), Some(json!("Stew")));

    let decisions = harness.events_of(HistoryEntityKind::DecisionInstance);
    let [HistoryEvent::DecisionInstance(decision)] = decisions.as_slice() else {
        panic!("expected one decision event, got {:?}", decisions);
    };
    assert_eq!(decision.activity_id.as_deref(), Some("decide"));
    assert_eq!(decision.process_instance_id.as_deref(), Some(instance.id.as_str()));

    let summer = runtime
        .evaluate_decision_by_key("dish", vars(&[("season", json!("Summer")), ("guests", json!(3))]))
        .await
        .unwrap();
    assert_eq!(summer, json!("Salad"));
}

#[tokio::test]
async fn test_delete_process_instance_cancels_tasks_and_jobs() {
    let harness = Harness::new(HistoryLevel::Full).await;
    harness.deploy(&[("billing.bpmn", async_process("${amount}"))]).await;
    let runtime = harness.engine.runtime();

    let instance = runtime
        .start_process_instance_by_key("billing", None, vars(&[("amount", json!(1))]))
        .await
        .unwrap();
    runtime
        .delete_process_instance(&instance.id, Some("customer cancelled"))
        .await
        .unwrap();

    assert!(runtime.process_instance(&instance.id).is_none());
    assert!(harness.engine.job_executor().jobs().await.unwrap().is_empty());

    let end = harness
        .events_of(HistoryEntityKind::ProcessInstance)
        .into_iter()
        .find(|e| e.event_type() == HistoryEventType::ProcessInstanceEnd);
    let Some(HistoryEvent::ProcessInstance(end)) = end else {
        panic!("missing process instance end event");
    };
    assert_eq!(end.delete_reason.as_deref(), Some("customer cancelled"));
}

#[tokio::test]
async fn test_failed_task_completion_keeps_task_open() {
    let harness = Harness::new(HistoryLevel::Full).await;
    harness
        .deploy(&[(
            "review.bpmn",
            bpmn(
                r#"<process id="review" isExecutable="true">
    <startEvent id="start" />
    <userTask id="check" name="Check" />
    <serviceTask id="charge" camunda:expression="${missing + 1}" camunda:resultVariable="charged" />
    <endEvent id="end" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="check" />
    <sequenceFlow id="f2" sourceRef="check" targetRef="charge" />
    <sequenceFlow id="f3" sourceRef="charge" targetRef="end" />
  </process>"#,
            ),
        )])
        .await;
    let runtime = harness.engine.runtime();
    let instance = runtime
        .start_process_instance_by_key("review", None, Map::new())
        .await
        .unwrap();
    let task_id = runtime.tasks_for_process_instance(&instance.id)[0].id().to_string();
    let events_before = harness.history.events().len();

    let err = runtime
        .complete_task(&task_id, vars(&[("note", json!("looks fine"))]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing"), "{}", err);

    let parked = runtime.process_instance(&instance.id).unwrap();
    assert_eq!(parked.current_activity_id.as_deref(), Some("check"));
    assert!(!parked.ended);
    assert!(runtime.task(&task_id).is_some());
    assert_eq!(runtime.tasks_for_process_instance(&instance.id).len(), 1);
    assert_eq!(runtime.variable(&instance.id, "note").unwrap(), None);
    assert_eq!(harness.history.events().len(), events_before);

    runtime.set_variable(&instance.id, "missing", json!(1)).unwrap();
    let finished = runtime.complete_task(&task_id, Map::new()).await.unwrap();
    assert!(finished.ended);
    assert!(runtime.tasks().is_empty());
}

#[tokio::test]
async fn test_failed_delete_leaves_instance_running() {
    let harness = Harness::new(HistoryLevel::Full).await;
    harness.deploy(&[("billing.bpmn", async_process("${amount}"))]).await;
    let runtime = harness.engine.runtime();
    let instance = runtime
        .start_process_instance_by_key("billing", None, vars(&[("amount", json!(1))]))
        .await
        .unwrap();

    let executor = harness.engine.command_executor();
    sqlx::query(&format!("DROP TABLE {}", executor.tables().job()))
        .execute(executor.pool())
        .await
        .unwrap();

    assert!(runtime.delete_process_instance(&instance.id, Some("oops")).await.is_err());
    let still_running = runtime.process_instance(&instance.id).unwrap();
    assert!(!still_running.ended);
    assert_eq!(still_running.current_activity_id.as_deref(), Some("charge"));
}
