/// Model parsing for deployable resources
///
/// Reads BPMN processes, CMMN cases and DMN decision tables with quick-xml into
/// plain model structs. Only the elements the runtime understands are kept in
/// detail; other flow nodes are recorded as unsupported and fail when a token
/// reaches them.

use crate::error::{PlatformError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Resource file types the deployer recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Bpmn,
    Cmmn,
    Dmn,
}

const SUFFIXES: &[(&str, ResourceKind)] = &[
    (".bpmn20.xml", ResourceKind::Bpmn),
    (".bpmn", ResourceKind::Bpmn),
    (".cmmn11.xml", ResourceKind::Cmmn),
    (".cmmn", ResourceKind::Cmmn),
    (".dmn11.xml", ResourceKind::Dmn),
    (".dmn", ResourceKind::Dmn),
];

impl ResourceKind {
    /// Kind implied by a resource file name
    pub fn for_resource(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        SUFFIXES
            .iter()
            .find(|(suffix, _)| lower.ends_with(suffix))
            .map(|(_, kind)| *kind)
    }
}

/// Model family of a deployed definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Process,
    Case,
    Decision,
}

impl DefinitionKind {
    /// Lowercase kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionKind::Process => "process",
            DefinitionKind::Case => "case",
            DefinitionKind::Decision => "decision",
        }
    }
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefinitionKind {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(DefinitionKind::Process),
            "case" => Ok(DefinitionKind::Case),
            "decision" => Ok(DefinitionKind::Decision),
            other => Err(PlatformError::Validation(format!("Unknown definition kind '{}'", other))),
        }
    }
}

/// One definition found in a resource
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDefinition {
    pub key: String,
    pub name: Option<String>,
    pub model: DefinitionModel,
}

impl ParsedDefinition {
    /// Kind of this definition
    pub fn kind(&self) -> DefinitionKind {
        match self.model {
            DefinitionModel::Process(_) => DefinitionKind::Process,
            DefinitionModel::Case(_) => DefinitionKind::Case,
            DefinitionModel::Decision(_) => DefinitionKind::Decision,
        }
    }
}

/// Parsed definition of any kind
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionModel {
    Process(ProcessModel),
    Case(CaseModel),
    Decision(DecisionModel),
}

/// Executable BPMN process
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessModel {
    pub id: String,
    pub name: Option<String>,
    pub executable: bool,
    pub activities: Vec<ActivityModel>,
    pub flows: Vec<SequenceFlowModel>,
}

/// One flow node of a process
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityModel {
    pub id: String,
    pub name: Option<String>,
    pub kind: ActivityKind,
    pub async_before: bool,
    pub default_flow: Option<String>,
}

/// Flow node behaviour
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityKind {
    StartEvent,
    EndEvent,
    Task,
    ServiceTask {
        expression: Option<String>,
        result_variable: Option<String>,
    },
    ScriptTask {
        format: String,
        script: String,
        result_variable: Option<String>,
    },
    UserTask {
        assignee: Option<String>,
    },
    ExclusiveGateway,
    BusinessRuleTask {
        decision_ref: String,
        result_variable: Option<String>,
    },
    Unsupported(String),
}

impl ActivityKind {
    /// BPMN element name
    pub fn type_name(&self) -> &str {
        match self {
            ActivityKind::StartEvent => "startEvent",
            ActivityKind::EndEvent => "endEvent",
            ActivityKind::Task => "task",
            ActivityKind::ServiceTask { .. } => "serviceTask",
            ActivityKind::ScriptTask { .. } => "scriptTask",
            ActivityKind::UserTask { .. } => "userTask",
            ActivityKind::ExclusiveGateway => "exclusiveGateway",
            ActivityKind::BusinessRuleTask { .. } => "businessRuleTask",
            ActivityKind::Unsupported(element) => element,
        }
    }
}

/// Directed flow between two activities
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceFlowModel {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<String>,
}

/// CMMN case with its plan items
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CaseModel {
    pub id: String,
    pub name: Option<String>,
    pub plan_items: Vec<PlanItemModel>,
}

/// One plan item of a case
#[derive(Debug, Clone, PartialEq)]
pub struct PlanItemModel {
    pub id: String,
    pub name: Option<String>,
    pub definition_ref: Option<String>,
    /// CMMN element of the referenced definition, e.g. `humanTask`
    pub definition_type: Option<String>,
}

/// DMN hit policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HitPolicy {
    #[default]
    Unique,
    First,
    Any,
    Collect,
    RuleOrder,
}

impl FromStr for HitPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNIQUE" => Ok(HitPolicy::Unique),
            "FIRST" => Ok(HitPolicy::First),
            "ANY" => Ok(HitPolicy::Any),
            "COLLECT" => Ok(HitPolicy::Collect),
            "RULE ORDER" | "RULE_ORDER" => Ok(HitPolicy::RuleOrder),
            other => Err(format!("unsupported hit policy '{}'", other)),
        }
    }
}

/// COLLECT aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Count,
    Min,
    Max,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUM" => Ok(Aggregation::Sum),
            "COUNT" => Ok(Aggregation::Count),
            "MIN" => Ok(Aggregation::Min),
            "MAX" => Ok(Aggregation::Max),
            other => Err(format!("unsupported aggregation '{}'", other)),
        }
    }
}

/// DMN decision table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecisionModel {
    pub id: String,
    pub name: Option<String>,
    pub hit_policy: HitPolicy,
    pub aggregation: Option<Aggregation>,
    pub inputs: Vec<DecisionInputModel>,
    pub outputs: Vec<DecisionOutputModel>,
    pub rules: Vec<DecisionRuleModel>,
}

/// Input column of a decision table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecisionInputModel {
    pub id: String,
    pub label: Option<String>,
    pub expression: String,
}

/// Output column of a decision table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecisionOutputModel {
    pub id: String,
    pub label: Option<String>,
    pub name: Option<String>,
}

/// One rule row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecisionRuleModel {
    pub id: String,
    pub input_entries: Vec<String>,
    pub output_entries: Vec<String>,
}

const UNSUPPORTED_FLOW_NODES: &[&str] = &[
    "parallelGateway",
    "inclusiveGateway",
    "eventBasedGateway",
    "complexGateway",
    "intermediateCatchEvent",
    "intermediateThrowEvent",
    "boundaryEvent",
    "subProcess",
    "callActivity",
    "manualTask",
    "sendTask",
    "receiveTask",
];

const CASE_PLAN_ITEM_DEFINITIONS: &[&str] = &[
    "humanTask",
    "processTask",
    "caseTask",
    "decisionTask",
    "stage",
    "milestone",
];

type Attributes = HashMap<String, String>;

fn attributes(resource: &str, element: &BytesStart<'_>) -> Result<Attributes> {
    let mut map = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| parse_error(resource, e))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| parse_error(resource, e))?;
        map.insert(key, value.into_owned());
    }
    Ok(map)
}

fn parse_error(resource: &str, cause: impl fmt::Display) -> PlatformError {
    PlatformError::Parse {
        resource: resource.to_string(),
        cause: cause.to_string(),
    }
}

fn flag(attrs: &Attributes, name: &str) -> bool {
    attrs.get(name).map(|v| v.trim() == "true").unwrap_or(false)
}

#[derive(Default)]
struct ModelReader {
    resource: String,
    stack: Vec<String>,
    definitions: Vec<ParsedDefinition>,
    process: Option<ProcessModel>,
    case: Option<(CaseModel, HashMap<String, String>)>,
    decision: Option<DecisionModel>,
}

impl ModelReader {
    fn required(&self, attrs: &Attributes, element: &str) -> Result<String> {
        attrs
            .get("id")
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .ok_or_else(|| parse_error(&self.resource, format!("<{}> without an id", element)))
    }

    fn open(&mut self, name: &str, attrs: Attributes) -> Result<()> {
        match name {
            "process" => {
                self.process = Some(ProcessModel {
                    id: self.required(&attrs, name)?,
                    name: attrs.get("name").cloned(),
                    executable: attrs.get("isExecutable").map(|v| v != "false").unwrap_or(true),
                    ..Default::default()
                });
                return Ok(());
            }
            "case" => {
                let case = CaseModel {
                    id: self.required(&attrs, name)?,
                    name: attrs.get("name").cloned(),
                    ..Default::default()
                };
                self.case = Some((case, HashMap::new()));
                return Ok(());
            }
            "decision" => {
                self.decision = Some(DecisionModel {
                    id: self.required(&attrs, name)?,
                    name: attrs.get("name").cloned(),
                    ..Default::default()
                });
                return Ok(());
            }
            _ => {}
        }

        if self.process.is_some() {
            self.open_process_element(name, attrs)
        } else if self.case.is_some() {
            self.open_case_element(name, attrs)
        } else if self.decision.is_some() {
            self.open_decision_element(name, attrs)
        } else {
            Ok(())
        }
    }

    fn open_process_element(&mut self, name: &str, attrs: Attributes) -> Result<()> {
        let result_variable = attrs.get("resultVariable").cloned();
        let kind = match name {
            "startEvent" => ActivityKind::StartEvent,
            "endEvent" => ActivityKind::EndEvent,
            "task" => ActivityKind::Task,
            "serviceTask" => ActivityKind::ServiceTask {
                expression: attrs.get("expression").cloned(),
                result_variable,
            },
            "scriptTask" => ActivityKind::ScriptTask {
                format: attrs.get("scriptFormat").cloned().unwrap_or_default(),
                script: String::new(),
                result_variable,
            },
            "userTask" => ActivityKind::UserTask {
                assignee: attrs.get("assignee").cloned(),
            },
            "exclusiveGateway" => ActivityKind::ExclusiveGateway,
            "businessRuleTask" => ActivityKind::BusinessRuleTask {
                decision_ref: attrs.get("decisionRef").cloned().unwrap_or_default(),
                result_variable,
            },
            "sequenceFlow" => {
                let flow = SequenceFlowModel {
                    id: self.required(&attrs, name)?,
                    source: attrs.get("sourceRef").cloned().unwrap_or_default(),
                    target: attrs.get("targetRef").cloned().unwrap_or_default(),
                    condition: None,
                };
                if let Some(process) = self.process.as_mut() {
                    process.flows.push(flow);
                }
                return Ok(());
            }
            other if UNSUPPORTED_FLOW_NODES.contains(&other) => ActivityKind::Unsupported(other.to_string()),
            _ => return Ok(()),
        };

        let activity = ActivityModel {
            id: self.required(&attrs, name)?,
            name: attrs.get("name").cloned(),
            kind,
            async_before: flag(&attrs, "async") || flag(&attrs, "asyncBefore"),
            default_flow: attrs.get("default").cloned(),
        };
        if let Some(process) = self.process.as_mut() {
            process.activities.push(activity);
        }
        Ok(())
    }

    fn open_case_element(&mut self, name: &str, attrs: Attributes) -> Result<()> {
        if name == "planItem" {
            let item = PlanItemModel {
                id: self.required(&attrs, name)?,
                name: attrs.get("name").cloned(),
                definition_ref: attrs.get("definitionRef").cloned(),
                definition_type: None,
            };
            if let Some((case, _)) = self.case.as_mut() {
                case.plan_items.push(item);
            }
        } else if CASE_PLAN_ITEM_DEFINITIONS.contains(&name) {
            if let (Some(id), Some((_, types))) = (attrs.get("id"), self.case.as_mut()) {
                types.insert(id.clone(), name.to_string());
            }
        }
        Ok(())
    }

    fn open_decision_element(&mut self, name: &str, attrs: Attributes) -> Result<()> {
        let resource = self.resource.clone();
        let Some(decision) = self.decision.as_mut() else {
            return Ok(());
        };
        match name {
            "decisionTable" => {
                if let Some(policy) = attrs.get("hitPolicy") {
                    decision.hit_policy = policy.parse().map_err(|e| parse_error(&resource, e))?;
                }
                if let Some(aggregation) = attrs.get("aggregation") {
                    decision.aggregation = Some(aggregation.parse().map_err(|e| parse_error(&resource, e))?);
                }
            }
            "input" => decision.inputs.push(DecisionInputModel {
                id: attrs.get("id").cloned().unwrap_or_default(),
                label: attrs.get("label").cloned(),
                expression: String::new(),
            }),
            "output" => decision.outputs.push(DecisionOutputModel {
                id: attrs.get("id").cloned().unwrap_or_default(),
                label: attrs.get("label").cloned(),
                name: attrs.get("name").cloned(),
            }),
            "rule" => decision.rules.push(DecisionRuleModel {
                id: attrs.get("id").cloned().unwrap_or_default(),
                ..Default::default()
            }),
            "inputEntry" => {
                if let Some(rule) = decision.rules.last_mut() {
                    rule.input_entries.push(String::new());
                }
            }
            "outputEntry" => {
                if let Some(rule) = decision.rules.last_mut() {
                    rule.output_entries.push(String::new());
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        let Some(top) = self.stack.last() else {
            return;
        };
        let parent = self.stack.len().checked_sub(2).and_then(|i| self.stack.get(i));

        match top.as_str() {
            "conditionExpression" => {
                if let Some(flow) = self.process.as_mut().and_then(|p| p.flows.last_mut()) {
                    flow.condition.get_or_insert_with(String::new).push_str(text);
                }
            }
            "script" => {
                let activity = self.process.as_mut().and_then(|p| p.activities.last_mut());
                if let Some(ActivityModel {
                    kind: ActivityKind::ScriptTask { script, .. },
                    ..
                }) = activity
                {
                    script.push_str(text);
                }
            }
            "text" => {
                let Some(decision) = self.decision.as_mut() else {
                    return;
                };
                let target = match parent.map(String::as_str) {
                    Some("inputExpression") => decision.inputs.last_mut().map(|i| &mut i.expression),
                    Some("inputEntry") => decision.rules.last_mut().and_then(|r| r.input_entries.last_mut()),
                    Some("outputEntry") => decision.rules.last_mut().and_then(|r| r.output_entries.last_mut()),
                    _ => None,
                };
                if let Some(target) = target {
                    target.push_str(text);
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &str) -> Result<()> {
        match name {
            "process" => {
                if let Some(process) = self.process.take() {
                    process.validate().map_err(|e| parse_error(&self.resource, e))?;
                    self.definitions.push(ParsedDefinition {
                        key: process.id.clone(),
                        name: process.name.clone(),
                        model: DefinitionModel::Process(process),
                    });
                }
            }
            "case" => {
                if let Some((mut case, types)) = self.case.take() {
                    for item in &mut case.plan_items {
                        item.definition_type = item
                            .definition_ref
                            .as_ref()
                            .and_then(|r| types.get(r))
                            .cloned();
                    }
                    self.definitions.push(ParsedDefinition {
                        key: case.id.clone(),
                        name: case.name.clone(),
                        model: DefinitionModel::Case(case),
                    });
                }
            }
            "decision" => {
                if let Some(decision) = self.decision.take() {
                    decision.validate().map_err(|e| parse_error(&self.resource, e))?;
                    self.definitions.push(ParsedDefinition {
                        key: decision.id.clone(),
                        name: decision.name.clone(),
                        model: DefinitionModel::Decision(decision),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl ProcessModel {
    fn validate(&self) -> std::result::Result<(), String> {
        let mut ids = HashSet::new();
        for activity in &self.activities {
            if !ids.insert(activity.id.as_str()) {
                return Err(format!("duplicate activity id '{}' in process '{}'", activity.id, self.id));
            }
        }
        for flow in &self.flows {
            for end in [&flow.source, &flow.target] {
                if !ids.contains(end.as_str()) {
                    return Err(format!(
                        "sequence flow '{}' references unknown activity '{}'",
                        flow.id, end
                    ));
                }
            }
        }
        for activity in &self.activities {
            if let ActivityKind::BusinessRuleTask { decision_ref, .. } = &activity.kind {
                if decision_ref.is_empty() {
                    return Err(format!("businessRuleTask '{}' has no decisionRef", activity.id));
                }
            }
        }
        if self.executable && !self.activities.iter().any(|a| a.kind == ActivityKind::StartEvent) {
            return Err(format!("process '{}' has no start event", self.id));
        }
        Ok(())
    }

    /// Activity by id
    pub fn activity(&self, id: &str) -> Option<&ActivityModel> {
        self.activities.iter().find(|a| a.id == id)
    }
}

impl DecisionModel {
    fn validate(&self) -> std::result::Result<(), String> {
        for rule in &self.rules {
            if rule.input_entries.len() != self.inputs.len() || rule.output_entries.len() != self.outputs.len() {
                return Err(format!(
                    "rule '{}' of decision '{}' does not match the table's inputs and outputs",
                    rule.id, self.id
                ));
            }
        }
        Ok(())
    }
}

/// Parse every process, case and decision of one resource
///
/// Resources with an unknown suffix yield no definitions.
pub fn parse_resource(resource: &str, bytes: &[u8]) -> Result<Vec<ParsedDefinition>> {
    if ResourceKind::for_resource(resource).is_none() {
        return Ok(Vec::new());
    }
    let xml = std::str::from_utf8(bytes).map_err(|e| parse_error(resource, e))?;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut state = ModelReader {
        resource: resource.to_string(),
        ..Default::default()
    };

    loop {
        match reader.read_event().map_err(|e| parse_error(resource, e))? {
            Event::Start(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                let attrs = attributes(resource, &element)?;
                state.open(&name, attrs)?;
                state.stack.push(name);
            }
            Event::Empty(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                let attrs = attributes(resource, &element)?;
                state.open(&name, attrs)?;
                state.close(&name)?;
            }
            Event::End(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                state.stack.pop();
                state.close(&name)?;
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| parse_error(resource, e))?;
                state.text(&text);
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                state.text(&text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(state.definitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_PROCESS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL" xmlns:camunda="http://camunda.org/schema/1.0/bpmn">
  <process id="order-process" name="Order" isExecutable="true">
    <startEvent id="start" />
    <scriptTask id="score" scriptFormat="lua" camunda:resultVariable="score">
      <script><![CDATA[return amount * 2]]></script>
    </scriptTask>
    <exclusiveGateway id="check" default="toManual" />
    <userTask id="manual" camunda:assignee="demo" />
    <serviceTask id="auto" camunda:expression="${score &gt; 10}" camunda:async="true" />
    <endEvent id="end" />
    <sequenceFlow id="f1" sourceRef="start" targetRef="score" />
    <sequenceFlow id="f2" sourceRef="score" targetRef="check" />
    <sequenceFlow id="toAuto" sourceRef="check" targetRef="auto">
      <conditionExpression>${score &gt; 10}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="toManual" sourceRef="check" targetRef="manual" />
    <sequenceFlow id="f5" sourceRef="auto" targetRef="end" />
    <sequenceFlow id="f6" sourceRef="manual" targetRef="end" />
  </process>
</definitions>"#;

    #[test]
    fn test_parse_process() {
        let definitions = parse_resource("orders.bpmn", ORDER_PROCESS.as_bytes()).unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].key, "order-process");
        assert_eq!(definitions[0].kind(), DefinitionKind::Process);

        let DefinitionModel::Process(process) = &definitions[0].model else {
            panic!("expected a process");
        };
        assert_eq!(process.activities.len(), 6);
        assert_eq!(process.flows.len(), 6);

        let to_auto = process.flows.iter().find(|f| f.id == "toAuto").unwrap();
        assert_eq!(to_auto.condition.as_deref(), Some("${score > 10}"));

        let score = process.activity("score").unwrap();
        assert_eq!(
            score.kind,
            ActivityKind::ScriptTask {
                format: "lua".to_string(),
                script: "return amount * 2".to_string(),
                result_variable: Some("score".to_string()),
            }
        );
        assert!(process.activity("auto").unwrap().async_before);
        assert_eq!(process.activity("check").unwrap().default_flow.as_deref(), Some("toManual"));
    }

    #[test]
    fn test_parse_decision_table() {
        let dmn = r#"<definitions xmlns="https://www.omg.org/spec/DMN/20191111/MODEL/">
  <decision id="dish" name="Dish">
    <decisionTable id="table" hitPolicy="COLLECT" aggregation="SUM">
      <input id="in1" label="Season"><inputExpression><text>season</text></inputExpression></input>
      <output id="out1" name="dish" />
      <rule id="r1"><inputEntry><text>"Winter"</text></inputEntry><outputEntry><text>3</text></outputEntry></rule>
      <rule id="r2"><inputEntry><text></text></inputEntry><outputEntry><text>1</text></outputEntry></rule>
    </decisionTable>
  </decision>
</definitions>"#;

        let definitions = parse_resource("dish.dmn11.xml", dmn.as_bytes()).unwrap();
        let DefinitionModel::Decision(decision) = &definitions[0].model else {
            panic!("expected a decision");
        };
        assert_eq!(decision.hit_policy, HitPolicy::Collect);
        assert_eq!(decision.aggregation, Some(Aggregation::Sum));
        assert_eq!(decision.inputs[0].expression, "season");
        assert_eq!(decision.rules[0].input_entries, vec!["\"Winter\"".to_string()]);
        assert_eq!(decision.rules[1].input_entries, vec![String::new()]);
    }

    #[test]
    fn test_parse_case_plan_items() {
        let cmmn = r#"<definitions xmlns="http://www.omg.org/spec/CMMN/20151109/MODEL">
  <case id="claim" name="Claim">
    <casePlanModel id="plan">
      <planItem id="pi_review" definitionRef="review" />
      <humanTask id="review" name="Review" />
    </casePlanModel>
  </case>
</definitions>"#;

        let definitions = parse_resource("claim.cmmn", cmmn.as_bytes()).unwrap();
        let DefinitionModel::Case(case) = &definitions[0].model else {
            panic!("expected a case");
        };
        assert_eq!(case.plan_items[0].definition_type.as_deref(), Some("humanTask"));
    }

    #[test]
    fn test_rejects_dangling_flow() {
        let bpmn = r#"<definitions><process id="p"><startEvent id="s"/>
            <sequenceFlow id="f" sourceRef="s" targetRef="missing"/></process></definitions>"#;
        let err = parse_resource("p.bpmn", bpmn.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_unknown_suffix_yields_nothing() {
        assert!(parse_resource("readme.txt", b"not xml").unwrap().is_empty());
        assert_eq!(ResourceKind::for_resource("a.BPMN20.XML"), Some(ResourceKind::Bpmn));
    }
}
