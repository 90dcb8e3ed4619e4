/// Decision table evaluation
///
/// Input expressions go through the expression manager; input entries use a
/// small subset of unary tests: `-`, literals, comparisons, ranges, comma
/// lists and `not(...)`.

use crate::engine::parser::{Aggregation, DecisionModel, HitPolicy};
use crate::error::{ExpressionError, PlatformError, Result};
use crate::expression::manager::ExpressionManager;
use crate::expression::scope::VariableScope;
use crate::runtime::entity::{DecisionEvaluation, EvaluatedInput, EvaluatedOutput, MatchedRule};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Evaluation record plus the value handed back to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResult {
    pub evaluation: DecisionEvaluation,
    pub value: Value,
}

fn evaluation_error(expression: &str, cause: impl Into<String>) -> PlatformError {
    ExpressionError::Evaluation {
        expression: expression.to_string(),
        cause: cause.into(),
    }
    .into()
}

fn as_expression(text: &str) -> String {
    if text.contains("${") || text.contains("#{") {
        text.to_string()
    } else {
        format!("${{{}}}", text.trim())
    }
}

fn parse_literal(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        return Some(Value::String(text[1..text.len() - 1].to_string()));
    }
    match text {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if let Ok(int) = text.parse::<i64>() {
        return Some(Value::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => compare(left, right) == Some(Ordering::Equal),
        _ => left == right,
    }
}

/// Split on commas outside quotes and brackets
fn split_alternatives(entry: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in entry.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '[' | '(' if !quoted => depth += 1,
            ']' | ')' if !quoted => depth -= 1,
            ',' if !quoted && depth <= 0 => {
                parts.push(&entry[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&entry[start..]);
    parts
}

fn literal_or_error(entry: &str, text: &str) -> Result<Value> {
    parse_literal(text).ok_or_else(|| evaluation_error(entry, format!("unsupported input entry '{}'", text.trim())))
}

fn matches_range(entry: &str, test: &str, value: &Value) -> Result<bool> {
    let open_inclusive = test.starts_with('[');
    let close_inclusive = test.ends_with(']');
    let inner = &test[1..test.len() - 1];
    let (low, high) = inner
        .split_once("..")
        .ok_or_else(|| evaluation_error(entry, format!("malformed range '{}'", test)))?;
    let low = literal_or_error(entry, low)?;
    let high = literal_or_error(entry, high)?;

    let above = match compare(value, &low) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Equal) => open_inclusive,
        _ => false,
    };
    let below = match compare(value, &high) {
        Some(Ordering::Less) => true,
        Some(Ordering::Equal) => close_inclusive,
        _ => false,
    };
    Ok(above && below)
}

fn matches_test(entry: &str, test: &str, value: &Value) -> Result<bool> {
    let test = test.trim();
    if test.is_empty() || test == "-" {
        return Ok(true);
    }
    if let Some(inner) = test.strip_prefix("not(").and_then(|t| t.strip_suffix(')')) {
        return matches_entry(inner, value).map(|matched| !matched);
    }

    for (operator, accept) in [
        ("<=", &[Ordering::Less, Ordering::Equal][..]),
        (">=", &[Ordering::Greater, Ordering::Equal][..]),
        ("<", &[Ordering::Less][..]),
        (">", &[Ordering::Greater][..]),
    ] {
        if let Some(rest) = test.strip_prefix(operator) {
            let bound = literal_or_error(entry, rest)?;
            return Ok(compare(value, &bound).map(|o| accept.contains(&o)).unwrap_or(false));
        }
    }

    if (test.starts_with('[') || test.starts_with(']')) && test.contains("..") {
        return matches_range(entry, test, value);
    }

    let literal = literal_or_error(entry, test)?;
    Ok(loosely_equal(value, &literal))
}

/// Whether `value` satisfies one input entry
pub fn matches_entry(entry: &str, value: &Value) -> Result<bool> {
    for alternative in split_alternatives(entry) {
        if matches_test(entry, alternative, value)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn output_value(expressions: &ExpressionManager, entry: &str, scope: &dyn VariableScope) -> Result<Value> {
    if entry.trim().is_empty() {
        return Ok(Value::Null);
    }
    match parse_literal(entry) {
        Some(value) => Ok(value),
        None => expressions.evaluate_json(&as_expression(entry), scope),
    }
}

fn aggregate(aggregation: Aggregation, values: &[Value]) -> Option<Number> {
    if aggregation == Aggregation::Count {
        return Some(Number::from(values.len() as u64));
    }
    let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
    if numbers.is_empty() {
        return None;
    }
    let result = match aggregation {
        Aggregation::Sum => numbers.iter().sum(),
        Aggregation::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Count => numbers.len() as f64,
    };
    if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        Some(Number::from(result as i64))
    } else {
        Number::from_f64(result)
    }
}

fn rule_value(rule: &MatchedRule) -> Value {
    if rule.outputs.len() == 1 {
        return rule.outputs[0].value.clone();
    }
    let map: Map<String, Value> = rule
        .outputs
        .iter()
        .map(|o| (o.output_name.clone().unwrap_or_else(|| o.clause_id.clone()), o.value.clone()))
        .collect();
    Value::Object(map)
}

/// Evaluate `decision` against the variables of `scope`
pub fn evaluate_decision(
    expressions: &ExpressionManager,
    decision: &DecisionModel,
    scope: &dyn VariableScope,
) -> Result<DecisionResult> {
    let mut inputs = Vec::with_capacity(decision.inputs.len());
    for input in &decision.inputs {
        let value = if input.expression.trim().is_empty() {
            Value::Null
        } else {
            expressions.evaluate_json(&as_expression(&input.expression), scope)?
        };
        inputs.push(EvaluatedInput {
            clause_id: input.id.clone(),
            clause_name: input.label.clone(),
            value,
        });
    }

    let mut matched = Vec::new();
    for rule in &decision.rules {
        let mut all = true;
        for (entry, input) in rule.input_entries.iter().zip(&inputs) {
            if !matches_entry(entry, &input.value)? {
                all = false;
                break;
            }
        }
        if !all {
            continue;
        }

        let mut outputs = Vec::with_capacity(decision.outputs.len());
        for (entry, output) in rule.output_entries.iter().zip(&decision.outputs) {
            outputs.push(EvaluatedOutput {
                clause_id: output.id.clone(),
                clause_name: output.label.clone(),
                output_name: output.name.clone(),
                value: output_value(expressions, entry, scope)?,
            });
        }
        matched.push(MatchedRule {
            rule_id: rule.id.clone(),
            outputs,
        });

        if decision.hit_policy == HitPolicy::First {
            break;
        }
    }

    let context = format!("decision '{}'", decision.id);
    match decision.hit_policy {
        HitPolicy::Unique if matched.len() > 1 => {
            return Err(evaluation_error(
                &context,
                format!("hit policy UNIQUE violated by {} matching rules", matched.len()),
            ));
        }
        HitPolicy::Any if matched.windows(2).any(|w| rule_value(&w[0]) != rule_value(&w[1])) => {
            return Err(evaluation_error(&context, "hit policy ANY violated by rules with different outputs"));
        }
        _ => {}
    }

    let mut collect_result_value = None;
    let value = match decision.hit_policy {
        HitPolicy::Collect | HitPolicy::RuleOrder => match decision.aggregation {
            Some(aggregation) if decision.hit_policy == HitPolicy::Collect => {
                let firsts: Vec<Value> = matched
                    .iter()
                    .filter_map(|rule| rule.outputs.first().map(|o| o.value.clone()))
                    .collect();
                collect_result_value = aggregate(aggregation, &firsts);
                collect_result_value.clone().map(Value::Number).unwrap_or(Value::Null)
            }
            _ => Value::Array(matched.iter().map(rule_value).collect()),
        },
        _ => matched.first().map(rule_value).unwrap_or(Value::Null),
    };

    Ok(DecisionResult {
        evaluation: DecisionEvaluation {
            decision_definition_key: decision.id.clone(),
            decision_definition_name: decision.name.clone(),
            inputs,
            matched_rules: matched,
            collect_result_value,
            ..Default::default()
        },
        value,
    })
}
