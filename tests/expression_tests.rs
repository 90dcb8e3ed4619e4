//! Resolver chain behaviour seen from outside the crate

use bpm_platform::engine::{ProcessApplication, ProcessApplicationReference};
use bpm_platform::error::PlatformError;
use bpm_platform::expression::{
    ElResolver, ElValue, ExpressionManager, FunctionTable, ResolveContext, SimpleVariableScope,
};
use bpm_platform::runtime::{Clock, FixedClock};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn manager_with_beans(beans: &[(&str, Value)]) -> ExpressionManager {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 4, 8, 30, 0).unwrap()));
    let beans: HashMap<String, ElValue> = beans
        .iter()
        .map(|(name, value)| (name.to_string(), ElValue::Json(value.clone())))
        .collect();
    ExpressionManager::new(FunctionTable::standard(clock)).with_beans(beans)
}

#[derive(Debug)]
struct GreetingResolver;

impl ElResolver for GreetingResolver {
    fn name(&self) -> &'static str {
        "greeting"
    }

    fn get_value(
        &self,
        _ctx: &ResolveContext<'_>,
        base: Option<&ElValue>,
        property: &Value,
    ) -> bpm_platform::error::Result<Option<ElValue>> {
        match (base, property.as_str()) {
            (None, Some("greeting")) => Ok(Some(ElValue::Json(json!("hello from the application")))),
            _ => Ok(None),
        }
    }
}

#[derive(Debug)]
struct InvoiceApplication;

impl ProcessApplication for InvoiceApplication {
    fn name(&self) -> &str {
        "invoice-app"
    }

    fn el_resolver(&self) -> Option<Arc<dyn ElResolver>> {
        Some(Arc::new(GreetingResolver))
    }
}

#[test]
fn test_scope_variable_shadows_bean() {
    let manager = manager_with_beans(&[("x", json!(2)), ("rate", json!(0.5))]);
    let scope = SimpleVariableScope::new("s").with_variable("x", json!(1));

    assert_eq!(manager.evaluate_json("${x}", &scope).unwrap(), json!(1));
    assert_eq!(manager.evaluate_json("${rate * 3}", &scope).unwrap(), json!(1.5));
}

#[test]
fn test_beans_are_read_only() {
    let manager = manager_with_beans(&[("limit", json!(100))]);
    let scope = SimpleVariableScope::new("s");

    let target = manager.compile("${limit}").unwrap();
    let err = manager.set_value(&target, &scope, json!(5)).unwrap_err();
    assert!(matches!(err, PlatformError::Unsupported(_)), "{err:?}");
    assert_eq!(manager.evaluate_json("${limit}", &scope).unwrap(), json!(100));
}

#[test]
fn test_process_application_resolver_is_consulted_after_beans() {
    let manager = manager_with_beans(&[]);
    let application: Arc<dyn ProcessApplication> = Arc::new(InvoiceApplication);
    let scope = SimpleVariableScope::new("s")
        .with_process_application(ProcessApplicationReference::new(&application));

    assert_eq!(
        manager.evaluate_json("${greeting}", &scope).unwrap(),
        json!("hello from the application")
    );
}

#[test]
fn test_dropped_process_application_is_unavailable() {
    let manager = manager_with_beans(&[]);
    let application: Arc<dyn ProcessApplication> = Arc::new(InvoiceApplication);
    let reference = ProcessApplicationReference::new(&application);
    drop(application);

    let scope = SimpleVariableScope::new("s")
        .with_variable("known", json!(true))
        .with_process_application(reference);

    // the scope answers before the application is asked
    assert_eq!(manager.evaluate_json("${known}", &scope).unwrap(), json!(true));

    let err = manager.evaluate_json("${greeting}", &scope).unwrap_err();
    assert!(matches!(err, PlatformError::Unavailable(_)), "{err:?}");
}

#[test]
fn test_functions_read_clock_and_identity() {
    let manager = manager_with_beans(&[]);
    let scope = SimpleVariableScope::new("s").with_authenticated_user("gonzo", &["sales", "ops"]);

    assert_eq!(
        manager.evaluate_json("${now()}", &scope).unwrap(),
        json!("2024-05-04T08:30:00+00:00")
    );
    assert_eq!(
        manager.evaluate_json("Assigned to ${currentUser()}", &scope).unwrap(),
        json!("Assigned to gonzo")
    );
    assert_eq!(manager.evaluate_json("${authenticatedUserId}", &scope).unwrap(), json!("gonzo"));
    assert!(manager
        .evaluate_condition("${currentUserGroups()[1] == 'ops'}", &scope)
        .unwrap());
}
