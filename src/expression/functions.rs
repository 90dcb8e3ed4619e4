/// Function table for `${fn(...)}` calls
///
/// Built once per engine and shared by `Arc`; there is no global registry.

use crate::error::{PlatformError, Result};
use crate::expression::scope::{ElValue, VariableScope};
use crate::runtime::clock::Clock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type ElFunction =
    Arc<dyn Fn(&dyn VariableScope, &[ElValue]) -> Result<ElValue> + Send + Sync>;

/// Immutable name → function table
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, ElFunction>,
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

impl FunctionTable {
    /// Builder for a custom table
    pub fn builder() -> FunctionTableBuilder {
        FunctionTableBuilder::default()
    }

    /// Date and authentication functions available in every engine
    ///
    /// `now()` and `dateTime()` read the injected clock; `currentUser()` and
    /// `currentUserGroups()` read the authentication of the evaluating scope.
    pub fn standard(clock: Arc<dyn Clock>) -> Self {
        let now_clock = Arc::clone(&clock);
        let date_time_clock = clock;

        Self::builder()
            .function(None, "now", move |_, _| {
                Ok(ElValue::Json(Value::String(now_clock.now().to_rfc3339())))
            })
            .function(None, "dateTime", move |_, _| {
                Ok(ElValue::Json(Value::String(date_time_clock.now().to_rfc3339())))
            })
            .function(None, "currentUser", |scope, _| {
                Ok(ElValue::Json(
                    scope
                        .authenticated_user_id()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                ))
            })
            .function(None, "currentUserGroups", |scope, _| {
                let groups = scope
                    .authenticated_group_ids()
                    .into_iter()
                    .map(Value::String)
                    .collect();
                Ok(ElValue::Json(Value::Array(groups)))
            })
            .build()
    }

    /// Function by optional namespace and name
    pub fn resolve(&self, namespace: Option<&str>, name: &str) -> Option<&ElFunction> {
        self.functions.get(&qualified(namespace, name))
    }

    /// Call a registered function
    pub fn call(
        &self,
        namespace: Option<&str>,
        name: &str,
        scope: &dyn VariableScope,
        args: &[ElValue],
    ) -> Result<ElValue> {
        let function = self.resolve(namespace, name).ok_or_else(|| {
            PlatformError::NotFound(format!("function '{}'", qualified(namespace, name)))
        })?;
        function(scope, args)
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether no function is registered
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn qualified(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}:{}", ns, name),
        None => name.to_string(),
    }
}

/// Collects functions for a `FunctionTable`
#[derive(Default)]
pub struct FunctionTableBuilder {
    functions: HashMap<String, ElFunction>,
}

impl FunctionTableBuilder {
    /// Register `function` under `namespace:name`
    pub fn function<F>(mut self, namespace: Option<&str>, name: &str, function: F) -> Self
    where
        F: Fn(&dyn VariableScope, &[ElValue]) -> Result<ElValue> + Send + Sync + 'static,
    {
        self.functions
            .insert(qualified(namespace, name), Arc::new(function));
        self
    }

    /// Merge another table; entries of `other` win on name clashes
    pub fn extend(mut self, other: &FunctionTable) -> Self {
        for (name, function) in &other.functions {
            self.functions.insert(name.clone(), Arc::clone(function));
        }
        self
    }

    /// Freeze the table
    pub fn build(self) -> FunctionTable {
        FunctionTable {
            functions: self.functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::scope::SimpleVariableScope;
    use crate::runtime::clock::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn table() -> FunctionTable {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        FunctionTable::standard(clock)
    }

    #[test]
    fn test_standard_functions() {
        let table = table();
        let scope = SimpleVariableScope::new("scope").with_authenticated_user("kermit", &["management"]);

        let now = table.call(None, "now", &scope, &[]).unwrap().into_json();
        assert_eq!(now, json!("2024-03-01T12:00:00+00:00"));

        let user = table.call(None, "currentUser", &scope, &[]).unwrap().into_json();
        assert_eq!(user, json!("kermit"));

        let groups = table.call(None, "currentUserGroups", &scope, &[]).unwrap().into_json();
        assert_eq!(groups, json!(["management"]));
    }

    #[test]
    fn test_unknown_function_is_not_found() {
        let scope = SimpleVariableScope::new("scope");
        let err = table().call(Some("str"), "upper", &scope, &[]).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("str:upper"));
    }

    #[test]
    fn test_builder_extends_table() {
        let custom = FunctionTable::builder()
            .function(Some("math"), "double", |_, args| {
                let n = args.first().and_then(|a| a.as_json()).and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(ElValue::Json(json!(n * 2)))
            })
            .build();
        let merged = FunctionTable::builder().extend(&table()).extend(&custom).build();

        assert_eq!(merged.len(), 5);
        let scope = SimpleVariableScope::new("scope");
        let doubled = merged
            .call(Some("math"), "double", &scope, &[ElValue::Json(json!(21))])
            .unwrap();
        assert_eq!(doubled.into_json(), json!(42));
    }
}
