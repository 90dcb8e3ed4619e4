/// Resolver chain consulted while evaluating expressions
///
/// Resolvers are tried in a fixed order until one claims the property:
/// variable scope, bean map, process application, index access, bean
/// properties. A claim is explicit (`Some` / `true`); declining lets the next
/// resolver try.

use crate::engine::application::ProcessApplicationReference;
use crate::error::{ExpressionError, PlatformError, Result};
use crate::expression::coerce;
use crate::expression::functions::FunctionTable;
use crate::expression::scope::{ElValue, ScopeKind, VariableScope};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

pub const EXECUTION_KEY: &str = "execution";
pub const TASK_KEY: &str = "task";
pub const CASE_EXECUTION_KEY: &str = "caseExecution";
pub const EXTERNAL_TASK_KEY: &str = "externalTask";
pub const AUTHENTICATED_USER_ID_KEY: &str = "authenticatedUserId";

const RESERVED_KEYS: [&str; 5] = [
    EXECUTION_KEY,
    TASK_KEY,
    CASE_EXECUTION_KEY,
    EXTERNAL_TASK_KEY,
    AUTHENTICATED_USER_ID_KEY,
];

/// Extra information about the call site of an evaluation
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub activity_id: Option<String>,
    pub attributes: Map<String, Value>,
}

/// Per-evaluation inputs handed to every resolver
pub struct ResolveContext<'a> {
    pub expression: &'a str,
    pub scope: &'a dyn VariableScope,
    pub invocation: Option<&'a InvocationContext>,
}

impl ResolveContext<'_> {
    fn evaluation_error(&self, cause: impl Into<String>) -> PlatformError {
        ExpressionError::Evaluation {
            expression: self.expression.to_string(),
            cause: cause.into(),
        }
        .into()
    }
}

/// One link in the resolver chain
pub trait ElResolver: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// `Ok(None)` leaves the property unresolved for the next resolver
    fn get_value(
        &self,
        ctx: &ResolveContext<'_>,
        base: Option<&ElValue>,
        property: &Value,
    ) -> Result<Option<ElValue>>;

    /// `Ok(false)` declines the assignment; read-only resolvers always decline
    fn set_value(
        &self,
        _ctx: &ResolveContext<'_>,
        _base: Option<&mut ElValue>,
        _property: &Value,
        _value: &Value,
    ) -> Result<bool> {
        Ok(false)
    }

    /// `Ok(None)` when this resolver knows no such method
    fn invoke(
        &self,
        _ctx: &ResolveContext<'_>,
        _base: &ElValue,
        _method: &str,
        _args: &[ElValue],
    ) -> Result<Option<ElValue>> {
        Ok(None)
    }
}

/// Ordered resolver chain plus the function table of one scope
#[derive(Debug)]
pub struct ElContext {
    resolvers: Vec<Arc<dyn ElResolver>>,
    functions: Arc<FunctionTable>,
}

impl ElContext {
    /// Context consulting `resolvers` in order
    pub fn new(resolvers: Vec<Arc<dyn ElResolver>>, functions: Arc<FunctionTable>) -> Self {
        Self {
            resolvers,
            functions,
        }
    }

    /// Resolver names in consultation order
    pub fn resolver_names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    /// Function table
    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// First resolver answer for `property`
    pub fn get_value(
        &self,
        ctx: &ResolveContext<'_>,
        base: Option<&ElValue>,
        property: &Value,
    ) -> Result<Option<ElValue>> {
        for resolver in &self.resolvers {
            if let Some(value) = resolver.get_value(ctx, base, property)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Assign through the first resolver that accepts
    pub fn set_value(
        &self,
        ctx: &ResolveContext<'_>,
        mut base: Option<&mut ElValue>,
        property: &Value,
        value: &Value,
    ) -> Result<bool> {
        for resolver in &self.resolvers {
            if resolver.set_value(ctx, base.as_deref_mut(), property, value)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Invoke `method` on `base`
    pub fn invoke(
        &self,
        ctx: &ResolveContext<'_>,
        base: &ElValue,
        method: &str,
        args: &[ElValue],
    ) -> Result<Option<ElValue>> {
        for resolver in &self.resolvers {
            if let Some(value) = resolver.invoke(ctx, base, method, args)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

fn property_name(property: &Value) -> Option<&str> {
    property.as_str()
}

/// Variables and reserved identifiers of the evaluating scope
#[derive(Debug, Default)]
pub struct VariableScopeResolver;

impl ElResolver for VariableScopeResolver {
    fn name(&self) -> &'static str {
        "variable-scope"
    }

    fn get_value(
        &self,
        ctx: &ResolveContext<'_>,
        base: Option<&ElValue>,
        property: &Value,
    ) -> Result<Option<ElValue>> {
        let (None, Some(name)) = (base, property_name(property)) else {
            return Ok(None);
        };
        let scope = ctx.scope;

        let reserved = match (name, scope.kind()) {
            (EXECUTION_KEY, ScopeKind::Execution) => scope.as_bean(),
            (EXECUTION_KEY, ScopeKind::Task | ScopeKind::ExternalTask) => scope.execution(),
            (TASK_KEY, ScopeKind::Task) => scope.as_bean(),
            (CASE_EXECUTION_KEY, ScopeKind::CaseExecution) => scope.as_bean(),
            (CASE_EXECUTION_KEY, ScopeKind::Task) => scope.case_execution(),
            (EXTERNAL_TASK_KEY, ScopeKind::ExternalTask) => scope.as_bean(),
            _ => None,
        };
        if let Some(bean) = reserved {
            return Ok(Some(ElValue::Bean(bean)));
        }

        if name == AUTHENTICATED_USER_ID_KEY {
            let user = scope
                .authenticated_user_id()
                .map(Value::String)
                .unwrap_or(Value::Null);
            return Ok(Some(ElValue::Json(user)));
        }

        Ok(scope.get_variable(name).map(ElValue::Json))
    }

    fn set_value(
        &self,
        ctx: &ResolveContext<'_>,
        base: Option<&mut ElValue>,
        property: &Value,
        value: &Value,
    ) -> Result<bool> {
        let (None, Some(name)) = (base, property_name(property)) else {
            return Ok(false);
        };
        if RESERVED_KEYS.contains(&name) || !ctx.scope.has_variable(name) {
            return Ok(false);
        }
        ctx.scope.set_variable(name, value.clone());
        Ok(true)
    }
}

/// Fixed, read-only map of named values
#[derive(Debug, Default)]
pub struct BeanMapResolver {
    beans: HashMap<String, ElValue>,
}

impl BeanMapResolver {
    /// Read-only resolver over `beans`
    pub fn new(beans: HashMap<String, ElValue>) -> Self {
        Self { beans }
    }

    /// Number of beans
    pub fn len(&self) -> usize {
        self.beans.len()
    }

    /// Whether there are no beans
    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }
}

impl ElResolver for BeanMapResolver {
    fn name(&self) -> &'static str {
        "bean-map"
    }

    fn get_value(
        &self,
        _ctx: &ResolveContext<'_>,
        base: Option<&ElValue>,
        property: &Value,
    ) -> Result<Option<ElValue>> {
        match (base, property_name(property)) {
            (None, Some(name)) => Ok(self.beans.get(name).cloned()),
            _ => Ok(None),
        }
    }
}

/// Delegates to the resolver contributed by the scope's process application
///
/// Skipped when the scope has no process application. A reference whose
/// application is gone fails with `Unavailable`.
#[derive(Debug, Default)]
pub struct ProcessApplicationResolver {
    application: Option<ProcessApplicationReference>,
}

impl ProcessApplicationResolver {
    /// Resolver delegating to the application behind `application`
    pub fn new(application: Option<ProcessApplicationReference>) -> Self {
        Self { application }
    }

    fn delegate(&self) -> Result<Option<Arc<dyn ElResolver>>> {
        match &self.application {
            None => Ok(None),
            Some(reference) => Ok(reference.get()?.el_resolver()),
        }
    }
}

impl ElResolver for ProcessApplicationResolver {
    fn name(&self) -> &'static str {
        "process-application"
    }

    fn get_value(
        &self,
        ctx: &ResolveContext<'_>,
        base: Option<&ElValue>,
        property: &Value,
    ) -> Result<Option<ElValue>> {
        match self.delegate()? {
            Some(resolver) => resolver.get_value(ctx, base, property),
            None => Ok(None),
        }
    }

    fn set_value(
        &self,
        ctx: &ResolveContext<'_>,
        base: Option<&mut ElValue>,
        property: &Value,
        value: &Value,
    ) -> Result<bool> {
        match self.delegate()? {
            Some(resolver) => resolver.set_value(ctx, base, property, value),
            None => Ok(false),
        }
    }

    fn invoke(
        &self,
        ctx: &ResolveContext<'_>,
        base: &ElValue,
        method: &str,
        args: &[ElValue],
    ) -> Result<Option<ElValue>> {
        match self.delegate()? {
            Some(resolver) => resolver.invoke(ctx, base, method, args),
            None => Ok(None),
        }
    }
}

/// Array, list and map access on JSON values
#[derive(Debug, Default)]
pub struct IndexResolver;

fn array_index(ctx: &ResolveContext<'_>, property: &Value) -> Result<i64> {
    match property {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ctx.evaluation_error(format!("Invalid index {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| ctx.evaluation_error(format!("Invalid index '{}'", s))),
        other => Err(ctx.evaluation_error(format!(
            "Invalid index {}",
            coerce::describe(other)
        ))),
    }
}

impl ElResolver for IndexResolver {
    fn name(&self) -> &'static str {
        "index"
    }

    fn get_value(
        &self,
        ctx: &ResolveContext<'_>,
        base: Option<&ElValue>,
        property: &Value,
    ) -> Result<Option<ElValue>> {
        match base {
            Some(ElValue::Json(Value::Array(items))) => {
                let index = array_index(ctx, property)?;
                let item = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(Some(ElValue::Json(item)))
            }
            Some(ElValue::Json(Value::Object(map))) => {
                let key = coerce::to_text(property);
                Ok(Some(ElValue::Json(
                    map.get(&key).cloned().unwrap_or(Value::Null),
                )))
            }
            _ => Ok(None),
        }
    }

    fn set_value(
        &self,
        ctx: &ResolveContext<'_>,
        base: Option<&mut ElValue>,
        property: &Value,
        value: &Value,
    ) -> Result<bool> {
        match base {
            Some(ElValue::Json(Value::Array(items))) => {
                let index = array_index(ctx, property)?;
                let len = items.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| {
                        ctx.evaluation_error(format!(
                            "Index {} out of bounds for list of size {}",
                            index, len
                        ))
                    })?;
                *slot = value.clone();
                Ok(true)
            }
            Some(ElValue::Json(Value::Object(map))) => {
                map.insert(coerce::to_text(property), value.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Properties and methods of beans, plus the built-in methods of JSON values
#[derive(Debug, Default)]
pub struct BeanPropertyResolver;

impl ElResolver for BeanPropertyResolver {
    fn name(&self) -> &'static str {
        "bean-property"
    }

    fn get_value(
        &self,
        _ctx: &ResolveContext<'_>,
        base: Option<&ElValue>,
        property: &Value,
    ) -> Result<Option<ElValue>> {
        match (base, property_name(property)) {
            (Some(ElValue::Bean(bean)), Some(name)) => Ok(bean.get_property(name)),
            _ => Ok(None),
        }
    }

    fn set_value(
        &self,
        _ctx: &ResolveContext<'_>,
        base: Option<&mut ElValue>,
        property: &Value,
        value: &Value,
    ) -> Result<bool> {
        match (base, property_name(property)) {
            (Some(ElValue::Bean(bean)), Some(name)) => Ok(bean.set_property(name, value.clone())),
            _ => Ok(false),
        }
    }

    fn invoke(
        &self,
        ctx: &ResolveContext<'_>,
        base: &ElValue,
        method: &str,
        args: &[ElValue],
    ) -> Result<Option<ElValue>> {
        let outcome = match base {
            ElValue::Bean(bean) => bean.invoke(method, args),
            ElValue::Json(value) => {
                let args: Vec<Value> = args.iter().map(ElValue::to_json).collect();
                json_method(value, method, &args).map(|r| r.map(ElValue::Json))
            }
        };
        match outcome {
            None => Ok(None),
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(cause)) => Err(ctx.evaluation_error(cause)),
        }
    }
}

fn arg<'v>(args: &'v [Value], index: usize, method: &str) -> std::result::Result<&'v Value, String> {
    args.get(index)
        .ok_or_else(|| format!("Method '{}' expects at least {} argument(s)", method, index + 1))
}

fn int_arg(args: &[Value], index: usize, method: &str) -> std::result::Result<usize, String> {
    arg(args, index, method)?
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| format!("Method '{}' expects a non-negative integer argument", method))
}

/// Built-in methods on JSON values
fn json_method(
    value: &Value,
    method: &str,
    args: &[Value],
) -> Option<std::result::Result<Value, String>> {
    let result = match (value, method) {
        (_, "equals") => arg(args, 0, method).and_then(|other| coerce::equals(value, other).map(Value::Bool)),
        (_, "toString") => Ok(Value::String(coerce::to_text(value))),
        (_, "compareTo") => arg(args, 0, method)
            .and_then(|other| coerce::ordering(value, other))
            .map(|ordering| Value::from(ordering as i64)),

        (Value::String(s), "length") => Ok(Value::from(s.chars().count())),
        (Value::String(s), "isEmpty") => Ok(Value::Bool(s.is_empty())),
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "startsWith") => {
            arg(args, 0, method).map(|p| Value::Bool(s.starts_with(&coerce::to_text(p))))
        }
        (Value::String(s), "endsWith") => {
            arg(args, 0, method).map(|p| Value::Bool(s.ends_with(&coerce::to_text(p))))
        }
        (Value::String(s), "contains") => {
            arg(args, 0, method).map(|p| Value::Bool(s.contains(&coerce::to_text(p))))
        }
        (Value::String(s), "equalsIgnoreCase") => arg(args, 0, method)
            .map(|p| Value::Bool(s.to_lowercase() == coerce::to_text(p).to_lowercase())),
        (Value::String(s), "indexOf") => arg(args, 0, method).map(|p| {
            let needle = coerce::to_text(p);
            s.find(&needle)
                .map(|byte| Value::from(s[..byte].chars().count()))
                .unwrap_or(Value::from(-1))
        }),
        (Value::String(s), "substring") => {
            let chars: Vec<char> = s.chars().collect();
            int_arg(args, 0, method).and_then(|start| {
                let end = match args.get(1) {
                    Some(_) => int_arg(args, 1, method)?,
                    None => chars.len(),
                };
                if start > end || end > chars.len() {
                    return Err(format!("substring({}, {}) out of range", start, end));
                }
                Ok(Value::String(chars[start..end].iter().collect()))
            })
        }

        (Value::Array(items), "size") => Ok(Value::from(items.len())),
        (Value::Array(items), "isEmpty") => Ok(Value::Bool(items.is_empty())),
        (Value::Array(items), "contains") => arg(args, 0, method).map(|needle| {
            Value::Bool(items.iter().any(|item| coerce::equals(item, needle).unwrap_or(false)))
        }),
        (Value::Array(items), "indexOf") => arg(args, 0, method).map(|needle| {
            items
                .iter()
                .position(|item| coerce::equals(item, needle).unwrap_or(false))
                .map(Value::from)
                .unwrap_or(Value::from(-1))
        }),
        (Value::Array(items), "get") => int_arg(args, 0, method).and_then(|i| {
            items
                .get(i)
                .cloned()
                .ok_or_else(|| format!("Index {} out of bounds for list of size {}", i, items.len()))
        }),

        (Value::Object(map), "size") => Ok(Value::from(map.len())),
        (Value::Object(map), "isEmpty") => Ok(Value::Bool(map.is_empty())),
        (Value::Object(map), "containsKey") => {
            arg(args, 0, method).map(|key| Value::Bool(map.contains_key(&coerce::to_text(key))))
        }
        (Value::Object(map), "get") => arg(args, 0, method)
            .map(|key| map.get(&coerce::to_text(key)).cloned().unwrap_or(Value::Null)),
        (Value::Object(map), "keySet") => Ok(Value::Array(
            map.keys().cloned().map(Value::String).collect(),
        )),

        (Value::Number(_), "intValue" | "longValue") => {
            coerce::to_number(value).map(|n| match n {
                coerce::Num::Int(i) => Value::from(i),
                coerce::Num::Float(f) => Value::from(f.trunc() as i64),
            })
        }
        (Value::Number(n), "doubleValue") => Ok(n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        (Value::Bool(b), "booleanValue") => Ok(Value::Bool(*b)),

        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::scope::SimpleVariableScope;
    use serde_json::json;

    fn ctx<'a>(scope: &'a SimpleVariableScope) -> ResolveContext<'a> {
        ResolveContext {
            expression: "${test}",
            scope,
            invocation: None,
        }
    }

    #[test]
    fn test_scope_resolver_claims_only_known_variables() {
        let scope = SimpleVariableScope::new("s").with_variable("x", json!(1));
        let resolver = VariableScopeResolver;

        let hit = resolver.get_value(&ctx(&scope), None, &json!("x")).unwrap();
        assert_eq!(hit.map(ElValue::into_json), Some(json!(1)));
        assert!(resolver.get_value(&ctx(&scope), None, &json!("y")).unwrap().is_none());

        assert!(resolver.set_value(&ctx(&scope), None, &json!("x"), &json!(5)).unwrap());
        assert!(!resolver.set_value(&ctx(&scope), None, &json!("y"), &json!(5)).unwrap());
        assert_eq!(scope.get_variable("x"), Some(json!(5)));
    }

    #[test]
    fn test_authenticated_user_is_reserved() {
        let scope = SimpleVariableScope::new("s")
            .with_variable("authenticatedUserId", json!("spoofed"))
            .with_authenticated_user("fozzie", &[]);
        let value = VariableScopeResolver
            .get_value(&ctx(&scope), None, &json!("authenticatedUserId"))
            .unwrap()
            .unwrap();
        assert_eq!(value.into_json(), json!("fozzie"));
    }

    #[test]
    fn test_bean_map_is_read_only() {
        let mut beans = HashMap::new();
        beans.insert("limits".to_string(), ElValue::Json(json!({"max": 3})));
        let resolver = BeanMapResolver::new(beans);
        let scope = SimpleVariableScope::new("s");

        assert!(resolver.get_value(&ctx(&scope), None, &json!("limits")).unwrap().is_some());
        assert!(!resolver.set_value(&ctx(&scope), None, &json!("limits"), &json!(1)).unwrap());
    }

    #[test]
    fn test_index_resolver_reads_and_writes_json() {
        let scope = SimpleVariableScope::new("s");
        let resolver = IndexResolver;
        let mut list = ElValue::Json(json!(["a", "b"]));

        let second = resolver.get_value(&ctx(&scope), Some(&list), &json!(1)).unwrap().unwrap();
        assert_eq!(second.into_json(), json!("b"));
        let missing = resolver.get_value(&ctx(&scope), Some(&list), &json!(7)).unwrap().unwrap();
        assert!(missing.is_null());

        assert!(resolver.set_value(&ctx(&scope), Some(&mut list), &json!(0), &json!("z")).unwrap());
        assert_eq!(list.to_json(), json!(["z", "b"]));
        assert!(resolver.set_value(&ctx(&scope), Some(&mut list), &json!(5), &json!("z")).is_err());
    }

    #[test]
    fn test_json_methods() {
        assert_eq!(
            json_method(&json!(["foo", "bar"]), "contains", &[json!("foo")]).unwrap().unwrap(),
            json!(true)
        );
        assert_eq!(
            json_method(&json!("Hello"), "substring", &[json!(1), json!(3)]).unwrap().unwrap(),
            json!("el")
        );
        assert_eq!(
            json_method(&json!(123), "compareTo", &[json!(0)]).unwrap().unwrap(),
            json!(1)
        );
        assert!(json_method(&json!("x"), "explode", &[]).is_none());
    }
}
