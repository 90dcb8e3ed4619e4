/// Expression manager: compiles, caches and evaluates expressions
///
/// One manager per engine. Compiled expressions are cached by source text;
/// the resolver chain of a scope is built once and stored on the scope.

use crate::error::{ExpressionError, PlatformError, Result};
use crate::expression::ast::{BinaryOp, Expression, Node, Part, UnaryOp};
use crate::expression::coerce;
use crate::expression::functions::FunctionTable;
use crate::expression::parser::parse_expression;
use crate::expression::resolver::{
    BeanMapResolver, BeanPropertyResolver, ElContext, ElResolver, IndexResolver,
    InvocationContext, ProcessApplicationResolver, ResolveContext, VariableScopeResolver,
};
use crate::expression::scope::{ElValue, VariableScope};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Compiles and caches expressions, evaluates them against a scope
#[derive(Debug)]
pub struct ExpressionManager {
    cache: RwLock<HashMap<String, Arc<Expression>>>,
    beans: Arc<BeanMapResolver>,
    functions: Arc<FunctionTable>,
}

impl ExpressionManager {
    /// Manager with `functions` and no beans
    pub fn new(functions: FunctionTable) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            beans: Arc::new(BeanMapResolver::default()),
            functions: Arc::new(functions),
        }
    }

    /// Expose a fixed set of named values to every expression
    pub fn with_beans(mut self, beans: HashMap<String, ElValue>) -> Self {
        self.beans = Arc::new(BeanMapResolver::new(beans));
        self
    }

    /// Function table
    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Parse `text`, reusing a cached compilation
    pub fn compile(&self, text: &str) -> Result<Arc<Expression>> {
        if let Some(expression) = self.cache.read().get(text) {
            return Ok(Arc::clone(expression));
        }

        let expression = Arc::new(parse_expression(text)?);
        debug!("🧮 Compiled expression {}", text);
        self.cache
            .write()
            .entry(text.to_string())
            .or_insert_with(|| Arc::clone(&expression));
        Ok(expression)
    }

    /// Number of cached compilations
    pub fn cached_expressions(&self) -> usize {
        self.cache.read().len()
    }

    /// Resolver chain for `scope`, cached on the scope when it has a slot
    pub fn el_context(&self, scope: &dyn VariableScope) -> Arc<ElContext> {
        match scope.el_context_cache() {
            Some(cache) => cache.get_or_init(|| Arc::new(self.build_context(scope))),
            None => Arc::new(self.build_context(scope)),
        }
    }

    fn build_context(&self, scope: &dyn VariableScope) -> ElContext {
        let beans: Arc<dyn ElResolver> = self.beans.clone();
        let resolvers: Vec<Arc<dyn ElResolver>> = vec![
            Arc::new(VariableScopeResolver),
            beans,
            Arc::new(ProcessApplicationResolver::new(scope.process_application())),
            Arc::new(IndexResolver),
            Arc::new(BeanPropertyResolver),
        ];
        ElContext::new(resolvers, Arc::clone(&self.functions))
    }

    /// Evaluate `text` against `scope`
    pub fn evaluate(
        &self,
        expression: &Expression,
        scope: &dyn VariableScope,
        invocation: Option<&InvocationContext>,
    ) -> Result<ElValue> {
        if expression.is_literal() {
            return Ok(ElValue::Json(Value::String(expression.literal_text())));
        }

        let el = self.el_context(scope);
        let evaluator = Evaluator {
            el: &el,
            ctx: ResolveContext {
                expression: expression.text(),
                scope,
                invocation,
            },
        };

        let result = match expression.single_node() {
            Some(node) => evaluator.eval(node),
            None => {
                let mut text = String::new();
                for part in expression.parts() {
                    match part {
                        Part::Text(literal) => text.push_str(literal),
                        Part::Eval(node) => match evaluator.eval(node) {
                            Ok(value) => text.push_str(&coerce::to_text(&value.into_json())),
                            Err(err) => return Err(wrap(expression.text(), err)),
                        },
                    }
                }
                Ok(ElValue::Json(Value::String(text)))
            }
        };
        result.map_err(|err| wrap(expression.text(), err))
    }

    /// Compile and evaluate in one step, returning plain JSON
    pub fn evaluate_json(&self, text: &str, scope: &dyn VariableScope) -> Result<Value> {
        let expression = self.compile(text)?;
        Ok(self.evaluate(&expression, scope, None)?.into_json())
    }

    /// Evaluate `text` and coerce the result to a boolean
    pub fn evaluate_condition(&self, text: &str, scope: &dyn VariableScope) -> Result<bool> {
        let expression = self.compile(text)?;
        let value = self.evaluate(&expression, scope, None)?.into_json();
        coerce::to_bool(&value).map_err(|cause| {
            ExpressionError::Evaluation {
                expression: text.to_string(),
                cause,
            }
            .into()
        })
    }

    /// Assign `value` to the target named by `expression`
    ///
    /// Only plain `${target}` expressions are assignable. Nested JSON members
    /// are written back to the owning variable.
    pub fn set_value(
        &self,
        expression: &Expression,
        scope: &dyn VariableScope,
        value: Value,
    ) -> Result<()> {
        let node = expression
            .single_node()
            .filter(|node| node.is_lvalue())
            .ok_or_else(|| {
                PlatformError::Unsupported(format!(
                    "Expression '{}' is not assignable",
                    expression.text()
                ))
            })?;

        let el = self.el_context(scope);
        let evaluator = Evaluator {
            el: &el,
            ctx: ResolveContext {
                expression: expression.text(),
                scope,
                invocation: None,
            },
        };
        evaluator
            .assign(node, &value)
            .map_err(|err| wrap(expression.text(), err))
    }
}

fn wrap(expression: &str, err: PlatformError) -> PlatformError {
    match err {
        PlatformError::Expression(_)
        | PlatformError::Unavailable(_)
        | PlatformError::Unsupported(_) => err,
        other => ExpressionError::Evaluation {
            expression: expression.to_string(),
            cause: other.to_string(),
        }
        .into(),
    }
}

struct Evaluator<'a> {
    el: &'a ElContext,
    ctx: ResolveContext<'a>,
}

impl Evaluator<'_> {
    fn error(&self, cause: impl Into<String>) -> PlatformError {
        ExpressionError::Evaluation {
            expression: self.ctx.expression.to_string(),
            cause: cause.into(),
        }
        .into()
    }

    fn json(&self, node: &Node) -> Result<Value> {
        Ok(self.eval(node)?.into_json())
    }

    fn eval(&self, node: &Node) -> Result<ElValue> {
        match node {
            Node::Literal(value) => Ok(ElValue::Json(value.clone())),

            Node::Identifier(name) => self
                .el
                .get_value(&self.ctx, None, &Value::String(name.clone()))?
                .ok_or_else(|| {
                    ExpressionError::UnknownIdentifier {
                        expression: self.ctx.expression.to_string(),
                        identifier: name.clone(),
                    }
                    .into()
                }),

            Node::Property(target, name) => {
                self.member(target, &Value::String(name.clone()))
            }

            Node::Index(target, index) => {
                let key = self.json(index)?;
                self.member(target, &key)
            }

            Node::MethodCall {
                target,
                method,
                args,
            } => {
                let base = self.eval(target)?;
                if base.is_null() {
                    return Err(self.error(format!("Cannot invoke method '{}' on null", method)));
                }
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>>>()?;
                self.el
                    .invoke(&self.ctx, &base, method, &args)?
                    .ok_or_else(|| {
                        ExpressionError::UnknownMethod {
                            expression: self.ctx.expression.to_string(),
                            method: method.clone(),
                        }
                        .into()
                    })
            }

            Node::Function {
                namespace,
                name,
                args,
            } => {
                let function = self
                    .el
                    .functions()
                    .resolve(namespace.as_deref(), name)
                    .ok_or_else(|| ExpressionError::UnknownMethod {
                        expression: self.ctx.expression.to_string(),
                        method: match namespace {
                            Some(ns) => format!("{}:{}", ns, name),
                            None => name.clone(),
                        },
                    })?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>>>()?;
                function(self.ctx.scope, &args)
            }

            Node::Unary(op, operand) => {
                let value = self.eval(operand)?;
                let result = match op {
                    UnaryOp::Not => coerce::to_bool(&value.into_json())
                        .map(|b| Value::Bool(!b))
                        .map_err(|cause| self.error(cause))?,
                    UnaryOp::Negate => {
                        coerce::negate(&value.into_json()).map_err(|cause| self.error(cause))?
                    }
                    UnaryOp::Empty => match value {
                        ElValue::Bean(_) => Value::Bool(false),
                        ElValue::Json(json) => Value::Bool(coerce::is_empty(&json)),
                    },
                };
                Ok(ElValue::Json(result))
            }

            Node::Binary(op, left, right) => self.binary(*op, left, right).map(ElValue::Json),

            Node::Conditional(condition, then, otherwise) => {
                let test = coerce::to_bool(&self.json(condition)?)
                    .map_err(|cause| self.error(cause))?;
                if test {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn member(&self, target: &Node, key: &Value) -> Result<ElValue> {
        let base = self.eval(target)?;
        if base.is_null() {
            return Ok(ElValue::null());
        }
        self.el
            .get_value(&self.ctx, Some(&base), key)?
            .ok_or_else(|| {
                self.error(format!(
                    "Cannot resolve property {} on {}",
                    coerce::describe(key),
                    describe_base(&base)
                ))
            })
    }

    fn binary(&self, op: BinaryOp, left: &Node, right: &Node) -> Result<Value> {
        let to_bool = |value: Value| coerce::to_bool(&value).map_err(|cause| self.error(cause));

        match op {
            BinaryOp::And => {
                if !to_bool(self.json(left)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(to_bool(self.json(right)?)?))
            }
            BinaryOp::Or => {
                if to_bool(self.json(left)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(to_bool(self.json(right)?)?))
            }
            _ => {
                let l = self.json(left)?;
                let r = self.json(right)?;
                let result = match op {
                    BinaryOp::Eq => coerce::equals(&l, &r).map(Value::Bool),
                    BinaryOp::Ne => coerce::equals(&l, &r).map(|eq| Value::Bool(!eq)),
                    BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                        coerce::compare(op, &l, &r).map(Value::Bool)
                    }
                    _ => coerce::arithmetic(op, &l, &r),
                };
                result.map_err(|cause| self.error(cause))
            }
        }
    }

    fn assign(&self, node: &Node, value: &Value) -> Result<()> {
        match node {
            Node::Identifier(name) => {
                if self
                    .el
                    .set_value(&self.ctx, None, &Value::String(name.clone()), value)?
                {
                    Ok(())
                } else {
                    Err(PlatformError::Unsupported(format!(
                        "Cannot assign to '{}' in expression '{}'",
                        name, self.ctx.expression
                    )))
                }
            }
            Node::Property(target, name) => {
                self.assign_member(target, &Value::String(name.clone()), value)
            }
            Node::Index(target, index) => {
                let key = self.json(index)?;
                self.assign_member(target, &key, value)
            }
            _ => Err(PlatformError::Unsupported(format!(
                "Expression '{}' is not assignable",
                self.ctx.expression
            ))),
        }
    }

    /// Write into the parent value, then write a modified JSON parent back
    fn assign_member(&self, target: &Node, key: &Value, value: &Value) -> Result<()> {
        let mut parent = self.eval(target)?;
        if !self.el.set_value(&self.ctx, Some(&mut parent), key, value)? {
            return Err(PlatformError::Unsupported(format!(
                "Cannot assign property {} on {} in expression '{}'",
                coerce::describe(key),
                describe_base(&parent),
                self.ctx.expression
            )));
        }
        match parent {
            ElValue::Bean(_) => Ok(()),
            ElValue::Json(updated) => self.assign(target, &updated),
        }
    }
}

fn describe_base(base: &ElValue) -> String {
    match base {
        ElValue::Bean(bean) => bean.type_name().to_string(),
        ElValue::Json(value) => coerce::describe(value),
    }
}
