/// Expression language and scripting
///
/// `${...}` expressions are compiled once and evaluated against a variable
/// scope through an ordered resolver chain. Lua scripts run in a fresh
/// sandbox per call.

pub mod ast;
pub mod coerce;
pub mod functions;
pub mod manager;
pub mod parser;
pub mod resolver;
pub mod scope;
pub mod script;

pub use ast::Expression;
pub use functions::{ElFunction, FunctionTable};
pub use manager::ExpressionManager;
pub use parser::parse_expression;
pub use resolver::{ElContext, ElResolver, InvocationContext, ResolveContext};
pub use scope::{Bean, ElContextCache, ElValue, ScopeKind, SimpleVariableScope, VariableScope};
pub use script::ScriptEvaluator;
