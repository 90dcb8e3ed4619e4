/// Compiled form of an expression
///
/// An expression is a sequence of literal text and `${...}` / `#{...}` blocks.
/// Blocks compile to a small tree evaluated against a resolver chain.

use serde_json::Value;

/// Prefix operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Empty,
}

/// Infix operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Operator as written in source
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Expression tree node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Value),
    Identifier(String),
    Property(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    MethodCall {
        target: Box<Node>,
        method: String,
        args: Vec<Node>,
    },
    Function {
        namespace: Option<String>,
        name: String,
        args: Vec<Node>,
    },
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Conditional(Box<Node>, Box<Node>, Box<Node>),
}

impl Node {
    /// Nodes that can appear on the left side of an assignment
    pub fn is_lvalue(&self) -> bool {
        matches!(
            self,
            Node::Identifier(_) | Node::Property(..) | Node::Index(..)
        )
    }
}

/// Literal text or `${..}` segment of a template
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Eval(Node),
}

/// Compiled expression, immutable and shareable
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    text: String,
    parts: Vec<Part>,
}

impl Expression {
    pub(crate) fn new(text: String, parts: Vec<Part>) -> Self {
        Self { text, parts }
    }

    /// Source text the expression was compiled from
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Template segments in source order
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// No dynamic parts; evaluates to its own text
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|part| matches!(part, Part::Text(_)))
    }

    /// The single block of a `${...}` expression without surrounding text
    pub fn single_node(&self) -> Option<&Node> {
        match self.parts.as_slice() {
            [Part::Eval(node)] => Some(node),
            _ => None,
        }
    }

    /// Template text with evaluated parts left out
    pub fn literal_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                Part::Eval(_) => None,
            })
            .collect()
    }
}
