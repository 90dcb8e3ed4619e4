/// Expression parser built on nom combinators
///
/// Splits composite text into literal parts and `${...}` / `#{...}` blocks and
/// parses each block with the usual EL precedence:
/// ternary < or < and < equality < relational < additive < multiplicative < unary < postfix.

use crate::error::ExpressionError;
use crate::expression::ast::{BinaryOp, Expression, Node, Part, UnaryOp};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace0, one_of, satisfy},
    combinator::{map, not, opt, recognize, value},
    error::{Error as NomError, ErrorKind},
    multi::{fold_many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde_json::{Number, Value};

type Res<'a, T> = IResult<&'a str, T>;

const RESERVED: &[&str] = &[
    "true", "false", "null", "and", "or", "not", "eq", "ne", "lt", "gt", "le", "ge", "div",
    "mod", "empty", "instanceof",
];

/// Compile expression text into its parts
pub fn parse_expression(text: &str) -> Result<Expression, ExpressionError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(start) = find_block_start(rest) {
        literal.push_str(&rest[..start]);
        let (remaining, node) =
            block_body(&rest[start + 2..]).map_err(|err| syntax_error(text, err))?;
        if !literal.is_empty() {
            parts.push(Part::Text(std::mem::take(&mut literal)));
        }
        parts.push(Part::Eval(node));
        rest = remaining;
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(Part::Text(literal));
    }

    Ok(Expression::new(text.to_string(), parts))
}

fn find_block_start(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    s.match_indices('{')
        .find(|(i, _)| *i > 0 && matches!(bytes[i - 1], b'$' | b'#'))
        .map(|(i, _)| i - 1)
}

fn syntax_error(text: &str, err: nom::Err<NomError<&str>>) -> ExpressionError {
    let cause = match err {
        nom::Err::Error(e) | nom::Err::Failure(e) if e.input.trim().is_empty() => {
            "unexpected end of expression".to_string()
        }
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let snippet: String = e.input.chars().take(24).collect();
            format!("unexpected input at '{}'", snippet)
        }
        nom::Err::Incomplete(_) => "incomplete expression".to_string(),
    };
    ExpressionError::Syntax {
        expression: text.to_string(),
        cause,
    }
}

fn block_body(input: &str) -> Res<'_, Node> {
    terminated(conditional, preceded(multispace0, char('}')))(input)
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> Res<'a, O>
where
    F: FnMut(&'a str) -> Res<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    terminated(tag(kw), not(satisfy(is_ident_char)))
}

fn raw_identifier(input: &str) -> Res<'_, String> {
    map(
        recognize(pair(satisfy(is_ident_start), take_while(is_ident_char))),
        |s: &str| s.to_string(),
    )(input)
}

fn identifier(input: &str) -> Res<'_, String> {
    let (rest, name) = raw_identifier(input)?;
    if RESERVED.contains(&name.as_str()) {
        return Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag)));
    }
    Ok((rest, name))
}

fn conditional(input: &str) -> Res<'_, Node> {
    let (input, condition) = or_expr(input)?;
    let (input, branches) = opt(pair(
        preceded(ws(char('?')), conditional),
        preceded(ws(char(':')), conditional),
    ))(input)?;

    let node = match branches {
        Some((then, otherwise)) => {
            Node::Conditional(Box::new(condition), Box::new(then), Box::new(otherwise))
        }
        None => condition,
    };
    Ok((input, node))
}

fn binary_level<'a>(
    input: &'a str,
    operand: fn(&'a str) -> Res<'a, Node>,
    operator: fn(&'a str) -> Res<'a, BinaryOp>,
) -> Res<'a, Node> {
    let (input, first) = operand(input)?;
    fold_many0(
        pair(operator, operand),
        move || first.clone(),
        |acc, (op, rhs)| Node::Binary(op, Box::new(acc), Box::new(rhs)),
    )(input)
}

fn or_expr(input: &str) -> Res<'_, Node> {
    binary_level(input, and_expr, or_op)
}

fn and_expr(input: &str) -> Res<'_, Node> {
    binary_level(input, equality, and_op)
}

fn equality(input: &str) -> Res<'_, Node> {
    binary_level(input, relational, equality_op)
}

fn relational(input: &str) -> Res<'_, Node> {
    binary_level(input, additive, relational_op)
}

fn additive(input: &str) -> Res<'_, Node> {
    binary_level(input, multiplicative, additive_op)
}

fn multiplicative(input: &str) -> Res<'_, Node> {
    binary_level(input, unary, multiplicative_op)
}

fn or_op(input: &str) -> Res<'_, BinaryOp> {
    value(BinaryOp::Or, ws(alt((tag("||"), keyword("or")))))(input)
}

fn and_op(input: &str) -> Res<'_, BinaryOp> {
    value(BinaryOp::And, ws(alt((tag("&&"), keyword("and")))))(input)
}

fn equality_op(input: &str) -> Res<'_, BinaryOp> {
    ws(alt((
        value(BinaryOp::Eq, alt((tag("=="), keyword("eq")))),
        value(BinaryOp::Ne, alt((tag("!="), keyword("ne")))),
    )))(input)
}

fn relational_op(input: &str) -> Res<'_, BinaryOp> {
    ws(alt((
        value(BinaryOp::Le, alt((tag("<="), keyword("le")))),
        value(BinaryOp::Ge, alt((tag(">="), keyword("ge")))),
        value(BinaryOp::Lt, alt((tag("<"), keyword("lt")))),
        value(BinaryOp::Gt, alt((tag(">"), keyword("gt")))),
    )))(input)
}

fn additive_op(input: &str) -> Res<'_, BinaryOp> {
    ws(alt((
        value(BinaryOp::Add, char('+')),
        value(BinaryOp::Sub, char('-')),
    )))(input)
}

fn multiplicative_op(input: &str) -> Res<'_, BinaryOp> {
    ws(alt((
        value(BinaryOp::Mul, char('*')),
        value(BinaryOp::Div, alt((tag("/"), keyword("div")))),
        value(BinaryOp::Mod, alt((tag("%"), keyword("mod")))),
    )))(input)
}

fn unary(input: &str) -> Res<'_, Node> {
    let (input, _) = multispace0::<&str, NomError<&str>>(input)?;
    alt((
        map(preceded(alt((tag("!"), keyword("not"))), unary), |node| {
            Node::Unary(UnaryOp::Not, Box::new(node))
        }),
        map(preceded(char('-'), unary), |node| {
            Node::Unary(UnaryOp::Negate, Box::new(node))
        }),
        map(preceded(keyword("empty"), unary), |node| {
            Node::Unary(UnaryOp::Empty, Box::new(node))
        }),
        postfix,
    ))(input)
}

enum Suffix {
    Property(String),
    Call(String, Vec<Node>),
    Index(Node),
}

fn postfix(input: &str) -> Res<'_, Node> {
    let (input, base) = primary(input)?;
    fold_many0(
        suffix,
        move || base.clone(),
        |target, suffix| match suffix {
            Suffix::Property(name) => Node::Property(Box::new(target), name),
            Suffix::Call(method, args) => Node::MethodCall {
                target: Box::new(target),
                method,
                args,
            },
            Suffix::Index(index) => Node::Index(Box::new(target), Box::new(index)),
        },
    )(input)
}

fn suffix(input: &str) -> Res<'_, Suffix> {
    alt((
        map(
            pair(preceded(ws(char('.')), raw_identifier), opt(arguments)),
            |(name, args)| match args {
                Some(args) => Suffix::Call(name, args),
                None => Suffix::Property(name),
            },
        ),
        map(
            delimited(ws(char('[')), conditional, ws(char(']'))),
            Suffix::Index,
        ),
    ))(input)
}

fn arguments(input: &str) -> Res<'_, Vec<Node>> {
    delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), conditional),
        ws(char(')')),
    )(input)
}

fn primary(input: &str) -> Res<'_, Node> {
    let (input, _) = multispace0::<&str, NomError<&str>>(input)?;
    alt((
        literal,
        delimited(char('('), conditional, ws(char(')'))),
        function_call,
        map(identifier, Node::Identifier),
    ))(input)
}

fn function_call(input: &str) -> Res<'_, Node> {
    let (input, first) = identifier(input)?;
    let (input, second) = opt(preceded(char(':'), identifier))(input)?;
    let (input, args) = arguments(input)?;

    let (namespace, name) = match second {
        Some(name) => (Some(first), name),
        None => (None, first),
    };
    Ok((
        input,
        Node::Function {
            namespace,
            name,
            args,
        },
    ))
}

fn literal(input: &str) -> Res<'_, Node> {
    alt((
        value(Node::Literal(Value::Bool(true)), keyword("true")),
        value(Node::Literal(Value::Bool(false)), keyword("false")),
        value(Node::Literal(Value::Null), keyword("null")),
        map(number, Node::Literal),
        map(string_literal, |s| Node::Literal(Value::String(s))),
    ))(input)
}

fn number(input: &str) -> Res<'_, Value> {
    let (rest, text) = recognize(tuple((
        digit1,
        opt(pair(char('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;

    let float = || text.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number);
    let parsed = if text.contains(['.', 'e', 'E']) {
        float()
    } else {
        text.parse::<i64>().ok().map(Value::from).or_else(float)
    };

    match parsed {
        Some(value) => Ok((rest, value)),
        None => Err(nom::Err::Error(NomError::new(input, ErrorKind::Digit))),
    }
}

fn string_literal(input: &str) -> Res<'_, String> {
    alt((quoted('\''), quoted('"')))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> Res<'a, String> {
    move |input: &'a str| {
        let (mut rest, _) = char::<&str, NomError<&str>>(quote)(input)?;
        let mut out = String::new();
        loop {
            let mut chars = rest.chars();
            match chars.next() {
                None => return Err(nom::Err::Error(NomError::new(rest, ErrorKind::Char))),
                Some(c) if c == quote => return Ok((chars.as_str(), out)),
                Some('\\') => match chars.next() {
                    Some(escaped) => out.push(escaped),
                    None => return Err(nom::Err::Error(NomError::new(rest, ErrorKind::Char))),
                },
                Some(c) => out.push(c),
            }
            rest = chars.as_str();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single(text: &str) -> Node {
        parse_expression(text)
            .unwrap()
            .single_node()
            .cloned()
            .expect("single block")
    }

    #[test]
    fn test_literal_text_has_no_blocks() {
        let expr = parse_expression("just text").unwrap();
        assert!(expr.is_literal());
        assert_eq!(expr.literal_text(), "just text");
    }

    #[test]
    fn test_composite_text_keeps_order() {
        let expr = parse_expression("Hello ${name}, you owe #{amount}!").unwrap();
        assert_eq!(
            expr.parts(),
            &[
                Part::Text("Hello ".to_string()),
                Part::Eval(Node::Identifier("name".to_string())),
                Part::Text(", you owe ".to_string()),
                Part::Eval(Node::Identifier("amount".to_string())),
                Part::Text("!".to_string()),
            ]
        );
    }

    #[test]
    fn test_precedence_of_arithmetic_and_logic() {
        let node = single("${a + b * 2 > 10 && !done}");
        let expected = Node::Binary(
            BinaryOp::And,
            Box::new(Node::Binary(
                BinaryOp::Gt,
                Box::new(Node::Binary(
                    BinaryOp::Add,
                    Box::new(Node::Identifier("a".into())),
                    Box::new(Node::Binary(
                        BinaryOp::Mul,
                        Box::new(Node::Identifier("b".into())),
                        Box::new(Node::Literal(json!(2))),
                    )),
                )),
                Box::new(Node::Literal(json!(10))),
            )),
            Box::new(Node::Unary(
                UnaryOp::Not,
                Box::new(Node::Identifier("done".into())),
            )),
        );
        assert_eq!(node, expected);
    }

    #[test]
    fn test_word_operators_and_keywords() {
        let node = single("${order.total ge 100 and not empty order.items}");
        assert!(matches!(node, Node::Binary(BinaryOp::And, _, _)));

        let node = single("${android}");
        assert_eq!(node, Node::Identifier("android".into()));
    }

    #[test]
    fn test_postfix_chain_and_calls() {
        let node = single("${execution.getVariable('x')[0].name}");
        let expected = Node::Property(
            Box::new(Node::Index(
                Box::new(Node::MethodCall {
                    target: Box::new(Node::Identifier("execution".into())),
                    method: "getVariable".into(),
                    args: vec![Node::Literal(json!("x"))],
                }),
                Box::new(Node::Literal(json!(0))),
            )),
            "name".into(),
        );
        assert_eq!(node, expected);
    }

    #[test]
    fn test_function_with_namespace_and_ternary() {
        let node = single("${fn:len(items) > 0 ? 'some' : \"none\"}");
        match node {
            Node::Conditional(cond, then, otherwise) => {
                assert!(matches!(*cond, Node::Binary(BinaryOp::Gt, _, _)));
                assert_eq!(*then, Node::Literal(json!("some")));
                assert_eq!(*otherwise, Node::Literal(json!("none")));
            }
            other => panic!("unexpected node {:?}", other),
        }

        let node = single("${now()}");
        assert_eq!(
            node,
            Node::Function {
                namespace: None,
                name: "now".into(),
                args: vec![]
            }
        );
    }

    #[test]
    fn test_numbers_and_escaped_strings() {
        assert_eq!(single("${1.5e2}"), Node::Literal(json!(150.0)));
        assert_eq!(single("${42}"), Node::Literal(json!(42)));
        assert_eq!(single(r"${'it\'s'}"), Node::Literal(json!("it's")));
    }

    #[test]
    fn test_syntax_errors_carry_expression_text() {
        let err = parse_expression("${a +}").unwrap_err();
        match err {
            ExpressionError::Syntax { expression, .. } => assert_eq!(expression, "${a +}"),
            other => panic!("unexpected error {:?}", other),
        }

        assert!(parse_expression("${unclosed").is_err());
    }
}
