//! # Conditions
//!
//! The front-matter `when` guard, evaluated against resolved variables:
//!
//! ```text
//! when: { $fileName.endsWith(".rs") && ($mode == "review" || !$draft) }
//! ```
//!
//! Operands are `$name` references, quoted strings, numbers and booleans.
//! String methods `contains`, `startsWith`, `endsWith` and `matches` take one
//! argument. `==` and `!=` compare rendered text. `!` binds tighter than
//! `&&`, which binds tighter than `||`.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, multispace0},
    combinator::{all_consuming, map, map_res, opt, recognize, value},
    error::{context, VerboseError},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded},
    IResult,
};
use regex::Regex;
use thiserror::Error;

use super::{Value, VariableTable};
use crate::tokenizer::{
    keyword::parse_variable_name,
    literal::{parse_number, parse_quoted_string, unquote},
};

type ConditionResult<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("invalid condition `{input}` at offset {offset}")]
    Syntax { input: String, offset: usize },
    #[error("condition refers to unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("`{method}` takes one argument, got {count}")]
    Arity { method: ConditionMethod, count: usize },
    #[error("invalid pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum ConditionMethod {
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(Value),
    Variable(String),
    Method {
        target: Box<Condition>,
        method: ConditionMethod,
        args: Vec<Condition>,
    },
    Equals(Box<Condition>, Box<Condition>),
    NotEquals(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        match all_consuming(ws(parse_or))(input) {
            Ok((_, condition)) => Ok(condition),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ConditionError::Syntax {
                input: input.to_string(),
                offset: e
                    .errors
                    .first()
                    .map(|(rest, _)| input.len() - rest.len())
                    .unwrap_or_default(),
            }),
            Err(nom::Err::Incomplete(_)) => Err(ConditionError::Syntax {
                input: input.to_string(),
                offset: input.len(),
            }),
        }
    }

    pub fn evaluate(&self, table: &VariableTable) -> Result<bool, ConditionError> {
        Ok(truthy(&self.value(table)?))
    }

    fn value(&self, table: &VariableTable) -> Result<Value, ConditionError> {
        let value = match self {
            Condition::Literal(value) => value.clone(),
            Condition::Variable(name) => table
                .value(name)
                .cloned()
                .ok_or_else(|| ConditionError::UnknownVariable(name.clone()))?,
            Condition::Method { target, method, args } => {
                let [arg] = args.as_slice() else {
                    return Err(ConditionError::Arity {
                        method: *method,
                        count: args.len(),
                    });
                };
                let text = target.value(table)?.to_string();
                let arg = arg.value(table)?.to_string();
                Value::Boolean(match method {
                    ConditionMethod::Contains => text.contains(&arg),
                    ConditionMethod::StartsWith => text.starts_with(&arg),
                    ConditionMethod::EndsWith => text.ends_with(&arg),
                    ConditionMethod::Matches => Regex::new(&arg)
                        .map_err(|e| ConditionError::InvalidPattern {
                            pattern: arg.clone(),
                            message: e.to_string(),
                        })?
                        .is_match(&text),
                })
            }
            Condition::Equals(left, right) => {
                Value::Boolean(left.value(table)?.to_string() == right.value(table)?.to_string())
            }
            Condition::NotEquals(left, right) => {
                Value::Boolean(left.value(table)?.to_string() != right.value(table)?.to_string())
            }
            Condition::Not(inner) => Value::Boolean(!inner.evaluate(table)?),
            Condition::And(left, right) => Value::Boolean(left.evaluate(table)? && right.evaluate(table)?),
            Condition::Or(left, right) => Value::Boolean(left.evaluate(table)? || right.evaluate(table)?),
        };
        Ok(value)
    }
}

/// Parses and evaluates `condition` in one go.
pub fn evaluate(condition: &str, table: &VariableTable) -> Result<bool, ConditionError> {
    Condition::parse(condition)?.evaluate(table)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Boolean(b) => *b,
        Value::Integer(i) => *i != 0,
        Value::Float(x) => *x != 0.0,
        Value::String(s) => !s.is_empty() && s != "false",
        Value::List(items) => !items.is_empty(),
    }
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> ConditionResult<'a, O>
where
    F: FnMut(&'a str) -> ConditionResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

#[tracing::instrument(level = "debug", skip(input))]
fn parse_or(input: &str) -> ConditionResult<Condition> {
    let (input, first) = parse_and(input)?;
    let (input, rest) = many0(preceded(ws(tag("||")), parse_and))(input)?;
    let condition = rest
        .into_iter()
        .fold(first, |left, right| Condition::Or(Box::new(left), Box::new(right)));
    Ok((input, condition))
}

fn parse_and(input: &str) -> ConditionResult<Condition> {
    let (input, first) = parse_unary(input)?;
    let (input, rest) = many0(preceded(ws(tag("&&")), parse_unary))(input)?;
    let condition = rest
        .into_iter()
        .fold(first, |left, right| Condition::And(Box::new(left), Box::new(right)));
    Ok((input, condition))
}

fn parse_unary(input: &str) -> ConditionResult<Condition> {
    alt((
        map(preceded(ws(char('!')), parse_unary), |inner| {
            Condition::Not(Box::new(inner))
        }),
        parse_comparison,
    ))(input)
}

fn parse_comparison(input: &str) -> ConditionResult<Condition> {
    let (input, left) = parse_operand(input)?;
    let (input, operator) = opt(ws(alt((tag("=="), tag("!=")))))(input)?;
    let Some(operator) = operator else {
        return Ok((input, left));
    };
    let (input, right) = parse_operand(input)?;
    let condition = match operator {
        "==" => Condition::Equals(Box::new(left), Box::new(right)),
        _ => Condition::NotEquals(Box::new(left), Box::new(right)),
    };
    Ok((input, condition))
}

/// A primary or parenthesized condition followed by any method calls.
fn parse_operand(input: &str) -> ConditionResult<Condition> {
    let (mut input, mut target) = ws(alt((
        delimited(char('('), parse_or, ws(char(')'))),
        parse_primary,
    )))(input)?;
    while let Ok((rest, (method, args))) = parse_method_call(input) {
        target = Condition::Method {
            target: Box::new(target),
            method,
            args,
        };
        input = rest;
    }
    Ok((input, target))
}

fn parse_method_call(input: &str) -> ConditionResult<(ConditionMethod, Vec<Condition>)> {
    context(
        "method call",
        preceded(
            char('.'),
            pair(
                map_res(parse_variable_name, str::parse::<ConditionMethod>),
                delimited(
                    ws(char('(')),
                    separated_list0(ws(char(',')), parse_or),
                    ws(char(')')),
                ),
            ),
        ),
    )(input)
}

fn parse_primary(input: &str) -> ConditionResult<Condition> {
    context(
        "operand",
        alt((
            map(preceded(char('$'), parse_variable_name), |name| {
                Condition::Variable(name.to_string())
            }),
            map(recognize(parse_quoted_string), |text| {
                Condition::Literal(Value::String(unquote(text)))
            }),
            map(recognize(parse_number), |text: &str| {
                Condition::Literal(match text.parse::<i64>() {
                    Ok(i) => Value::Integer(i),
                    Err(_) => Value::Float(text.parse().unwrap_or_default()),
                })
            }),
            value(Condition::Literal(Value::Boolean(true)), tag("true")),
            value(Condition::Literal(Value::Boolean(false)), tag("false")),
        )),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::VariableScope;
    use pretty_assertions::assert_eq;

    fn table() -> VariableTable {
        let mut table = VariableTable::new();
        table.insert("fileName", Value::text("main.rs"), VariableScope::System);
        table.insert("mode", Value::text("review"), VariableScope::UserDefined);
        table.insert("draft", Value::Boolean(false), VariableScope::UserDefined);
        table.insert("count", Value::Integer(3), VariableScope::UserDefined);
        table
    }

    #[test]
    fn test_methods_and_operators() {
        let table = table();
        for (condition, expected) in [
            (r#"$fileName.contains(".rs")"#, true),
            (r#"$fileName.startsWith("lib")"#, false),
            (r#"$fileName.endsWith(".rs")"#, true),
            (r#"$fileName.matches("^ma.*\\.rs$")"#, true),
            (r#"$mode == "review""#, true),
            (r#"$mode != "review""#, false),
            (r#"$count == 3"#, true),
            (r#"!$draft"#, true),
            (r#"$draft || $mode == "edit""#, false),
            (r#"$fileName.endsWith(".rs") && ($mode == "review" || !$draft)"#, true),
            (r#"$fileName.endsWith(".py") && $mode == "review" || $count == 3"#, true),
            (r#"$fileName.endsWith(".py") && ($mode == "review" || $count == 3)"#, false),
        ] {
            assert_eq!(evaluate(condition, &table), Ok(expected), "{}", condition);
        }
    }

    #[test]
    fn test_parse_tree() {
        assert_eq!(
            Condition::parse(r#"!$a.contains("x") && true"#),
            Ok(Condition::And(
                Box::new(Condition::Not(Box::new(Condition::Method {
                    target: Box::new(Condition::Variable("a".to_string())),
                    method: ConditionMethod::Contains,
                    args: vec![Condition::Literal(Value::text("x"))],
                }))),
                Box::new(Condition::Literal(Value::Boolean(true))),
            ))
        );
    }

    #[test]
    fn test_errors() {
        let table = table();
        assert!(matches!(
            Condition::parse("$a.contains("),
            Err(ConditionError::Syntax { .. })
        ));
        assert!(matches!(
            Condition::parse("$a.length()"),
            Err(ConditionError::Syntax { .. })
        ));
        assert!(matches!(Condition::parse("$a $b"), Err(ConditionError::Syntax { .. })));
        assert_eq!(
            evaluate("$missing == 1", &table),
            Err(ConditionError::UnknownVariable("missing".to_string()))
        );
        assert!(matches!(
            evaluate(r#"$mode.contains("a", "b")"#, &table),
            Err(ConditionError::Arity { count: 2, .. })
        ));
        assert!(matches!(
            evaluate(r#"$mode.matches("(")"#, &table),
            Err(ConditionError::InvalidPattern { .. })
        ));
    }
}
