//! # Front-matter Parser
//!
//! The header is a restricted, indentation based key/value grammar:
//!
//! ```text
//! name: "Summarize"
//! interaction: AppendCursor
//! variables:
//!   "code"!: /src\/.*\.rs/ { read | head(40) }
//!   "title": "Release notes"
//! agents:
//!   - reviewer
//! onStreamingEnd: { parseCode | saveFile("out.md") }
//! ```
//!
//! Each logical line is parsed with the combinators into a [`HeaderItem`];
//! lines are then folded into a tree by indentation and the top level is
//! mapped onto [`FrontMatterBlock`] fields. Any error here is fatal for the
//! whole document.

use std::collections::BTreeMap;

use super::{boolean, identifier, key, number, pipeline::parse_pipeline, punct, quoted_string, token};
use crate::analyzer::{core::Parser, prelude::*};
use crate::ast::{
    AgentDeclaration, FrontMatterBlock, FrontMatterEntry, FrontMatterValue, FunctionCall,
    FunctionDeclaration, HookKind, InteractionMode, SourcePattern, SyntaxError,
    VariableDeclaration,
};
use crate::preprocessor::{HeaderLine, HeaderLineSplitter, Preprocessor};
use crate::tokenizer::{literal::pattern_body, TokenKind, TokenSpan};
use crate::variable::Condition;

/// A parsed header line before indentation is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderItem {
    Entry {
        key: String,
        required: bool,
        value: Option<FrontMatterValue>,
    },
    ListItem(FrontMatterValue),
}

/// A header line with the position of its first significant token.
#[derive(Debug, Clone)]
struct ParsedLine {
    indent: usize,
    item: HeaderItem,
    anchor: TokenSpan,
}

/// Parses the tokens between the two `---` delimiters.
#[tracing::instrument(level = "debug", skip(tokens))]
pub fn parse_front_matter(tokens: &[TokenSpan]) -> Result<FrontMatterBlock, SyntaxError> {
    let lines = HeaderLineSplitter.process(tokens);
    let parsed = lines
        .iter()
        .map(parse_line)
        .collect::<Result<Vec<_>, _>>()?;

    let mut cursor = 0;
    let entries = build_entries(&parsed, &mut cursor, None)?;
    if let Some(line) = parsed.get(cursor) {
        return Err(error_at(&line.anchor, "unexpected indentation"));
    }
    to_block(entries, &parsed)
}

fn error_at(token: &TokenSpan, description: impl Into<String>) -> SyntaxError {
    SyntaxError {
        offset: token.start,
        line: token.line,
        column: token.column,
        description: description.into(),
    }
}

/// `key[!]:` at the start of a line.
fn parse_entry_head() -> impl Parser<TokenSpan, (String, bool)> {
    with_context(
        map(
            tuple3(
                key(),
                optional(punct(TokenKind::Bang)),
                punct(TokenKind::Colon),
            ),
            |(key, bang, _)| (key, bang.is_some()),
        ),
        "header entry",
    )
}

/// Any single-line value.
pub fn parse_value() -> impl Parser<TokenSpan, FrontMatterValue> {
    with_context(
        choice(vec![
            Box::new(map(
                tuple2(token(TokenKind::PatternExpr), optional(parse_pipeline())),
                |(pattern, pipeline)| FrontMatterValue::Source {
                    source: SourcePattern::Regex(pattern_body(&pattern.text)),
                    pipeline: pipeline.unwrap_or_default(),
                },
            )),
            Box::new(map(
                tuple2(quoted_string(), parse_pipeline()),
                |(literal, pipeline)| FrontMatterValue::Source {
                    source: SourcePattern::Literal(literal),
                    pipeline,
                },
            )),
            Box::new(parse_signature()),
            Box::new(map(parse_pipeline(), FrontMatterValue::Pipeline)),
            Box::new(map(
                delimited(
                    punct(TokenKind::OpenBracket),
                    optional(separated_list(parse_scalar(), punct(TokenKind::Comma))),
                    punct(TokenKind::CloseBracket),
                ),
                |items| FrontMatterValue::List(items.unwrap_or_default()),
            )),
            Box::new(parse_scalar()),
        ]),
        "value",
    )
}

/// `"file.py"(string, number): string`
fn parse_signature() -> impl Parser<TokenSpan, FrontMatterValue> {
    map(
        tuple3(
            quoted_string(),
            delimited(
                punct(TokenKind::OpenParen),
                optional(separated_list(identifier(), punct(TokenKind::Comma))),
                punct(TokenKind::CloseParen),
            ),
            optional(preceded(punct(TokenKind::Colon), identifier())),
        ),
        |(file, inputs, output)| FrontMatterValue::FunctionSignature {
            file,
            inputs: inputs.unwrap_or_default(),
            output,
        },
    )
}

fn parse_scalar() -> impl Parser<TokenSpan, FrontMatterValue> {
    choice(vec![
        Box::new(map(quoted_string(), FrontMatterValue::String)),
        Box::new(map(number(), |n| {
            FrontMatterValue::Number(n.as_f64().unwrap_or_default())
        })),
        Box::new(map(boolean(), FrontMatterValue::Boolean)),
        Box::new(map(key(), FrontMatterValue::Identifier)),
    ])
}

/// Parses a whole value, falling back to raw text when the tokens do not
/// form a single value (unquoted prose, brace expressions).
fn parse_full_value(line: &HeaderLine, tokens: &[TokenSpan]) -> FrontMatterValue {
    if let Ok((pos, value)) = parse_value().parse(tokens, 0) {
        if pos == tokens.len() {
            return value;
        }
    }
    raw_value(line, tokens)
}

fn raw_value(line: &HeaderLine, tokens: &[TokenSpan]) -> FrontMatterValue {
    let raw = tokens
        .first()
        .map(|first| line.text_from(first.start))
        .unwrap_or_default();
    match raw.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        Some(inner) => FrontMatterValue::Expression(inner.trim().to_string()),
        None => FrontMatterValue::String(raw),
    }
}

fn parse_line(line: &HeaderLine) -> Result<ParsedLine, SyntaxError> {
    let tokens = line.significant();
    let Some(anchor) = tokens.first().cloned() else {
        return Err(SyntaxError {
            offset: 0,
            line: 0,
            column: 0,
            description: "empty header line".to_string(),
        });
    };

    if anchor.kind == TokenKind::Dash {
        let rest = &tokens[1..];
        if rest.is_empty() {
            return Err(error_at(&anchor, "empty list item"));
        }
        return Ok(ParsedLine {
            indent: line.indent,
            item: HeaderItem::ListItem(parse_full_value(line, rest)),
            anchor,
        });
    }

    let (pos, (key, required)) = parse_entry_head()
        .parse(&tokens, 0)
        .map_err(|e| error_at(tokens.get(e.get_position()).unwrap_or(&anchor), e.description()))?;
    let rest = &tokens[pos..];

    let value = if rest.is_empty() {
        None
    } else if key == "when" {
        Some(raw_value(line, rest))
    } else {
        Some(parse_full_value(line, rest))
    };

    Ok(ParsedLine {
        indent: line.indent,
        item: HeaderItem::Entry {
            key,
            required,
            value,
        },
        anchor,
    })
}

/// Folds lines deeper than `parent_indent` into entries. A key without an
/// inline value takes the following deeper lines as its children; list items
/// may also sit at the parent's own indentation.
fn build_entries(
    lines: &[ParsedLine],
    cursor: &mut usize,
    parent_indent: Option<usize>,
) -> Result<Vec<(FrontMatterEntry, usize)>, SyntaxError> {
    let mut entries = Vec::new();
    let mut level: Option<usize> = None;

    while let Some(line) = lines.get(*cursor) {
        if let Some(parent) = parent_indent {
            if line.indent <= parent {
                break;
            }
        }
        match level {
            None => level = Some(line.indent),
            Some(l) if line.indent < l => break,
            Some(l) if line.indent > l => {
                return Err(error_at(&line.anchor, "unexpected indentation"))
            }
            _ => {}
        }

        let HeaderItem::Entry {
            key,
            required,
            value,
        } = &line.item
        else {
            return Err(error_at(&line.anchor, "list item outside of a list"));
        };
        let line_index = *cursor;
        *cursor += 1;

        let value = match value {
            Some(value) => value.clone(),
            None => build_children(lines, cursor, line.indent)?,
        };
        entries.push((
            FrontMatterEntry {
                key: key.clone(),
                required: *required,
                value,
            },
            line_index,
        ));
    }
    Ok(entries)
}

fn build_children(
    lines: &[ParsedLine],
    cursor: &mut usize,
    indent: usize,
) -> Result<FrontMatterValue, SyntaxError> {
    let Some(next) = lines.get(*cursor) else {
        return Ok(FrontMatterValue::Object(Vec::new()));
    };

    if matches!(next.item, HeaderItem::ListItem(_)) && next.indent >= indent {
        let level = next.indent;
        let mut items = Vec::new();
        while let Some(line) = lines.get(*cursor) {
            match &line.item {
                HeaderItem::ListItem(value) if line.indent == level => {
                    items.push(value.clone());
                    *cursor += 1;
                }
                _ => break,
            }
        }
        return Ok(FrontMatterValue::List(items));
    }

    if next.indent <= indent {
        return Ok(FrontMatterValue::Object(Vec::new()));
    }
    let children = build_entries(lines, cursor, Some(indent))?;
    Ok(FrontMatterValue::Object(
        children.into_iter().map(|(entry, _)| entry).collect(),
    ))
}

fn to_block(
    entries: Vec<(FrontMatterEntry, usize)>,
    lines: &[ParsedLine],
) -> Result<FrontMatterBlock, SyntaxError> {
    let mut block = FrontMatterBlock::default();
    let mut hooks = BTreeMap::new();

    for (entry, line_index) in entries {
        let anchor = &lines[line_index].anchor;
        let FrontMatterEntry { key, value, .. } = entry.clone();
        match key.as_str() {
            "name" => block.name = Some(expect_text(&value, anchor, "name")?),
            "description" => block.description = Some(expect_text(&value, anchor, "description")?),
            "model" => block.model = Some(expect_text(&value, anchor, "model")?),
            "interaction" => {
                let text = expect_text(&value, anchor, "interaction")?;
                block.interaction_mode = text.parse::<InteractionMode>().map_err(|_| {
                    error_at(anchor, format!("unknown interaction mode `{}`", text))
                })?;
            }
            "enabled" => match value {
                FrontMatterValue::Boolean(enabled) => block.enabled = enabled,
                _ => return Err(error_at(anchor, "`enabled` must be true or false")),
            },
            "when" => {
                let condition = expect_text(&value, anchor, "when")?;
                Condition::parse(&condition).map_err(|e| error_at(anchor, e.to_string()))?;
                block.when = Some(condition);
            }
            "variables" => block.variables = to_variables(value, anchor)?,
            "functions" => block.functions = to_functions(value, anchor)?,
            "agents" => block.agents = to_agents(value, anchor)?,
            other => match other.parse::<HookKind>() {
                Ok(kind) => {
                    hooks.insert(kind, to_hook(kind, value, anchor)?);
                }
                Err(_) => block.user_data.push(entry),
            },
        }
    }

    block.lifecycle_hooks = hooks;
    Ok(block)
}

fn expect_text(value: &FrontMatterValue, anchor: &TokenSpan, field: &str) -> Result<String, SyntaxError> {
    value
        .as_text()
        .ok_or_else(|| error_at(anchor, format!("`{}` must be a single value", field)))
}

fn object_entries(
    value: FrontMatterValue,
    anchor: &TokenSpan,
    field: &str,
) -> Result<Vec<FrontMatterEntry>, SyntaxError> {
    match value {
        FrontMatterValue::Object(entries) => Ok(entries),
        _ => Err(error_at(anchor, format!("`{}` must be a nested block", field))),
    }
}

fn to_variables(value: FrontMatterValue, anchor: &TokenSpan) -> Result<Vec<VariableDeclaration>, SyntaxError> {
    object_entries(value, anchor, "variables")?
        .into_iter()
        .map(|entry| {
            let (source, pipeline) = match entry.value {
                FrontMatterValue::Source { source, pipeline } => (source, pipeline),
                FrontMatterValue::Pipeline(pipeline) => (SourcePattern::None, pipeline),
                FrontMatterValue::String(text) | FrontMatterValue::Identifier(text) => {
                    (SourcePattern::Literal(text), Vec::new())
                }
                FrontMatterValue::Number(n) => (SourcePattern::Literal(n.to_string()), Vec::new()),
                FrontMatterValue::Boolean(b) => (SourcePattern::Literal(b.to_string()), Vec::new()),
                _ => {
                    return Err(error_at(
                        anchor,
                        format!("invalid declaration for variable `{}`", entry.key),
                    ))
                }
            };
            Ok(VariableDeclaration {
                name: entry.key,
                source,
                pipeline,
                required: entry.required,
            })
        })
        .collect()
}

fn to_functions(value: FrontMatterValue, anchor: &TokenSpan) -> Result<Vec<FunctionDeclaration>, SyntaxError> {
    object_entries(value, anchor, "functions")?
        .into_iter()
        .map(|entry| match entry.value {
            FrontMatterValue::FunctionSignature {
                file,
                inputs,
                output,
            } => Ok(FunctionDeclaration {
                name: entry.key,
                file,
                inputs,
                output,
            }),
            FrontMatterValue::String(file) => Ok(FunctionDeclaration {
                name: entry.key,
                file,
                inputs: Vec::new(),
                output: None,
            }),
            _ => Err(error_at(
                anchor,
                format!("invalid declaration for function `{}`", entry.key),
            )),
        })
        .collect()
}

fn to_agents(value: FrontMatterValue, anchor: &TokenSpan) -> Result<Vec<AgentDeclaration>, SyntaxError> {
    match value {
        FrontMatterValue::List(items) => items
            .into_iter()
            .map(|item| {
                item.as_text()
                    .map(|name| AgentDeclaration {
                        name,
                        description: None,
                    })
                    .ok_or_else(|| error_at(anchor, "agent names must be plain values"))
            })
            .collect(),
        FrontMatterValue::Object(entries) => entries
            .into_iter()
            .map(|entry| {
                let description = entry
                    .value
                    .as_text()
                    .ok_or_else(|| error_at(anchor, "agent descriptions must be plain values"))?;
                Ok(AgentDeclaration {
                    name: entry.key,
                    description: Some(description),
                })
            })
            .collect(),
        _ => Err(error_at(anchor, "`agents` must be a list")),
    }
}

fn to_hook(kind: HookKind, value: FrontMatterValue, anchor: &TokenSpan) -> Result<Vec<FunctionCall>, SyntaxError> {
    match value {
        FrontMatterValue::Pipeline(pipeline) => Ok(pipeline),
        FrontMatterValue::String(path) if kind == HookKind::AfterStreaming => Ok(vec![
            FunctionCall::new("execute", vec![serde_json::Value::String(path)]),
        ]),
        _ => Err(error_at(
            anchor,
            format!("`{}` must be a pipeline such as {{ fn1 | fn2 }}", kind),
        )),
    }
}
