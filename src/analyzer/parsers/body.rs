//! Body grammar: free text interleaved with code fences, commands, variable
//! references, agent mentions and label comments.
//!
//! Parsing never stops at a malformed construct. The offending tokens become a
//! [`BodyNode::Error`] and a matching [`SyntaxError`], then parsing resumes at
//! the next boundary token.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;

use super::{identifier, punct, quoted_string, token, NotKind};
use crate::analyzer::{
    core::{ParseError, Parser},
    prelude::*,
};
use crate::ast::{BodyNode, SyntaxError};
use crate::tokenizer::{comment::split_label_comment, TokenKind, TokenSpan};

lazy_static! {
    static ref LINE_RANGE: Regex = Regex::new(r"^L(\d+)(?:-L(\d+))?$").unwrap();
}

/// Parses body tokens into nodes, collecting recoverable errors.
#[tracing::instrument(level = "debug", skip(tokens))]
pub fn parse_body(tokens: &[TokenSpan]) -> (Vec<BodyNode>, Vec<SyntaxError>) {
    let parser = body_node();
    let mut nodes: Vec<BodyNode> = Vec::new();
    let mut errors = Vec::new();
    let mut pos = 0;

    while pos < tokens.len() {
        match parser.parse(tokens, pos) {
            Ok((next, node)) if next > pos => {
                push_node(&mut nodes, node);
                pos = next;
            }
            Ok(_) => {
                // A parser that consumes nothing would loop forever.
                push_node(&mut nodes, BodyNode::Text {
                    text: tokens[pos].text.clone(),
                });
                pos += 1;
            }
            Err(err) => {
                let (node, error, next) = recover(tokens, pos, &err);
                tracing::debug!("recovered from {} at token {}", error, pos);
                push_node(&mut nodes, node);
                errors.push(error);
                pos = next;
            }
        }
    }
    (nodes, errors)
}

/// Appends a node, merging consecutive text.
fn push_node(nodes: &mut Vec<BodyNode>, node: BodyNode) {
    if let BodyNode::Text { text } = &node {
        if let Some(BodyNode::Text { text: last }) = nodes.last_mut() {
            last.push_str(text);
            return;
        }
    }
    nodes.push(node);
}

fn is_boundary(kind: TokenKind) -> bool {
    kind.is_sigil()
        || matches!(
            kind,
            TokenKind::CodeFenceStart | TokenKind::Newline | TokenKind::Text | TokenKind::Comment
        )
}

/// Builds an error node from the failing token up to the next boundary.
fn recover(tokens: &[TokenSpan], pos: usize, err: &ParseError) -> (BodyNode, SyntaxError, usize) {
    let first = &tokens[pos];
    let mut end = pos + 1;
    while end < tokens.len() && !is_boundary(tokens[end].kind) {
        end += 1;
    }
    let text: String = tokens[pos..end].iter().map(|t| t.text.as_str()).collect();

    let message = match first.kind {
        TokenKind::CodeFenceStart => "unterminated code fence".to_string(),
        TokenKind::CommandSigil => "malformed command".to_string(),
        TokenKind::VariableSigil => "malformed variable reference".to_string(),
        TokenKind::AgentSigil => "malformed agent mention".to_string(),
        _ => err.description(),
    };

    let error = SyntaxError {
        offset: first.start,
        line: first.line,
        column: first.column,
        description: message.clone(),
    };
    (BodyNode::Error { text, message }, error, end)
}

fn body_node() -> impl Parser<TokenSpan, BodyNode> {
    choice(vec![
        Box::new(code_block()),
        Box::new(command()),
        Box::new(variable_ref()),
        Box::new(agent_mention()),
        Box::new(label_comment()),
        Box::new(text()),
    ])
}

fn code_block() -> impl Parser<TokenSpan, BodyNode> {
    with_context(
        map(
            tuple4(
                punct(TokenKind::CodeFenceStart),
                optional(token(TokenKind::LanguageId)),
                optional(token(TokenKind::CodeContent)),
                punct(TokenKind::CodeFenceEnd),
            ),
            |(_, language, content, _)| BodyNode::CodeBlock {
                language_id: language.map(|t| t.text),
                content: content.map(|t| t.text).unwrap_or_default(),
            },
        ),
        "code block",
    )
}

/// `/name`, `/name:prop` or `/name:"quoted prop"`.
fn command() -> impl Parser<TokenSpan, BodyNode> {
    with_context(
        choice(vec![
            Box::new(map(
                tuple3(
                    preceded(punct(TokenKind::CommandSigil), identifier()),
                    punct(TokenKind::Colon),
                    token(TokenKind::CommandProp),
                ),
                |(name, _, prop)| command_node(name, &prop.text),
            )),
            Box::new(map(
                tuple3(
                    preceded(punct(TokenKind::CommandSigil), identifier()),
                    punct(TokenKind::Colon),
                    quoted_string(),
                ),
                |(name, _, argument)| BodyNode::Command {
                    name,
                    properties: BTreeMap::new(),
                    argument: Some(argument),
                },
            )),
            Box::new(map(
                terminated(
                    preceded(punct(TokenKind::CommandSigil), identifier()),
                    NotKind(TokenKind::Colon),
                ),
                |name| BodyNode::Command {
                    name,
                    properties: BTreeMap::new(),
                    argument: None,
                },
            )),
        ]),
        "command",
    )
}

/// Splits `path#L1-L3` or `path#anchor` into the argument and its properties.
fn command_node(name: String, prop: &str) -> BodyNode {
    let mut properties = BTreeMap::new();
    let argument = match prop.rsplit_once('#') {
        Some((argument, fragment)) => {
            match LINE_RANGE.captures(fragment) {
                Some(caps) => {
                    properties.insert("startLine".to_string(), caps[1].to_string());
                    if let Some(end) = caps.get(2) {
                        properties.insert("endLine".to_string(), end.as_str().to_string());
                    }
                }
                None => {
                    properties.insert("fragment".to_string(), fragment.to_string());
                }
            }
            argument
        }
        None => prop,
    };
    BodyNode::Command {
        name,
        properties,
        argument: Some(argument.to_string()),
    }
}

/// `$name` or `${name}`.
fn variable_ref() -> impl Parser<TokenSpan, BodyNode> {
    with_context(
        map(
            preceded(
                punct(TokenKind::VariableSigil),
                choice(vec![
                    Box::new(delimited(
                        punct(TokenKind::OpenBrace),
                        identifier(),
                        punct(TokenKind::CloseBrace),
                    )),
                    Box::new(identifier()),
                ]),
            ),
            |name| BodyNode::VariableRef { name },
        ),
        "variable reference",
    )
}

fn agent_mention() -> impl Parser<TokenSpan, BodyNode> {
    with_context(
        map(
            preceded(
                punct(TokenKind::AgentSigil),
                choice(vec![Box::new(identifier()), Box::new(quoted_string())]),
            ),
            |name| BodyNode::AgentMention { name },
        ),
        "agent mention",
    )
}

fn label_comment() -> impl Parser<TokenSpan, BodyNode> {
    satisfy(
        |t: &TokenSpan| {
            if t.kind != TokenKind::Comment {
                return None;
            }
            Some(match split_label_comment(&t.text) {
                Some((label, text)) => BodyNode::Comment {
                    label: label.to_string(),
                    text: text.to_string(),
                },
                None => BodyNode::Text {
                    text: t.text.clone(),
                },
            })
        },
        "comment",
    )
}

/// Any token that does not start a construct.
fn text() -> impl Parser<TokenSpan, BodyNode> {
    satisfy(
        |t: &TokenSpan| {
            let starter = t.kind.is_sigil()
                || matches!(t.kind, TokenKind::CodeFenceStart | TokenKind::Comment);
            if starter {
                None
            } else {
                Some(BodyNode::Text {
                    text: t.text.clone(),
                })
            }
        },
        "text",
    )
}
