//! Token-level parsers for the header and body grammars.
//!
//! The helpers here match single tokens; [`pipeline`], [`front_matter`] and
//! [`body`] compose them into the document grammar.

pub mod body;
pub mod front_matter;
pub mod pipeline;

use super::{
    core::{ParseError, ParseResult, Parser},
    prelude::*,
};
use crate::tokenizer::{literal::unquote, TokenKind, TokenSpan};

/// Any token of `kind`.
pub fn token(kind: TokenKind) -> impl Parser<TokenSpan, TokenSpan> {
    satisfy(
        move |t: &TokenSpan| if t.kind == kind { Some(t.clone()) } else { None },
        &kind.to_string(),
    )
}

/// A token of `kind` whose value is irrelevant.
pub fn punct(kind: TokenKind) -> impl Parser<TokenSpan, ()> {
    as_unit(token(kind))
}

pub fn identifier() -> impl Parser<TokenSpan, String> {
    satisfy(
        |t: &TokenSpan| match t.kind {
            TokenKind::Identifier => Some(t.text.clone()),
            _ => None,
        },
        "identifier",
    )
}

/// Identifier, keyword or quoted string used as a mapping key.
pub fn key() -> impl Parser<TokenSpan, String> {
    satisfy(
        |t: &TokenSpan| match t.kind {
            TokenKind::Identifier | TokenKind::Keyword(_) => Some(t.text.clone()),
            TokenKind::QuotedString => Some(unquote(&t.text)),
            _ => None,
        },
        "key",
    )
}

pub fn quoted_string() -> impl Parser<TokenSpan, String> {
    satisfy(
        |t: &TokenSpan| match t.kind {
            TokenKind::QuotedString => Some(unquote(&t.text)),
            _ => None,
        },
        "quoted string",
    )
}

pub fn number() -> impl Parser<TokenSpan, serde_json::Value> {
    satisfy(
        |t: &TokenSpan| match t.kind {
            TokenKind::Number => number_value(&t.text),
            _ => None,
        },
        "number",
    )
}

fn number_value(text: &str) -> Option<serde_json::Value> {
    if let Ok(int) = text.parse::<i64>() {
        return Some(serde_json::Value::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
}

pub fn boolean() -> impl Parser<TokenSpan, bool> {
    satisfy(
        |t: &TokenSpan| match t.kind {
            TokenKind::Boolean => Some(t.text == "true"),
            _ => None,
        },
        "boolean",
    )
}

/// Succeeds without consuming when the next token is not `kind`.
pub struct NotKind(pub TokenKind);

impl Parser<TokenSpan, ()> for NotKind {
    fn parse(&self, input: &[TokenSpan], pos: usize) -> ParseResult<()> {
        match input.get(pos) {
            Some(t) if t.kind == self.0 => Err(ParseError::unexpected(
                format!("anything but {}", self.0),
                t.to_string(),
                pos,
            )),
            _ => Ok((pos, ())),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::preprocessor::{Preprocessor, TriviaFilter};
    use crate::tokenizer::{tokenize, TokenKind, TokenSpan};

    /// Significant tokens of a one-line header value, e.g. `{ read | sort }`.
    pub fn header_value_tokens(value: &str) -> Vec<TokenSpan> {
        let tokens = tokenize(&format!("---\nk: {}\n---\n", value));
        let start = tokens
            .iter()
            .position(|t| t.kind == TokenKind::Colon)
            .map(|i| i + 1)
            .unwrap_or_default();
        let end = tokens
            .iter()
            .rposition(|t| t.kind == TokenKind::FrontMatterDelim)
            .unwrap_or(tokens.len());
        TriviaFilter.process(tokens[start..end].to_vec())
    }
}
