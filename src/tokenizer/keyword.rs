use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    combinator::{not, peek, recognize, value},
    error::context,
    sequence::{pair, terminated},
};
use serde::{Deserialize, Serialize};

use super::token::{ParserResult, TokenKind};

/// Reserved front-matter keys.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum Keyword {
    When,
    BeforeStreaming,
    OnStreaming,
    AfterStreaming,
    OnStreamingEnd,
}

pub fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

pub fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// Identifier body used by front-matter keys, agent and command names.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_identifier(input: &str) -> ParserResult<&str> {
    context(
        "identifier",
        recognize(pair(
            take_while1(is_identifier_start),
            take_while(is_identifier_char),
        )),
    )(input)
}

/// Variable names stop at `-` so `$name-suffix` keeps the suffix as text.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_variable_name(input: &str) -> ParserResult<&str> {
    context(
        "variable name",
        recognize(pair(
            take_while1(is_identifier_start),
            take_while(|c: char| c.is_alphanumeric() || c == '_'),
        )),
    )(input)
}

#[tracing::instrument(level = "debug", skip(input))]
fn parse_boolean(input: &str) -> ParserResult<TokenKind> {
    context(
        "boolean",
        value(
            TokenKind::Boolean,
            terminated(
                alt((tag("true"), tag("false"))),
                not(peek(take_while1(is_identifier_char))),
            ),
        ),
    )(input)
}

/// Parses a reserved keyword, a boolean or a plain identifier.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_word(input: &str) -> ParserResult<TokenKind> {
    if let Ok(found) = parse_boolean(input) {
        return Ok(found);
    }

    let (rest, word) = parse_identifier(input)?;
    match word.parse::<Keyword>() {
        Ok(kw) => Ok((rest, TokenKind::Keyword(kw))),
        Err(_) => Ok((rest, TokenKind::Identifier)),
    }
}
