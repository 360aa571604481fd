use nom::{
    character::complete::{char, digit1},
    combinator::{opt, recognize, value},
    error::{context, VerboseError, VerboseErrorKind},
    sequence::{pair, tuple},
};

use super::token::{ParserResult, TokenKind};

/// Recognizes a single-line run enclosed in `delim`, honoring backslash escapes.
fn delimited_run(input: &str, delim: char) -> ParserResult<&str> {
    let (body, _) = char(delim)(input)?;
    let mut escaped = false;
    for (idx, c) in body.char_indices() {
        if c == '\n' {
            break;
        }
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }
        if c == delim {
            let end = delim.len_utf8() + idx + c.len_utf8();
            return Ok((&input[end..], &input[..end]));
        }
    }
    Err(nom::Err::Error(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context("unterminated literal"))],
    }))
}

/// `"text"` or `'text'`.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_quoted_string(input: &str) -> ParserResult<TokenKind> {
    let (rest, _) = delimited_run(input, '"').or_else(|_| delimited_run(input, '\''))?;
    Ok((rest, TokenKind::QuotedString))
}

/// `/regex/` in the front-matter header.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_pattern(input: &str) -> ParserResult<TokenKind> {
    let (rest, _) = delimited_run(input, '/')?;
    Ok((rest, TokenKind::PatternExpr))
}

/// Integer or decimal number with an optional leading minus.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_number(input: &str) -> ParserResult<TokenKind> {
    context(
        "number",
        value(
            TokenKind::Number,
            recognize(tuple((
                opt(char('-')),
                digit1,
                opt(pair(char('.'), digit1)),
            ))),
        ),
    )(input)
}

/// Strips the quotes of a quoted-string token and resolves escapes.
pub fn unquote(text: &str) -> String {
    let inner = match text.chars().next() {
        Some(q @ ('"' | '\'')) if text.len() >= 2 && text.ends_with(q) => &text[1..text.len() - 1],
        _ => text,
    };
    unescape(inner)
}

/// Inner text of a `/pattern/` token with escaped slashes restored.
pub fn pattern_body(text: &str) -> String {
    let inner = text
        .strip_prefix('/')
        .and_then(|t| t.strip_suffix('/'))
        .unwrap_or(text);
    inner.replace("\\/", "/")
}

fn unescape(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Quotes `value` so that [`unquote`] returns it unchanged.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
