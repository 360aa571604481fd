//! # Whitespace Tokens
//!
//! Whitespace and line breaks are kept as tokens so the token stream
//! reproduces the source byte for byte.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    combinator::value,
    error::context,
};

use super::token::{ParserResult, TokenKind};

/// Spaces and tabs.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_whitespace(input: &str) -> ParserResult<TokenKind> {
    context(
        "whitespace expected",
        value(
            TokenKind::Whitespace,
            take_while1(|c| c == ' ' || c == '\t'),
        ),
    )(input)
}

/// `\n` or `\r\n`.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_newline(input: &str) -> ParserResult<TokenKind> {
    context(
        "newline expected",
        value(TokenKind::Newline, alt((tag("\r\n"), tag("\n")))),
    )(input)
}

/// Returns true when the line starting at `input` is a `---` delimiter line.
pub fn is_delimiter_line(input: &str) -> bool {
    let line = input.split('\n').next().unwrap_or_default();
    line.trim() == "---"
}

/// True when the first non-blank line of the document is a `---` delimiter.
pub fn starts_with_front_matter(input: &str) -> bool {
    input
        .split('\n')
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim() == "---")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace() {
        let (rest, kind) = parse_whitespace(" \t hello").unwrap();
        assert_eq!(kind, TokenKind::Whitespace);
        assert_eq!(rest, "hello");
        assert!(parse_whitespace("hello").is_err());
    }

    #[test]
    fn test_newline() {
        assert_eq!(parse_newline("\nx").unwrap(), ("x", TokenKind::Newline));
        assert_eq!(parse_newline("\r\nx").unwrap(), ("x", TokenKind::Newline));
        assert!(parse_newline("x").is_err());
    }

    #[test]
    fn test_front_matter_detection() {
        assert!(starts_with_front_matter("---\nname: a\n---"));
        assert!(starts_with_front_matter("\n  \n---  \nname: a\n---"));
        assert!(!starts_with_front_matter("text\n---\n"));
        assert!(!starts_with_front_matter(""));
        assert!(is_delimiter_line("--- \nrest"));
        assert!(!is_delimiter_line("----\n"));
    }
}
